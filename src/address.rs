use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Total order on transport addresses, used for routing and socket lookup: IPv4 sorts before
///  IPv6, then the raw IP bits, then the port.
///
/// NB: IPv6 flow info and scope id are not part of the comparison - two addresses that differ
///      only in those refer to the same peer as far as routing is concerned
pub fn compare(a: &SocketAddr, b: &SocketAddr) -> Ordering {
    match (a, b) {
        (SocketAddr::V4(a), SocketAddr::V4(b)) => a.ip().to_bits().cmp(&b.ip().to_bits())
            .then(a.port().cmp(&b.port())),
        (SocketAddr::V6(a), SocketAddr::V6(b)) => a.ip().to_bits().cmp(&b.ip().to_bits())
            .then(a.port().cmp(&b.port())),
        (SocketAddr::V4(_), SocketAddr::V6(_)) => Ordering::Less,
        (SocketAddr::V6(_), SocketAddr::V4(_)) => Ordering::Greater,
    }
}

pub fn addr_eq(a: &SocketAddr, b: &SocketAddr) -> bool {
    compare(a, b) == Ordering::Equal
}

pub fn ip_eq(a: &IpAddr, b: &IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.to_bits() == b.to_bits(),
        (IpAddr::V6(a), IpAddr::V6(b)) => a.to_bits() == b.to_bits(),
        _ => false,
    }
}

/// true for 0.0.0.0 and ::, regardless of the port
pub fn is_any_addr(addr: &SocketAddr) -> bool {
    addr.ip().is_unspecified()
}

/// The 'any' address of the same family as `addr`, with port 0. Used as a send-from address,
///  it means "send through every bound socket".
pub fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// A [SocketAddr] wrapper whose equality, ordering and hashing follow [compare], for use as
///  a map key
#[derive(Clone, Copy)]
pub struct AddrKey(pub SocketAddr);

impl PartialEq for AddrKey {
    fn eq(&self, other: &Self) -> bool {
        addr_eq(&self.0, &other.0)
    }
}
impl Eq for AddrKey {}

impl PartialOrd for AddrKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for AddrKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(&self.0, &other.0)
    }
}

impl Hash for AddrKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.0 {
            SocketAddr::V4(s) => {
                state.write_u8(4);
                s.ip().to_bits().hash(state);
            }
            SocketAddr::V6(s) => {
                state.write_u8(6);
                s.ip().to_bits().hash(state);
            }
        };
        self.0.port().hash(state);
    }
}

impl Debug for AddrKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for AddrKey {
    fn from(addr: SocketAddr) -> Self {
        AddrKey(addr)
    }
}
