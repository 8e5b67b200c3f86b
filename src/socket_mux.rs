use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use crate::address::{addr_eq, ip_eq, is_any_addr};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkInterface {
    pub name: String,
    pub addr: IpAddr,
}

/// A bound UDP socket. Dropping it closes the socket.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BoundSocket: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddr;

    async fn send_to(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()>;

    /// Receives a single datagram. If the datagram is bigger than `buf`, the excess is discarded.
    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)>;
}

/// The platform's socket layer, introduced to facilitate replacing the I/O part for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlatformBinding: Send + Sync + 'static {
    fn network_interfaces(&self) -> anyhow::Result<Vec<NetworkInterface>>;

    async fn open_socket(&self, addr: SocketAddr) -> anyhow::Result<Arc<dyn BoundSocket>>;
}

/// The outbound side of the multiplexer as seen by connections
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSender: Send + Sync + 'static {
    /// Sends from the bound socket with address `from`, or through all bound sockets if the
    ///  port of `from` is 0. Send errors are logged and otherwise ignored.
    async fn send_datagram(&self, from: SocketAddr, to: SocketAddr, datagram: &[u8]);
}

/// Receives every complete inbound datagram together with the address of the socket it arrived on
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn on_datagram(&self, inbound: SocketAddr, remote: SocketAddr, datagram: &[u8]);
}


pub struct TokioBinding;

#[async_trait]
impl PlatformBinding for TokioBinding {
    fn network_interfaces(&self) -> anyhow::Result<Vec<NetworkInterface>> {
        let result = if_addrs::get_if_addrs()?
            .into_iter()
            .filter(|i| match i.ip() {
                // link-local addresses require a scope id to bind
                IpAddr::V6(ip) => (ip.segments()[0] & 0xffc0) != 0xfe80,
                IpAddr::V4(_) => true,
            })
            .map(|i| NetworkInterface {
                addr: i.ip(),
                name: i.name,
            })
            .collect();
        Ok(result)
    }

    async fn open_socket(&self, addr: SocketAddr) -> anyhow::Result<Arc<dyn BoundSocket>> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(Arc::new(TokioSocket { socket, local_addr }))
    }
}

struct TokioSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

#[async_trait]
impl BoundSocket for TokioSocket {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_to(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        self.socket.send_to(datagram, to).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }
}


/// One logical UDP end point bound to several network interfaces, all sharing the same port.
///
/// All connections of an end point share a single multiplexer. Sockets are closed when the
///  multiplexer (and the receive loops holding on to them) are dropped.
pub struct UdpMultiplexer {
    sockets: Vec<Arc<dyn BoundSocket>>,
    local_port: u16,
}

impl Debug for UdpMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpMultiplexer{{port:{},{:?}}}", self.local_port, self.bound_addrs())
    }
}

impl UdpMultiplexer {
    /// Binds one socket per network interface that matches `local_addr`: same address family,
    ///  and same IP address unless `local_addr` is an 'any' address. If the port is 0, the
    ///  ephemeral port assigned to the first socket is used for all others.
    ///
    /// Fails if any of the binds fails, or if no interface matches. Sockets that were bound
    ///  before the failure are closed.
    pub async fn open(binding: &dyn PlatformBinding, local_addr: SocketAddr) -> anyhow::Result<UdpMultiplexer> {
        let interfaces = binding.network_interfaces()?;
        let is_any = is_any_addr(&local_addr);

        let mut local_port = local_addr.port();
        let mut sockets = Vec::new();

        for interface in interfaces {
            if interface.addr.is_ipv4() != local_addr.is_ipv4() {
                continue;
            }
            if !is_any && !ip_eq(&interface.addr, &local_addr.ip()) {
                continue;
            }

            let bind_addr = SocketAddr::new(interface.addr, local_port);
            let socket = match binding.open_socket(bind_addr).await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("could not bind to {:?} on interface {}: {}", bind_addr, interface.name, e);
                    bail!("could not bind to {:?} on interface {}: {}", bind_addr, interface.name, e);
                }
            };

            if local_port == 0 {
                local_port = socket.local_addr().port();
            }
            debug!("bound socket to {:?} on interface {}", socket.local_addr(), interface.name);
            sockets.push(socket);
        }

        if sockets.is_empty() {
            bail!("no network interface matches {:?}", local_addr);
        }

        let result = UdpMultiplexer {
            sockets,
            local_port,
        };
        info!("opened {:?}", result);
        Ok(result)
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn bound_addrs(&self) -> Vec<SocketAddr> {
        self.sockets.iter()
            .map(|s| s.local_addr())
            .collect()
    }

    /// Sends through the socket bound to `from`, or through all sockets of `to`'s address
    ///  family if `from` has port 0. Returns the number of sockets the datagram was sent from.
    pub async fn send_data(&self, from: SocketAddr, to: SocketAddr, datagram: &[u8]) -> usize {
        let mut num_sent = 0;
        for socket in &self.sockets {
            let local_addr = socket.local_addr();
            let selected = if from.port() == 0 {
                local_addr.is_ipv4() == to.is_ipv4()
            }
            else {
                addr_eq(&from, &local_addr)
            };
            if !selected {
                continue;
            }

            trace!("sending {} bytes from {:?} to {:?}", datagram.len(), local_addr, to);
            match socket.send_to(to, datagram).await {
                Ok(()) => num_sent += 1,
                Err(e) => error!("error sending UDP datagram from {:?} to {:?}: {}", local_addr, to, e),
            }
        }

        if num_sent == 0 {
            debug!("no bound socket could send from {:?} to {:?}", from, to);
        }
        num_sent
    }

    /// Spawns one receive loop per socket that passes every complete datagram to `handler`.
    ///  Datagrams longer than `max_datagram_len` are dropped since they may have been truncated.
    pub fn spawn_receive_loops(&self, handler: Arc<dyn DatagramHandler>, max_datagram_len: usize) -> Vec<JoinHandle<()>> {
        self.sockets.iter()
            .map(|socket| {
                let socket = socket.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    Self::recv_loop(socket, handler, max_datagram_len).await
                })
            })
            .collect()
    }

    async fn recv_loop(socket: Arc<dyn BoundSocket>, handler: Arc<dyn DatagramHandler>, max_datagram_len: usize) {
        let local_addr = socket.local_addr();
        info!("starting receive loop on {:?}", local_addr);

        let mut buf = vec![0u8; max_datagram_len + 1];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error on {:?}: {}", local_addr, e);
                    continue;
                }
            };

            if num_read > max_datagram_len {
                debug!("datagram from {:?} exceeds the maximum length of {} - dropping", from, max_datagram_len);
                continue;
            }

            trace!("received {} bytes on {:?} from {:?}", num_read, local_addr, from);
            handler.on_datagram(local_addr, from, &buf[..num_read]).await;
        }
    }
}

#[async_trait]
impl DatagramSender for UdpMultiplexer {
    async fn send_datagram(&self, from: SocketAddr, to: SocketAddr, datagram: &[u8]) {
        self.send_data(from, to, datagram).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use rstest::rstest;
    use crate::test_util::{FakeBinding, FakeNetwork};

    fn addr(s: &str) -> SocketAddr {
        SocketAddr::from_str(s).unwrap()
    }

    fn interfaces() -> Vec<NetworkInterface> {
        vec![
            NetworkInterface { name: "lo".to_string(), addr: IpAddr::from_str("127.0.0.1").unwrap() },
            NetworkInterface { name: "eth0".to_string(), addr: IpAddr::from_str("10.0.0.1").unwrap() },
            NetworkInterface { name: "lo6".to_string(), addr: IpAddr::from_str("::1").unwrap() },
            NetworkInterface { name: "eth1".to_string(), addr: IpAddr::from_str("192.168.1.1").unwrap() },
        ]
    }

    /// Socket that counts how often it was closed
    struct ClosingSocket {
        local_addr: SocketAddr,
        closed: Arc<AtomicUsize>,
    }
    impl Drop for ClosingSocket {
        fn drop(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
    #[async_trait]
    impl BoundSocket for ClosingSocket {
        fn local_addr(&self) -> SocketAddr {
            self.local_addr
        }
        async fn send_to(&self, _to: SocketAddr, _datagram: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
        async fn recv_from(&self, _buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
            std::future::pending().await
        }
    }

    /// binding that assigns port 40000 to port 0 requests and fails for addresses in `failing`
    fn mock_binding(failing: Vec<IpAddr>, closed: Arc<AtomicUsize>, requested: Arc<Mutex<Vec<SocketAddr>>>) -> MockPlatformBinding {
        let mut binding = MockPlatformBinding::new();
        binding.expect_network_interfaces()
            .returning(|| Ok(interfaces()));
        binding.expect_open_socket()
            .returning(move |addr| {
                requested.lock().unwrap().push(addr);
                if failing.contains(&addr.ip()) {
                    bail!("address in use");
                }
                let port = if addr.port() == 0 { 40000 } else { addr.port() };
                let socket: Arc<dyn BoundSocket> = Arc::new(ClosingSocket {
                    local_addr: SocketAddr::new(addr.ip(), port),
                    closed: closed.clone(),
                });
                Ok(socket)
            });
        binding
    }

    #[rstest]
    #[case::any_v4_ephemeral("0.0.0.0:0", vec!["127.0.0.1:0", "10.0.0.1:40000", "192.168.1.1:40000"], 40000)]
    #[case::any_v4_fixed("0.0.0.0:7000", vec!["127.0.0.1:7000", "10.0.0.1:7000", "192.168.1.1:7000"], 7000)]
    #[case::any_v6("[::]:0", vec!["[::1]:0"], 40000)]
    #[case::specific("10.0.0.1:0", vec!["10.0.0.1:0"], 40000)]
    #[case::specific_fixed("192.168.1.1:9", vec!["192.168.1.1:9"], 9)]
    #[tokio::test]
    async fn test_open(#[case] local_addr: &str, #[case] expected_requests: Vec<&str>, #[case] expected_port: u16) {
        let closed = Arc::new(AtomicUsize::new(0));
        let requested = Arc::new(Mutex::new(Vec::new()));
        let binding = mock_binding(vec![], closed.clone(), requested.clone());

        let mux = UdpMultiplexer::open(&binding, addr(local_addr)).await.unwrap();

        let expected_requests = expected_requests.into_iter().map(addr).collect::<Vec<_>>();
        assert_eq!(*requested.lock().unwrap(), expected_requests);
        assert_eq!(mux.local_port(), expected_port);
        assert_eq!(mux.bound_addrs().len(), expected_requests.len());
        assert!(mux.bound_addrs().iter().all(|a| a.port() == expected_port));

        drop(mux);
        assert_eq!(closed.load(Ordering::SeqCst), expected_requests.len());
    }

    #[rstest]
    #[case::no_matching_interface("10.9.9.9:0")]
    #[tokio::test]
    async fn test_open_without_matching_interface(#[case] local_addr: &str) {
        let closed = Arc::new(AtomicUsize::new(0));
        let requested = Arc::new(Mutex::new(Vec::new()));
        let binding = mock_binding(vec![], closed.clone(), requested.clone());

        assert!(UdpMultiplexer::open(&binding, addr(local_addr)).await.is_err());
        assert!(requested.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_releases_partially_bound_sockets() {
        let closed = Arc::new(AtomicUsize::new(0));
        let requested = Arc::new(Mutex::new(Vec::new()));
        let binding = mock_binding(vec![IpAddr::from_str("192.168.1.1").unwrap()], closed.clone(), requested.clone());

        assert!(UdpMultiplexer::open(&binding, addr("0.0.0.0:0")).await.is_err());
        assert_eq!(requested.lock().unwrap().len(), 3);
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_open_fails_if_interfaces_can_not_be_enumerated() {
        let mut binding = MockPlatformBinding::new();
        binding.expect_network_interfaces()
            .returning(|| Err(anyhow::anyhow!("permission denied")));
        binding.expect_open_socket()
            .never();

        assert!(UdpMultiplexer::open(&binding, addr("0.0.0.0:0")).await.is_err());
    }

    fn mock_socket(local_addr: &str, expected_sends: usize) -> Arc<dyn BoundSocket> {
        let mut socket = MockBoundSocket::new();
        socket.expect_local_addr()
            .return_const(addr(local_addr));
        socket.expect_send_to()
            .withf(|to, datagram| *to == addr("10.0.0.99:5000") && datagram == b"abc")
            .times(expected_sends)
            .returning(|_, _| Ok(()));
        Arc::new(socket)
    }

    #[rstest]
    #[case::from_specific("10.0.0.1:7000", [0, 1, 0], 1)]
    #[case::from_other("127.0.0.1:7000", [1, 0, 0], 1)]
    #[case::from_all("0.0.0.0:0", [1, 1, 0], 2)]
    #[case::from_unknown("10.0.0.2:7000", [0, 0, 0], 0)]
    #[case::wrong_port("10.0.0.1:7001", [0, 0, 0], 0)]
    #[tokio::test]
    async fn test_send_data(#[case] from: &str, #[case] expected_sends: [usize; 3], #[case] expected_num_sent: usize) {
        let mux = UdpMultiplexer {
            sockets: vec![
                mock_socket("127.0.0.1:7000", expected_sends[0]),
                mock_socket("10.0.0.1:7000", expected_sends[1]),
                mock_socket("[::1]:7000", expected_sends[2]),
            ],
            local_port: 7000,
        };

        assert_eq!(mux.send_data(addr(from), addr("10.0.0.99:5000"), b"abc").await, expected_num_sent);
    }

    struct CollectingHandler(Mutex<Vec<(SocketAddr, SocketAddr, Vec<u8>)>>);
    #[async_trait]
    impl DatagramHandler for CollectingHandler {
        async fn on_datagram(&self, inbound: SocketAddr, remote: SocketAddr, datagram: &[u8]) {
            self.0.lock().unwrap().push((inbound, remote, datagram.to_vec()));
        }
    }

    #[tokio::test]
    async fn test_receive_loops() {
        let network = FakeNetwork::new();
        let binding = FakeBinding::new(network.clone(), vec!["10.0.0.1", "10.0.0.2"]);
        let mux = UdpMultiplexer::open(&binding, addr("0.0.0.0:7000")).await.unwrap();

        let handler = Arc::new(CollectingHandler(Mutex::new(Vec::new())));
        let handles = mux.spawn_receive_loops(handler.clone(), 10);
        assert_eq!(handles.len(), 2);

        let peer_binding = FakeBinding::new(network.clone(), vec!["10.0.0.9"]);
        let peer = peer_binding.open_socket(addr("10.0.0.9:5000")).await.unwrap();
        peer.send_to(addr("10.0.0.2:7000"), b"hello").await.unwrap();
        peer.send_to(addr("10.0.0.1:7000"), b"this is too long").await.unwrap();
        peer.send_to(addr("10.0.0.1:7000"), b"world").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.0.lock().unwrap().len() < 2 {
                tokio::task::yield_now().await;
            }
        }).await.unwrap();

        let mut received = handler.0.lock().unwrap().clone();
        received.sort();
        assert_eq!(received, vec![
            (addr("10.0.0.1:7000"), addr("10.0.0.9:5000"), b"world".to_vec()),
            (addr("10.0.0.2:7000"), addr("10.0.0.9:5000"), b"hello".to_vec()),
        ]);

        for h in handles {
            h.abort();
        }
    }
}
