use std::fmt::{Debug, Formatter};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crc::Crc;
use crate::message::{Channel, Flags, Priority, SequenceNumber};
use crate::p2p::{P2pData, AUTHENTICATOR_LEN, MAX_COOKIE_LEN};

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// maximum number of acks that are piggy-backed on a single outgoing datagram
pub const MAX_PIGGYBACKED_ACKS: usize = 8;
/// upper bound for the serialized ack list: varint count + (channel, sequence number) per ack
pub const MAX_ACK_LIST_LEN: usize = 1 + MAX_PIGGYBACKED_ACKS * 3;

/// The P2P handshake material carried by a SYN
#[derive(Clone, Eq, PartialEq)]
pub struct P2pSyn {
    pub cookie: Vec<u8>,
    pub authenticator: [u8; AUTHENTICATOR_LEN],
}

impl P2pSyn {
    pub fn new(p2p: &P2pData, syn_sequence_number: SequenceNumber) -> P2pSyn {
        P2pSyn {
            cookie: p2p.cookie().to_vec(),
            authenticator: p2p.authenticator(syn_sequence_number),
        }
    }
}

/// The header of a datagram. Every datagram carries exactly one message (or none for a pure
///  ack / heartbeat), and optionally acks for messages received from the peer.
#[derive(Clone, Eq, PartialEq)]
pub struct PacketHeader {
    /// only SYN and RST - ACK and P2P are derived from `acks` and `p2p` during serialization
    pub flags: Flags,
    pub channel: Channel,
    pub priority: Priority,
    pub sequence_number: SequenceNumber,
    pub acks: Vec<(Channel, SequenceNumber)>,
    pub p2p: Option<P2pSyn>,
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let acks = if self.acks.is_empty() {
            "".to_string()
        }
        else {
            let acks = self.acks.iter()
                .map(|(c, s)| format!("{}@{}", c, s))
                .collect::<Vec<_>>();
            format!("[ACK {}]", acks.join(","))
        };
        let p2p = if self.p2p.is_some() { "[P2P]" } else { "" };

        write!(f, "PCKT{{{}@{}:{:?}{}{}}}", self.channel, self.sequence_number, self.flags, acks, p2p)
    }
}

impl PacketHeader {
    pub const PROTOCOL_VERSION_1: u8 = 1;

    /// checksum, version, flags, channel, priority, sequence number
    pub const FIXED_LEN: usize = size_of::<u32>()
        + size_of::<u8>()
        + size_of::<u8>()
        + size_of::<u8>()
        + size_of::<u8>()
        + size_of::<u16>();

    /// A header without acks or P2P material
    pub fn new(flags: Flags, channel: Channel, priority: Priority, sequence_number: SequenceNumber) -> PacketHeader {
        PacketHeader {
            flags,
            channel,
            priority,
            sequence_number,
            acks: Vec::new(),
            p2p: None,
        }
    }

    /// control datagram that carries only acks, or nothing at all as a heartbeat
    pub fn pure_ack(acks: Vec<(Channel, SequenceNumber)>) -> PacketHeader {
        PacketHeader {
            acks,
            ..Self::new(Flags::empty(), Channel::CONTROL, Priority::High, SequenceNumber::ZERO)
        }
    }

    pub fn is_pure_ack(&self) -> bool {
        self.channel.is_control() && !self.flags.intersects(Flags::SYN | Flags::RST)
    }

    /// Writes the complete datagram (header and payload) to `buf`, including the checksum
    pub fn ser_datagram(&self, payload: &[u8], buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u32(0); // placeholder for the checksum

        let mut flags = self.flags & (Flags::SYN | Flags::RST);
        if !self.acks.is_empty() {
            flags |= Flags::ACK;
        }
        if self.p2p.is_some() {
            flags |= Flags::P2P;
        }

        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u8(flags.bits());
        buf.put_u8(self.channel.to_raw());
        buf.put_u8(self.priority.into());
        buf.put_u16(self.sequence_number.to_raw());

        if !self.acks.is_empty() {
            buf.put_usize_varint(self.acks.len());
            for (channel, seq) in &self.acks {
                buf.put_u8(channel.to_raw());
                buf.put_u16(seq.to_raw());
            }
        }

        if let Some(p2p) = &self.p2p {
            buf.put_u8(p2p.cookie.len() as u8);
            buf.put_slice(&p2p.cookie);
            buf.put_slice(&p2p.authenticator);
        }

        buf.put_slice(payload);

        let checksum = CHECKSUM.checksum(&buf[start + 4..]);
        buf[start..start + 4].copy_from_slice(&checksum.to_be_bytes());
    }

    /// Parses and validates a complete datagram, returning the header and the payload
    pub fn deser_datagram(datagram: &[u8]) -> anyhow::Result<(PacketHeader, &[u8])> {
        let mut buf = datagram;

        let checksum = buf.try_get_u32()?;
        if checksum != CHECKSUM.checksum(buf) {
            bail!("checksum mismatch");
        }

        let protocol_version = buf.try_get_u8()?;
        if protocol_version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", protocol_version);
        }

        let raw_flags = buf.try_get_u8()?;
        let flags = Flags::from_bits(raw_flags)
            .ok_or_else(|| anyhow!("unsupported flags {:x}", raw_flags))?;

        let channel = Channel::from_raw(buf.try_get_u8()?);
        let priority = Priority::try_from(buf.try_get_u8()?)?;
        let sequence_number = SequenceNumber::from_raw(buf.try_get_u16()?);

        if !channel.is_control() && flags.intersects(Flags::SYN | Flags::RST | Flags::P2P) {
            bail!("control flags on data channel {}", channel);
        }
        if flags.contains(Flags::P2P) && !flags.contains(Flags::SYN) {
            bail!("P2P material without SYN");
        }

        let mut acks = Vec::new();
        if flags.contains(Flags::ACK) {
            let num_acks = buf.try_get_usize_varint()?;
            if num_acks == 0 || num_acks > buf.remaining() / 3 {
                bail!("invalid number of acks: {}", num_acks);
            }
            for _ in 0..num_acks {
                let channel = Channel::from_raw(buf.try_get_u8()?);
                let seq = SequenceNumber::from_raw(buf.try_get_u16()?);
                acks.push((channel, seq));
            }
        }

        let p2p = if flags.contains(Flags::P2P) {
            let cookie_len = buf.try_get_u8()? as usize;
            if cookie_len == 0 || cookie_len > MAX_COOKIE_LEN {
                bail!("invalid P2P cookie length {}", cookie_len);
            }
            if buf.remaining() < cookie_len + AUTHENTICATOR_LEN {
                bail!("truncated P2P material");
            }
            let cookie = buf[..cookie_len].to_vec();
            buf.advance(cookie_len);
            let mut authenticator = [0u8; AUTHENTICATOR_LEN];
            buf.copy_to_slice(&mut authenticator);
            Some(P2pSyn { cookie, authenticator })
        }
        else {
            None
        };

        let header = PacketHeader {
            flags: flags & (Flags::SYN | Flags::RST),
            channel,
            priority,
            sequence_number,
            acks,
            p2p,
        };
        Ok((header, buf))
    }
}
