use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use anyhow::bail;
use bitflags::bitflags;
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::p2p::{AUTHENTICATOR_LEN, MAX_COOKIE_LEN};
use crate::packet_header::{PacketHeader, MAX_ACK_LIST_LEN};

/// Identifies one of the independent ordered-delivery sequence spaces of a connection. The
///  highest value is reserved for the control channel that carries SYN and RST messages.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Channel(u8);

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_control() {
            write!(f, "CTL")
        }
        else {
            write!(f, "{}", self.0)
        }
    }
}

impl Channel {
    pub const CONTROL: Channel = Channel(u8::MAX);

    /// A channel for application data
    pub fn user(raw: u8) -> anyhow::Result<Channel> {
        if raw == Self::CONTROL.0 {
            bail!("channel {} is reserved for control messages", raw);
        }
        Ok(Channel(raw))
    }

    pub fn from_raw(raw: u8) -> Channel {
        Channel(raw)
    }

    pub fn to_raw(&self) -> u8 {
        self.0
    }

    pub fn is_control(&self) -> bool {
        *self == Self::CONTROL
    }
}

/// 16 bit sequence number, wrapping around. Comparisons use serial number arithmetic, so they
///  are only meaningful for numbers less than half the number space apart.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SequenceNumber(u16);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }

    /// signed distance from `other` to `self`, i.e. positive if `self` is newer
    pub fn distance_from(&self, other: SequenceNumber) -> i32 {
        self.0.wrapping_sub(other.0) as i16 as i32
    }

    pub fn is_newer_than(&self, other: SequenceNumber) -> bool {
        self.distance_from(other) > 0
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        const SYN = 0b0000_0001;
        const RST = 0b0000_0010;

        // wire-level only: set by the codec, never part of a Message's flags
        const ACK = 0b0000_0100;
        const P2P = 0b0000_1000;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Default = 1,
    High = 2,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Default
    }
}

/// The payload ownership binding: application data carried by a [Message]. The payload is
///  released by dropping it, which happens exactly once, when the last handle to the owning
///  message goes away.
pub trait Payload: Send + Sync + 'static {
    fn as_bytes(&self) -> &[u8];

    fn len(&self) -> usize {
        self.as_bytes().len()
    }
}

impl Payload for Bytes {
    fn as_bytes(&self) -> &[u8] {
        self.as_ref()
    }
}

impl Payload for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self.as_slice()
    }
}

/// A message as it is represented on the sender side. Messages are immutable once created and
///  shared as `Arc<Message>`: the sender buffer and the send path may hold the same message at
///  the same time, and it is freed (releasing its payload) when the last of them drops it.
///
/// NB: The time at which a message was registered for retransmission is deliberately not part of
///      the message but belongs to the [crate::sender_buffer::SenderBuffer] entry
pub struct Message {
    channel: Channel,
    sequence_number: SequenceNumber,
    flags: Flags,
    priority: Priority,
    payload: Option<Box<dyn Payload>>,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MSG{{{}@{}:{:?}:{:?}:{}}}", self.channel, self.sequence_number, self.flags, self.priority, self.payload_len())
    }
}

impl Message {
    fn control(flags: Flags, sequence_number: SequenceNumber) -> Arc<Message> {
        Arc::new(Message {
            channel: Channel::CONTROL,
            sequence_number,
            flags,
            priority: Priority::High,
            payload: None,
        })
    }

    pub fn syn(sequence_number: SequenceNumber) -> Arc<Message> {
        Self::control(Flags::SYN, sequence_number)
    }

    /// SYN+RST is the answer to a SYN that is rejected
    pub fn syn_rst(sequence_number: SequenceNumber) -> Arc<Message> {
        Self::control(Flags::SYN | Flags::RST, sequence_number)
    }

    pub fn rst(sequence_number: SequenceNumber) -> Arc<Message> {
        Self::control(Flags::RST, sequence_number)
    }

    pub fn data(channel: Channel, sequence_number: SequenceNumber, payload: impl Payload, priority: Priority) -> anyhow::Result<Arc<Message>> {
        if channel.is_control() {
            bail!("data messages can not be sent on the control channel");
        }

        Ok(Arc::new(Message {
            channel,
            sequence_number,
            flags: Flags::empty(),
            priority,
            payload: Some(Box::new(payload)),
        }))
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_ref()
            .map(|p| p.as_bytes())
            .unwrap_or(&[])
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref()
            .map(|p| p.len())
            .unwrap_or(0)
    }

    pub fn is_control(&self) -> bool {
        self.channel.is_control()
    }

    /// An upper bound for the size of the datagram carrying this message, including the
    ///  maximum list of piggy-backed acks and, for SYN messages, P2P handshake material.
    pub fn approximate_size(&self) -> usize {
        let p2p_len = if self.flags.contains(Flags::SYN) {
            1 + MAX_COOKIE_LEN + AUTHENTICATOR_LEN
        }
        else {
            0
        };

        PacketHeader::FIXED_LEN + MAX_ACK_LIST_LEN + p2p_len + self.payload_len()
    }
}
