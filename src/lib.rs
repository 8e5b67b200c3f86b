//! Reliable, message oriented transport on top of UDP.
//!
//! An [end_point::EndPoint] binds one UDP socket per local network interface, all sharing the
//!  same port, and multiplexes any number of connections over them. Each connection has up to
//!  255 independent channels: messages on a channel are delivered exactly once and in order,
//!  while channels do not block each other. Lost datagrams are retransmitted based on a
//!  round trip time estimate, and acknowledgements are piggy-backed on outgoing traffic where
//!  possible.
//!
//! Connections are opened by a SYN handshake and closed by an exchange of RSTs. Peer-to-peer
//!  connections are opened simultaneously by both sides, with each SYN carrying a cookie and an
//!  authenticator derived from a shared secret.
//!
//! ```ascii
//! 0: checksum (u32 BE, CRC-32C over the rest of the datagram)
//! 4: protocol version (u8)
//! 5: flags (u8): SYN=1, RST=2, ACK=4, P2P=8
//! 6: channel (u8), 255 for control messages
//! 7: priority (u8)
//! 8: sequence number (u16 BE)
//! *: if ACK: number of acks (varint), followed by (channel u8, sequence number u16 BE) pairs
//! *: if P2P: cookie length (u8), cookie, authenticator (32 bytes)
//! *: payload
//! ```

pub mod address;
pub mod config;
pub mod conn_params;
pub mod connection;
pub mod end_point;
pub mod message;
pub mod p2p;
pub mod packet_header;
pub mod receive_channel;
pub mod rto;
pub mod sender_buffer;
pub mod socket_mux;

#[cfg(test)] mod test_util;
