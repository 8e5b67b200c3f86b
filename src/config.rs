use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use anyhow::bail;
use crate::packet_header::PacketHeader;

/// Parameters for the retransmission timeout estimator
#[derive(Clone, Copy, Debug)]
pub struct RtoConfig {
    /// RTO before the first RTT sample is available
    pub initial_rto: Duration,
    pub min_rto: Duration,
    /// upper bound, also for the exponential backoff after timeouts
    pub max_rto: Duration,
}

impl Default for RtoConfig {
    fn default() -> Self {
        RtoConfig {
            initial_rto: Duration::from_millis(1000),
            min_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RudpConfig {
    /// The local address to bind to. An 'any' address (0.0.0.0 or ::) binds one socket per
    ///  network interface of that family, a concrete address binds only matching interfaces.
    ///  Port 0 picks an ephemeral port that is then shared by all bound sockets.
    pub self_addr: SocketAddr,

    /// Whether SYNs from unknown peers create server connections. If false, they are answered
    ///  with SYN+RST.
    pub accept_connections: bool,

    /// This is the payload size inside UDP packets that the protocol assumes. Packets are never
    ///  fragmented, so this size must be supported by all network connections between peers.
    ///
    /// With full Ethernet frames and no optional IP headers, this payload is `1500 - 20 - 8 = 1472`
    ///  for IPV4 and `1500 - 40 - 8 = 1452` for IPV6. Choosing this value too big causes packets
    ///  to be dropped, choosing it too small wastes bandwidth. Received datagrams bigger than
    ///  this are discarded.
    pub payload_size_inside_udp: usize,

    /// interval of the housekeeping timer that drives retransmission, heartbeats and timeouts
    pub tick_interval: Duration,

    pub handshake_timeout: Duration,
    /// an established connection is dropped if nothing was received from the peer for this long
    pub connection_timeout: Duration,
    pub close_timeout: Duration,
    /// an (empty) ack is sent if nothing was sent to the peer for this long
    pub heartbeat_interval: Duration,

    pub rto: RtoConfig,

    /// maximum number of out-of-order messages buffered per receive channel
    pub receive_window_size: u16,
}

impl RudpConfig {
    pub fn default_ipv4() -> RudpConfig {
        RudpConfig {
            self_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            accept_connections: true,
            payload_size_inside_udp: 1472,
            tick_interval: Duration::from_millis(20),
            handshake_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            rto: RtoConfig::default(),
            receive_window_size: 1024,
        }
    }

    pub fn default_ipv6() -> RudpConfig {
        RudpConfig {
            self_addr: SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
            payload_size_inside_udp: 1452,
            ..Self::default_ipv4()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.payload_size_inside_udp < 100 {
            bail!("Payload size is too small");
        }
        if self.payload_size_inside_udp > 65507 {
            bail!("Payload size does not fit into a UDP datagram");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must not be zero");
        }
        if self.handshake_timeout.is_zero() || self.connection_timeout.is_zero() || self.close_timeout.is_zero() {
            bail!("timeouts must not be zero");
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must not be zero");
        }
        if self.heartbeat_interval >= self.connection_timeout {
            bail!("heartbeat interval must be shorter than the connection timeout");
        }
        if self.rto.min_rto.is_zero() || self.rto.min_rto > self.rto.initial_rto || self.rto.initial_rto > self.rto.max_rto {
            bail!("RTO configuration must satisfy 0 < min_rto <= initial_rto <= max_rto");
        }
        // must stay well below half the sequence number space for serial number arithmetic
        if self.receive_window_size == 0 || self.receive_window_size > 0x7fff {
            bail!("receive window size must be between 1 and {}", 0x7fff);
        }

        Ok(())
    }

    /// The biggest application payload that fits into a single datagram
    pub fn max_data_payload_len(&self) -> usize {
        self.payload_size_inside_udp.saturating_sub(PacketHeader::FIXED_LEN + crate::packet_header::MAX_ACK_LIST_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::ipv4(RudpConfig::default_ipv4())]
    #[case::ipv6(RudpConfig::default_ipv6())]
    fn test_defaults_are_valid(#[case] config: RudpConfig) {
        config.validate().unwrap();
        assert!(config.max_data_payload_len() > 1000);
        assert!(config.max_data_payload_len() < config.payload_size_inside_udp);
    }

    #[rstest]
    #[case::payload_small(|c: &mut RudpConfig| c.payload_size_inside_udp = 99)]
    #[case::payload_big(|c: &mut RudpConfig| c.payload_size_inside_udp = 65508)]
    #[case::tick(|c: &mut RudpConfig| c.tick_interval = Duration::ZERO)]
    #[case::handshake(|c: &mut RudpConfig| c.handshake_timeout = Duration::ZERO)]
    #[case::close(|c: &mut RudpConfig| c.close_timeout = Duration::ZERO)]
    #[case::heartbeat_vs_timeout(|c: &mut RudpConfig| c.heartbeat_interval = c.connection_timeout)]
    #[case::rto_min_zero(|c: &mut RudpConfig| c.rto.min_rto = Duration::ZERO)]
    #[case::rto_order(|c: &mut RudpConfig| c.rto.initial_rto = c.rto.max_rto + Duration::from_millis(1))]
    #[case::window_zero(|c: &mut RudpConfig| c.receive_window_size = 0)]
    #[case::window_big(|c: &mut RudpConfig| c.receive_window_size = 0x8000)]
    fn test_validate_rejects(#[case] modify: fn(&mut RudpConfig)) {
        let mut config = RudpConfig::default_ipv4();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
