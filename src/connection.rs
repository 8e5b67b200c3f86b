use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::address::{addr_eq, unspecified_for};
use crate::config::RudpConfig;
use crate::conn_params::{ConnParams, ConnectionType};
use crate::message::{Channel, Flags, Message, Payload, Priority, SequenceNumber};
use crate::p2p::P2pData;
use crate::packet_header::{P2pSyn, PacketHeader, MAX_PIGGYBACKED_ACKS};
use crate::receive_channel::{ReceiveChannel, ReceiveOutcome};
use crate::rto::RtoEstimator;
use crate::sender_buffer::SenderBuffer;
use crate::socket_mux::DatagramSender;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// SYN sent (client, P2P) or expected (server)
    Handshaking,
    Established,
    /// RST sent, waiting for the peer's RST or ack
    Closing,
    Closed,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DisconnectReason {
    /// closed locally, and the close either completed or timed out
    Closed,
    /// the peer sent a RST
    Reset,
    /// the peer rejected the SYN
    Refused,
    /// handshake or connection timeout
    Timeout,
    /// the peer's P2P handshake material did not match
    P2pMismatch,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    Established,
    Message { channel: Channel, payload: Bytes },
    Disconnected(DisconnectReason),
}

/// The protocol state of a single connection. All methods take the current time as a parameter,
///  and the caller is responsible for serializing calls (e.g. by holding the connection behind
///  a mutex). Events for the application are queued and retrieved through
///  [Connection::take_events].
pub struct Connection {
    config: Arc<RudpConfig>,
    conn_type: ConnectionType,
    state: ConnectionState,
    peer_addr: SocketAddr,
    /// the local address the peer's datagrams arrive on - until the first datagram arrives,
    ///  datagrams are sent through all bound sockets
    local_addr: Option<SocketAddr>,
    inbound_port: u16,
    p2p: Option<P2pData>,
    sender: Arc<dyn DatagramSender>,

    sender_buffer: SenderBuffer,
    rto: RtoEstimator,

    next_control_seq: SequenceNumber,
    next_send_seqs: FxHashMap<Channel, SequenceNumber>,
    receive_channels: FxHashMap<Channel, ReceiveChannel>,
    pending_acks: Vec<(Channel, SequenceNumber)>,

    own_syn_seq: Option<SequenceNumber>,
    peer_syn_seq: Option<SequenceNumber>,
    rst_seq: Option<SequenceNumber>,

    state_since: Instant,
    last_received: Instant,
    last_sent: Instant,
    last_rst_sent: Instant,

    events: Vec<ConnectionEvent>,
}

impl Connection {
    pub fn new(params: ConnParams, config: Arc<RudpConfig>, sender: Arc<dyn DatagramSender>, now: Instant) -> Connection {
        Connection {
            conn_type: params.conn_type(),
            state: ConnectionState::Handshaking,
            peer_addr: params.address(),
            local_addr: None,
            inbound_port: params.inbound_port(),
            p2p: params.p2p().cloned(),
            sender,
            sender_buffer: SenderBuffer::new(),
            rto: RtoEstimator::new(config.rto),
            next_control_seq: SequenceNumber::ZERO,
            next_send_seqs: FxHashMap::default(),
            receive_channels: FxHashMap::default(),
            pending_acks: Vec::new(),
            own_syn_seq: None,
            peer_syn_seq: None,
            rst_seq: None,
            state_since: now,
            last_received: now,
            last_sent: now,
            last_rst_sent: now,
            events: Vec::new(),
            config,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn conn_type(&self) -> ConnectionType {
        self.conn_type
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn inbound_port(&self) -> u16 {
        self.inbound_port
    }

    pub fn sender_buffer(&self) -> &SenderBuffer {
        &self.sender_buffer
    }

    pub fn current_rto(&self) -> std::time::Duration {
        self.rto.current_rto()
    }

    /// returns all events since the previous call
    pub fn take_events(&mut self) -> Vec<ConnectionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Starts the handshake. Clients and P2P peers send their SYN, servers wait for the peer's.
    pub async fn start(&mut self, now: Instant) {
        if self.state != ConnectionState::Handshaking || self.own_syn_seq.is_some() {
            return;
        }
        if self.conn_type != ConnectionType::Server {
            debug!("starting {:?} handshake with {:?}", self.conn_type, self.peer_addr);
            self.send_syn(now).await;
        }
    }

    /// Sends a message on a user channel, returning its sequence number. This is only possible
    ///  for established connections.
    pub async fn send(&mut self, channel: Channel, payload: impl Payload, priority: Priority, now: Instant) -> anyhow::Result<SequenceNumber> {
        if self.state != ConnectionState::Established {
            bail!("not connected to {:?}: connection is {:?}", self.peer_addr, self.state);
        }
        if channel.is_control() {
            bail!("can not send application data on the control channel");
        }
        if payload.len() > self.config.max_data_payload_len() {
            bail!("payload of {} bytes exceeds the maximum of {} bytes", payload.len(), self.config.max_data_payload_len());
        }
        if self.sender_buffer.len() >= self.config.receive_window_size as usize {
            bail!("too many unacknowledged messages for {:?}", self.peer_addr);
        }

        let seq = self.next_send_seqs.entry(channel)
            .or_insert(SequenceNumber::ZERO);
        let sequence_number = *seq;
        *seq = seq.next();

        let message = Message::data(channel, sequence_number, payload, priority)?;
        if self.sender_buffer.register(message.clone(), now).is_err() {
            bail!("sequence number {} on channel {} is already in flight", sequence_number, channel);
        }
        self.transmit(&message, now).await;
        Ok(sequence_number)
    }

    /// Closes the connection, discarding all unacknowledged messages. An established connection
    ///  sends a RST and waits for the peer to confirm it, a connection that is still handshaking
    ///  is closed right away.
    pub async fn close(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed => {}
            ConnectionState::Handshaking => {
                self.sender_buffer.clear();
                if self.own_syn_seq.is_some() || self.peer_syn_seq.is_some() {
                    let rst_seq = self.next_control_seq();
                    self.transmit(&Message::rst(rst_seq), now).await;
                }
                self.finish(DisconnectReason::Closed);
            }
            ConnectionState::Established => {
                let num_dropped = self.sender_buffer.clear();
                if num_dropped > 0 {
                    debug!("discarding {} unacknowledged message(s) for {:?}", num_dropped, self.peer_addr);
                }

                let rst_seq = self.next_control_seq();
                self.rst_seq = Some(rst_seq);
                self.set_state(ConnectionState::Closing, now);
                self.last_rst_sent = now;
                self.transmit(&Message::rst(rst_seq), now).await;
            }
        }
    }

    /// Housekeeping: timeouts, retransmission, re-sending RST while closing, and heartbeats
    pub async fn tick(&mut self, now: Instant) {
        let in_state = now.saturating_duration_since(self.state_since);
        match self.state {
            ConnectionState::Closed => return,
            ConnectionState::Handshaking => {
                if in_state >= self.config.handshake_timeout {
                    info!("handshake with {:?} timed out", self.peer_addr);
                    self.finish(DisconnectReason::Timeout);
                    return;
                }
            }
            ConnectionState::Established => {
                if now.saturating_duration_since(self.last_received) >= self.config.connection_timeout {
                    info!("connection to {:?} timed out", self.peer_addr);
                    self.finish(DisconnectReason::Timeout);
                    return;
                }
            }
            ConnectionState::Closing => {
                if in_state >= self.config.close_timeout {
                    debug!("peer {:?} did not confirm the close - closing anyway", self.peer_addr);
                    self.finish(DisconnectReason::Closed);
                    return;
                }
                if let Some(rst_seq) = self.rst_seq {
                    if now.saturating_duration_since(self.last_rst_sent) >= self.rto.current_rto() {
                        trace!("re-sending RST to {:?}", self.peer_addr);
                        self.rto.on_retransmission_timeout();
                        self.last_rst_sent = now;
                        self.transmit(&Message::rst(rst_seq), now).await;
                    }
                }
                return;
            }
        }

        let due = self.sender_buffer
            .collect_retransmissions(now, self.rto.current_rto())
            .collect::<Vec<_>>();
        if !due.is_empty() {
            debug!("retransmitting {} message(s) to {:?}", due.len(), self.peer_addr);
            self.rto.on_retransmission_timeout();
            for message in due {
                self.transmit(&message, now).await;
            }
        }

        if self.state == ConnectionState::Established && now.saturating_duration_since(self.last_sent) >= self.config.heartbeat_interval {
            trace!("sending heartbeat to {:?}", self.peer_addr);
            self.send_pure_ack(now).await;
        }
    }

    /// Handles a datagram received from `remote` on the local socket bound to `inbound`.
    ///  Malformed datagrams and datagrams from other peers are discarded.
    pub async fn on_datagram_received(&mut self, inbound: SocketAddr, remote: SocketAddr, datagram: &[u8], now: Instant) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if !addr_eq(&remote, &self.peer_addr) {
            debug!("datagram from {:?} received by connection to {:?} - dropping", remote, self.peer_addr);
            return;
        }

        let (header, payload) = match PacketHeader::deser_datagram(datagram) {
            Ok(x) => x,
            Err(e) => {
                debug!("malformed datagram from {:?}: {} - dropping", remote, e);
                return;
            }
        };
        trace!("received {:?} from {:?}", header, remote);

        self.local_addr = Some(inbound);
        self.last_received = now;

        self.on_acks(&header.acks, now);
        if self.state == ConnectionState::Closed {
            return;
        }

        if header.channel.is_control() {
            self.on_control(&header, now).await;
        }
        else {
            self.on_data(&header, payload);
        }

        self.flush_acks(now).await;
    }

    fn on_acks(&mut self, acks: &[(Channel, SequenceNumber)], now: Instant) {
        for &(channel, seq) in acks {
            if channel.is_control() && self.state == ConnectionState::Closing && Some(seq) == self.rst_seq {
                debug!("peer {:?} acknowledged RST", self.peer_addr);
                self.finish(DisconnectReason::Closed);
                return;
            }

            if let Some(acked) = self.sender_buffer.acknowledge(channel, seq) {
                // Karn's rule: RTT samples only from messages that were not retransmitted
                if acked.transmissions == 1 {
                    self.rto.on_rtt_sample(now.saturating_duration_since(acked.first_transmission));
                }
            }
        }
    }

    async fn on_control(&mut self, header: &PacketHeader, now: Instant) {
        let is_syn = header.flags.contains(Flags::SYN);
        let is_rst = header.flags.contains(Flags::RST);

        match (is_syn, is_rst) {
            (true, true) => {
                if self.state == ConnectionState::Handshaking && self.own_syn_seq == Some(header.sequence_number) {
                    info!("connection refused by {:?}", self.peer_addr);
                    self.finish(DisconnectReason::Refused);
                }
                else {
                    debug!("ignoring unexpected SYN+RST from {:?}", self.peer_addr);
                }
            }
            (true, false) => self.on_syn(header, now).await,
            (false, true) => self.on_rst(header.sequence_number, now).await,
            (false, false) => {} // ack / heartbeat
        }
    }

    async fn on_syn(&mut self, header: &PacketHeader, now: Instant) {
        let seq = header.sequence_number;

        match self.state {
            ConnectionState::Handshaking => {
                if self.conn_type == ConnectionType::P2p && !self.is_valid_p2p_syn(header) {
                    warn!("P2P handshake material from {:?} does not match - resetting", self.peer_addr);
                    self.sender_buffer.clear();
                    let rst_seq = self.next_control_seq();
                    self.transmit(&Message::rst(rst_seq), now).await;
                    self.finish(DisconnectReason::P2pMismatch);
                    return;
                }
                if self.conn_type == ConnectionType::Client && !self.is_own_syn_acknowledged() {
                    // a server's SYN carries the ack for the client's SYN
                    debug!("SYN from {:?} does not acknowledge our SYN - ignoring", self.peer_addr);
                    return;
                }

                self.peer_syn_seq = Some(seq);
                self.pending_acks.push((Channel::CONTROL, seq));
                if self.conn_type == ConnectionType::Server {
                    self.send_syn(now).await;
                }

                info!("connection to {:?} established", self.peer_addr);
                self.set_state(ConnectionState::Established, now);
                self.events.push(ConnectionEvent::Established);
            }
            ConnectionState::Established => {
                if self.peer_syn_seq == Some(seq) {
                    trace!("duplicate SYN from {:?} - re-acknowledging", self.peer_addr);
                    self.pending_acks.push((Channel::CONTROL, seq));
                }
                else {
                    debug!("unexpected SYN {} from {:?} - ignoring", seq, self.peer_addr);
                }
            }
            ConnectionState::Closing | ConnectionState::Closed => {}
        }
    }

    fn is_own_syn_acknowledged(&self) -> bool {
        match self.own_syn_seq {
            Some(own) => !self.sender_buffer.contains(Channel::CONTROL, own),
            None => false,
        }
    }

    fn is_valid_p2p_syn(&self, header: &PacketHeader) -> bool {
        match (&self.p2p, &header.p2p) {
            (Some(own), Some(P2pSyn { cookie, authenticator })) => own.verify(cookie, header.sequence_number, authenticator),
            _ => false,
        }
    }

    async fn on_rst(&mut self, seq: SequenceNumber, now: Instant) {
        self.pending_acks.push((Channel::CONTROL, seq));

        match self.state {
            ConnectionState::Closing => {
                debug!("peer {:?} confirmed close", self.peer_addr);
                self.flush_acks(now).await;
                self.finish(DisconnectReason::Closed);
            }
            ConnectionState::Handshaking | ConnectionState::Established => {
                info!("connection reset by {:?}", self.peer_addr);
                self.sender_buffer.clear();
                self.set_state(ConnectionState::Closing, now);
                let rst_seq = self.next_control_seq();
                self.transmit(&Message::rst(rst_seq), now).await;
                self.finish(DisconnectReason::Reset);
            }
            ConnectionState::Closed => {}
        }
    }

    fn on_data(&mut self, header: &PacketHeader, payload: &[u8]) {
        if self.state != ConnectionState::Established {
            trace!("data from {:?} while {:?} - dropping", self.peer_addr, self.state);
            return;
        }

        let window_size = self.config.receive_window_size;
        let channel = header.channel;
        let outcome = self.receive_channels.entry(channel)
            .or_insert_with(|| ReceiveChannel::new(window_size))
            .on_message(header.sequence_number, Bytes::copy_from_slice(payload));

        if outcome.should_ack() {
            self.pending_acks.push((channel, header.sequence_number));
        }
        if let ReceiveOutcome::Delivered(payloads) = outcome {
            for payload in payloads {
                self.events.push(ConnectionEvent::Message { channel, payload });
            }
        }
    }

    async fn send_syn(&mut self, now: Instant) {
        let seq = self.next_control_seq();
        self.own_syn_seq = Some(seq);

        let syn = Message::syn(seq);
        if self.sender_buffer.register(syn.clone(), now).is_ok() {
            self.transmit(&syn, now).await;
        }
    }

    fn next_control_seq(&mut self) -> SequenceNumber {
        let result = self.next_control_seq;
        self.next_control_seq = result.next();
        result
    }

    fn take_acks(&mut self) -> Vec<(Channel, SequenceNumber)> {
        let n = self.pending_acks.len().min(MAX_PIGGYBACKED_ACKS);
        self.pending_acks.drain(..n).collect()
    }

    async fn flush_acks(&mut self, now: Instant) {
        while !self.pending_acks.is_empty() && self.state != ConnectionState::Closed {
            self.send_pure_ack(now).await;
        }
    }

    async fn send_pure_ack(&mut self, now: Instant) {
        let header = PacketHeader::pure_ack(self.take_acks());
        let mut buf = BytesMut::with_capacity(PacketHeader::FIXED_LEN + crate::packet_header::MAX_ACK_LIST_LEN);
        header.ser_datagram(&[], &mut buf);
        self.send_raw(&buf, now).await;
    }

    /// Serializes a message into a datagram, piggy-backing pending acks, and sends it
    async fn transmit(&mut self, message: &Message, now: Instant) {
        let p2p = match &self.p2p {
            Some(p2p) if message.flags() == Flags::SYN => Some(P2pSyn::new(p2p, message.sequence_number())),
            _ => None,
        };

        let header = PacketHeader {
            flags: message.flags(),
            channel: message.channel(),
            priority: message.priority(),
            sequence_number: message.sequence_number(),
            acks: self.take_acks(),
            p2p,
        };
        trace!("sending {:?} to {:?}", header, self.peer_addr);

        let mut buf = BytesMut::with_capacity(message.approximate_size());
        header.ser_datagram(message.payload(), &mut buf);
        self.send_raw(&buf, now).await;
    }

    async fn send_raw(&mut self, datagram: &[u8], now: Instant) {
        let from = self.local_addr
            .unwrap_or_else(|| unspecified_for(&self.peer_addr));
        self.sender.send_datagram(from, self.peer_addr, datagram).await;
        self.last_sent = now;
    }

    fn set_state(&mut self, state: ConnectionState, now: Instant) {
        trace!("connection to {:?}: {:?} -> {:?}", self.peer_addr, self.state, state);
        self.state = state;
        self.state_since = now;
    }

    fn finish(&mut self, reason: DisconnectReason) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.sender_buffer.clear();
        self.pending_acks.clear();
        self.state = ConnectionState::Closed;
        debug!("connection to {:?} closed: {:?}", self.peer_addr, reason);
        self.events.push(ConnectionEvent::Disconnected(reason));
    }
}
