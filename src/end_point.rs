use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};
use crate::address::AddrKey;
use crate::config::RudpConfig;
use crate::conn_params::{ConnParams, ConnectionType};
use crate::connection::{Connection, ConnectionEvent, ConnectionState, DisconnectReason};
use crate::message::{Channel, Flags, Payload, Priority, SequenceNumber};
use crate::packet_header::PacketHeader;
use crate::socket_mux::{DatagramHandler, DatagramSender, PlatformBinding, TokioBinding, UdpMultiplexer};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionId(u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The application's view of an [EndPoint]: notifications about connections and the messages
///  received on them
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EndPointDelegate: Send + Sync + 'static {
    /// a connection completed its handshake, either opened locally or accepted from a peer
    async fn on_connection(&self, id: ConnectionId, peer_addr: SocketAddr);

    async fn on_message(&self, id: ConnectionId, channel: Channel, payload: Bytes);

    /// called exactly once per connection, after which the id is no longer valid
    async fn on_disconnect(&self, id: ConnectionId, reason: DisconnectReason);
}

#[derive(Default)]
struct Registry {
    connections: FxHashMap<ConnectionId, Arc<Mutex<Connection>>>,
    /// (local address, peer address) -> connection
    routes: FxHashMap<(AddrKey, AddrKey), ConnectionId>,
    /// locally opened connections that did not receive anything yet, by peer address
    pending: FxHashMap<AddrKey, ConnectionId>,
    next_id: u64,
}

impl Registry {
    fn add(&mut self, connection: Connection) -> (ConnectionId, Arc<Mutex<Connection>>) {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        let connection = Arc::new(Mutex::new(connection));
        self.connections.insert(id, connection.clone());
        (id, connection)
    }

    fn has_peer(&self, peer_addr: SocketAddr) -> bool {
        let peer = AddrKey(peer_addr);
        self.pending.contains_key(&peer) || self.routes.keys().any(|(_, p)| *p == peer)
    }

    /// Finds the connection for a datagram, pinning a pending connection to the local address
    ///  the peer's first datagram arrived on
    fn lookup(&mut self, inbound: SocketAddr, remote: SocketAddr) -> Option<(ConnectionId, Arc<Mutex<Connection>>)> {
        let key = (AddrKey(inbound), AddrKey(remote));
        let id = match self.routes.get(&key) {
            Some(&id) => id,
            None => {
                let id = self.pending.remove(&AddrKey(remote))?;
                trace!("pinning connection {} to local address {:?}", id, inbound);
                self.routes.insert(key, id);
                id
            }
        };
        self.connections.get(&id)
            .map(|c| (id, c.clone()))
    }

    fn remove(&mut self, id: ConnectionId) {
        self.connections.remove(&id);
        self.routes.retain(|_, v| *v != id);
        self.pending.retain(|_, v| *v != id);
    }
}

enum Route {
    Connection(ConnectionId, Arc<Mutex<Connection>>),
    Reply(BytesMut),
    Discard,
}

struct EndPointInner {
    config: Arc<RudpConfig>,
    multiplexer: Arc<UdpMultiplexer>,
    delegate: Arc<dyn EndPointDelegate>,
    registry: Mutex<Registry>,
}

impl EndPointInner {
    fn new_connection(&self, params: ConnParams, now: Instant) -> Connection {
        let sender: Arc<dyn DatagramSender> = self.multiplexer.clone();
        Connection::new(params, self.config.clone(), sender, now)
    }

    async fn route(&self, inbound: SocketAddr, remote: SocketAddr, datagram: &[u8], now: Instant) -> Route {
        let mut registry = self.registry.lock().await;
        if let Some((id, connection)) = registry.lookup(inbound, remote) {
            return Route::Connection(id, connection);
        }

        let header = match PacketHeader::deser_datagram(datagram) {
            Ok((header, _)) => header,
            Err(e) => {
                debug!("malformed datagram from unknown peer {:?}: {} - dropping", remote, e);
                return Route::Discard;
            }
        };

        let is_syn = header.flags.contains(Flags::SYN);
        let is_rst = header.flags.contains(Flags::RST);
        match (is_syn, is_rst) {
            (true, false) if header.p2p.is_some() => {
                // the local side did not open its P2P connection yet - the peer will retransmit
                debug!("P2P SYN from {:?} without a matching connection - dropping", remote);
                Route::Discard
            }
            (true, false) if registry.has_peer(remote) => {
                // The peer already has a connection through another local address, e.g. because
                //  our SYN went out through several interfaces. Reset the surplus connection.
                debug!("SYN from {:?} on {:?} duplicates an existing connection - resetting", remote, inbound);
                Route::Reply(stateless_datagram(PacketHeader::new(Flags::RST, Channel::CONTROL, Priority::High, SequenceNumber::ZERO)))
            }
            (true, false) if self.config.accept_connections => {
                let params = match ConnParams::new(remote, self.multiplexer.local_port(), ConnectionType::Server) {
                    Ok(params) => params,
                    Err(_) => return Route::Discard,
                };
                let (id, connection) = registry.add(self.new_connection(params, now));
                registry.routes.insert((AddrKey(inbound), AddrKey(remote)), id);
                info!("accepting connection {} from {:?} on {:?}", id, remote, inbound);
                Route::Connection(id, connection)
            }
            (true, false) => {
                debug!("refusing connection from {:?}", remote);
                Route::Reply(stateless_datagram(PacketHeader::new(Flags::SYN | Flags::RST, Channel::CONTROL, Priority::High, header.sequence_number)))
            }
            (false, true) => {
                // acknowledge so the peer can complete its close
                trace!("RST from unknown peer {:?} - acknowledging", remote);
                Route::Reply(stateless_datagram(PacketHeader::pure_ack(vec![(Channel::CONTROL, header.sequence_number)])))
            }
            _ => {
                trace!("datagram from unknown peer {:?} - dropping", remote);
                Route::Discard
            }
        }
    }

    async fn dispatch(&self, id: ConnectionId, peer_addr: SocketAddr, events: Vec<ConnectionEvent>) {
        for event in events {
            match event {
                ConnectionEvent::Established => self.delegate.on_connection(id, peer_addr).await,
                ConnectionEvent::Message { channel, payload } => self.delegate.on_message(id, channel, payload).await,
                ConnectionEvent::Disconnected(reason) => {
                    self.registry.lock().await.remove(id);
                    info!("connection {} to {:?} closed: {:?}", id, peer_addr, reason);
                    self.delegate.on_disconnect(id, reason).await;
                }
            }
        }
    }

    async fn get(&self, id: ConnectionId) -> anyhow::Result<Arc<Mutex<Connection>>> {
        self.registry.lock().await
            .connections.get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown connection {}", id))
    }

    async fn on_tick(&self) {
        let now = Instant::now();
        let connections = self.registry.lock().await
            .connections.iter()
            .map(|(&id, c)| (id, c.clone()))
            .collect::<Vec<_>>();

        for (id, connection) in connections {
            let (peer_addr, events) = {
                let mut connection = connection.lock().await;
                connection.tick(now).await;
                (connection.peer_addr(), connection.take_events())
            };
            self.dispatch(id, peer_addr, events).await;
        }
    }
}

fn stateless_datagram(header: PacketHeader) -> BytesMut {
    let mut buf = BytesMut::new();
    header.ser_datagram(&[], &mut buf);
    buf
}

#[async_trait]
impl DatagramHandler for EndPointInner {
    async fn on_datagram(&self, inbound: SocketAddr, remote: SocketAddr, datagram: &[u8]) {
        let now = Instant::now();

        match self.route(inbound, remote, datagram, now).await {
            Route::Connection(id, connection) => {
                let events = {
                    let mut connection = connection.lock().await;
                    connection.on_datagram_received(inbound, remote, datagram, now).await;
                    connection.take_events()
                };
                self.dispatch(id, remote, events).await;
            }
            Route::Reply(reply) => {
                self.multiplexer.send_data(inbound, remote, &reply).await;
            }
            Route::Discard => {}
        }
    }
}

/// EndPoint is the place where all other parts of the protocol come together: it owns the
///  multiplexed sockets and all connections using them, dispatches incoming datagrams to their
///  connections, drives the connections' timers, and has an API for application code to open
///  connections and send messages.
///
/// Dropping the EndPoint stops its receive loops and timer, closing the sockets.
pub struct EndPoint {
    inner: Arc<EndPointInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        for handle in &self.tasks {
            handle.abort();
        }
    }
}

impl EndPoint {
    /// Opens an end point with OS sockets
    pub async fn open(config: RudpConfig, delegate: Arc<dyn EndPointDelegate>) -> anyhow::Result<EndPoint> {
        Self::new(config, &TokioBinding, delegate).await
    }

    pub async fn new(config: RudpConfig, binding: &dyn PlatformBinding, delegate: Arc<dyn EndPointDelegate>) -> anyhow::Result<EndPoint> {
        config.validate()?;
        let config = Arc::new(config);

        let multiplexer = Arc::new(UdpMultiplexer::open(binding, config.self_addr).await?);
        let inner = Arc::new(EndPointInner {
            config: config.clone(),
            multiplexer: multiplexer.clone(),
            delegate,
            registry: Default::default(),
        });

        let mut tasks = multiplexer.spawn_receive_loops(inner.clone(), config.payload_size_inside_udp);

        let tick_inner = inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticks = time::interval(tick_inner.config.tick_interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                tick_inner.on_tick().await;
            }
        }));

        info!("end point listening on port {}", multiplexer.local_port());
        Ok(EndPoint {
            inner,
            tasks,
        })
    }

    /// the port shared by all bound sockets
    pub fn local_port(&self) -> u16 {
        self.inner.multiplexer.local_port()
    }

    pub fn bound_addrs(&self) -> Vec<SocketAddr> {
        self.inner.multiplexer.bound_addrs()
    }

    /// Opens a client or P2P connection. The returned id is valid right away, but messages can
    ///  only be sent once the delegate was notified that the connection is established.
    pub async fn connect(&self, params: ConnParams) -> anyhow::Result<ConnectionId> {
        if params.conn_type() == ConnectionType::Server {
            bail!("server connections are created by accepting SYNs, they can not be opened");
        }
        if params.inbound_port() != 0 && params.inbound_port() != self.local_port() {
            bail!("inbound port {} does not match the end point's port {}", params.inbound_port(), self.local_port());
        }

        let peer_addr = params.address();
        if peer_addr.is_ipv4() != self.inner.config.self_addr.is_ipv4() {
            bail!("address family of {:?} does not match the end point's", peer_addr);
        }

        let now = Instant::now();
        let (id, connection) = {
            let mut registry = self.inner.registry.lock().await;
            if registry.has_peer(peer_addr) {
                bail!("there is already a connection to {:?}", peer_addr);
            }
            let (id, connection) = registry.add(self.inner.new_connection(params, now));
            registry.pending.insert(AddrKey(peer_addr), id);
            (id, connection)
        };

        debug!("opening connection {} to {:?}", id, peer_addr);
        connection.lock().await
            .start(now).await;
        Ok(id)
    }

    pub async fn send(&self, id: ConnectionId, channel: Channel, payload: impl Payload, priority: Priority) -> anyhow::Result<SequenceNumber> {
        let connection = self.inner.get(id).await?;
        let mut connection = connection.lock().await;
        connection.send(channel, payload, priority, Instant::now()).await
    }

    /// Closes a connection, discarding unacknowledged messages. The delegate is notified when
    ///  the close is complete.
    pub async fn close(&self, id: ConnectionId) -> anyhow::Result<()> {
        let connection = self.inner.get(id).await?;
        let (peer_addr, events) = {
            let mut connection = connection.lock().await;
            connection.close(Instant::now()).await;
            (connection.peer_addr(), connection.take_events())
        };
        self.inner.dispatch(id, peer_addr, events).await;
        Ok(())
    }

    pub async fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        let connection = self.inner.get(id).await.ok()?;
        let state = connection.lock().await.state();
        Some(state)
    }

    pub async fn num_connections(&self) -> usize {
        self.inner.registry.lock().await
            .connections.len()
    }
}
