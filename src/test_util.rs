use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, RwLock};
use crate::address::AddrKey;
use crate::message::Payload;
use crate::socket_mux::{BoundSocket, DatagramSender, NetworkInterface, PlatformBinding};

/// Counts payload releases across all [TrackedPayload]s created with it
#[derive(Clone, Default)]
pub struct ReleaseCounter(Arc<AtomicUsize>);

impl ReleaseCounter {
    pub fn released(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Payload that registers its release with a [ReleaseCounter]
pub struct TrackedPayload {
    data: Vec<u8>,
    counter: ReleaseCounter,
}

impl TrackedPayload {
    pub fn new(data: Vec<u8>, counter: &ReleaseCounter) -> TrackedPayload {
        TrackedPayload {
            data,
            counter: counter.clone(),
        }
    }
}

impl Drop for TrackedPayload {
    fn drop(&mut self) {
        self.counter.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl Payload for TrackedPayload {
    fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}


/// Records sent datagrams instead of sending them
#[derive(Debug, Default)]
pub struct TrackingDatagramSender {
    tracker: RwLock<Vec<(SocketAddr, SocketAddr, Vec<u8>)>>,
}

impl TrackingDatagramSender {
    /// returns sent datagrams as (from, to, datagram), clearing the internal buffer
    pub async fn sent_datagrams(&self) -> Vec<(SocketAddr, SocketAddr, Vec<u8>)> {
        let mut lock = self.tracker.write().await;
        std::mem::take(&mut *lock)
    }
}

#[async_trait]
impl DatagramSender for TrackingDatagramSender {
    async fn send_datagram(&self, from: SocketAddr, to: SocketAddr, datagram: &[u8]) {
        self.tracker.write().await.push((from, to, datagram.to_vec()));
    }
}


type Inbox = mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>;

/// In-memory 'network' connecting [FakeSocket]s by address. Datagrams to unbound addresses
///  are lost.
#[derive(Default)]
pub struct FakeNetwork {
    sockets: Mutex<FxHashMap<AddrKey, Inbox>>,
    next_ephemeral_port: AtomicU16,
    num_dropped: AtomicUsize,
    /// while set, all datagrams are dropped
    lossy: std::sync::atomic::AtomicBool,
}

impl FakeNetwork {
    pub fn new() -> Arc<FakeNetwork> {
        Arc::new(FakeNetwork {
            next_ephemeral_port: AtomicU16::new(50000),
            ..Default::default()
        })
    }

    pub fn set_lossy(&self, lossy: bool) {
        self.lossy.store(lossy, Ordering::SeqCst);
    }

    pub fn num_dropped(&self) -> usize {
        self.num_dropped.load(Ordering::SeqCst)
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, datagram: &[u8]) {
        if self.lossy.load(Ordering::SeqCst) {
            self.num_dropped.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let sockets = self.sockets.lock().unwrap();
        match sockets.get(&AddrKey(to)) {
            Some(inbox) if inbox.send((from, datagram.to_vec())).is_ok() => {}
            _ => {
                self.num_dropped.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

pub struct FakeBinding {
    network: Arc<FakeNetwork>,
    interfaces: Vec<NetworkInterface>,
}

impl FakeBinding {
    pub fn new(network: Arc<FakeNetwork>, interface_ips: Vec<&str>) -> FakeBinding {
        let interfaces = interface_ips.into_iter()
            .enumerate()
            .map(|(i, ip)| NetworkInterface {
                name: format!("if{}", i),
                addr: IpAddr::from_str(ip).unwrap(),
            })
            .collect();

        FakeBinding {
            network,
            interfaces,
        }
    }
}

#[async_trait]
impl PlatformBinding for FakeBinding {
    fn network_interfaces(&self) -> anyhow::Result<Vec<NetworkInterface>> {
        Ok(self.interfaces.clone())
    }

    async fn open_socket(&self, addr: SocketAddr) -> anyhow::Result<Arc<dyn BoundSocket>> {
        let addr = if addr.port() == 0 {
            SocketAddr::new(addr.ip(), self.network.next_ephemeral_port.fetch_add(1, Ordering::SeqCst))
        }
        else {
            addr
        };

        let mut sockets = self.network.sockets.lock().unwrap();
        if sockets.contains_key(&AddrKey(addr)) {
            bail!("address {:?} is already in use", addr);
        }

        let (send, recv) = mpsc::unbounded_channel();
        sockets.insert(AddrKey(addr), send);

        Ok(Arc::new(FakeSocket {
            network: self.network.clone(),
            local_addr: addr,
            inbox: tokio::sync::Mutex::new(recv),
        }))
    }
}

pub struct FakeSocket {
    network: Arc<FakeNetwork>,
    local_addr: SocketAddr,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>>,
}

impl Drop for FakeSocket {
    fn drop(&mut self) {
        if let Ok(mut sockets) = self.network.sockets.lock() {
            sockets.remove(&AddrKey(self.local_addr));
        }
    }
}

#[async_trait]
impl BoundSocket for FakeSocket {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_to(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        self.network.deliver(self.local_addr, to, datagram);
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        match self.inbox.lock().await.recv().await {
            Some((from, datagram)) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok((len, from))
            }
            None => bail!("socket closed"),
        }
    }
}
