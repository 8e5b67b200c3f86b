use std::net::SocketAddr;
use anyhow::bail;
use tracing::warn;
use crate::p2p::P2pData;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionType {
    /// actively opened connection to a server
    Client,
    /// connection accepted from a remote client
    Server,
    /// symmetric connection where both sides open simultaneously and authenticate each other
    P2p,
}

/// Everything needed to open a connection. Immutable once created.
#[derive(Clone, Debug)]
pub struct ConnParams {
    address: SocketAddr,
    inbound_port: u16,
    conn_type: ConnectionType,
    p2p: Option<P2pData>,
}

impl ConnParams {
    /// Parameters for a connection without P2P material. The P2P type can only be reached
    ///  through [ConnParams::with_p2p] since it requires a cookie and a shared secret.
    pub fn new(address: SocketAddr, inbound_port: u16, conn_type: ConnectionType) -> anyhow::Result<ConnParams> {
        if conn_type == ConnectionType::P2p {
            bail!("P2P connection parameters require a cookie and a shared secret");
        }

        Ok(ConnParams {
            address,
            inbound_port,
            conn_type,
            p2p: None,
        })
    }

    /// The connection type is derived from the P2P material: P2P if both cookie and shared secret
    ///  are present, CLIENT otherwise.
    pub fn with_p2p(address: SocketAddr, inbound_port: u16, cookie: Option<&[u8]>, shared_secret: Option<&[u8]>) -> anyhow::Result<ConnParams> {
        let p2p = match (cookie, shared_secret) {
            (Some(cookie), Some(secret)) => Some(P2pData::new(cookie, secret)?),
            (None, None) => None,
            (cookie, secret) => {
                warn!("incomplete P2P material for connection to {} (cookie present: {}, secret present: {}) - opening a client connection", address, cookie.is_some(), secret.is_some());
                None
            }
        };

        let conn_type = if p2p.is_some() {
            ConnectionType::P2p
        }
        else {
            ConnectionType::Client
        };

        Ok(ConnParams {
            address,
            inbound_port,
            conn_type,
            p2p,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn inbound_port(&self) -> u16 {
        self.inbound_port
    }

    pub fn conn_type(&self) -> ConnectionType {
        self.conn_type
    }

    pub fn p2p(&self) -> Option<&P2pData> {
        self.p2p.as_ref()
    }
}
