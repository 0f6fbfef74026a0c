//! UDP endpoints: datagram routing, session creation, accept and connect.

use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
};

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::{net::UdpSocket, sync::Notify};
use tracing::{debug, trace, warn};

use crate::{
    config::{EndpointConfig, TransportConfig},
    packet::LONG_HEADER_FORM,
    session::{ConnectionError, Session, SessionShared},
    shared::ConnectionId,
    streams::Stream,
    Side, VarInt, MAX_CID_SIZE, VERSION,
};

/// Largest UDP datagram we are prepared to receive
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Directory of live sessions, keyed by connection id
///
/// One per endpoint socket; reads vastly outnumber writes, so a
/// reader-writer lock guards the map.
pub(crate) struct SessionManager {
    sessions: RwLock<FxHashMap<ConnectionId, Arc<SessionShared>>>,
}

impl SessionManager {
    fn new() -> Self {
        Self {
            sessions: RwLock::new(FxHashMap::default()),
        }
    }

    pub(crate) fn get(&self, cid: &ConnectionId) -> Option<Arc<SessionShared>> {
        self.sessions.read().unwrap().get(cid).cloned()
    }

    pub(crate) fn insert(&self, session: Arc<SessionShared>) {
        self.sessions
            .write()
            .unwrap()
            .insert(session.cid(), session);
    }

    pub(crate) fn remove(&self, cid: &ConnectionId) {
        self.sessions.write().unwrap().remove(cid);
    }

    fn drain(&self) -> Vec<Arc<SessionShared>> {
        let mut sessions = self.sessions.write().unwrap();
        sessions.drain().map(|(_, v)| v).collect()
    }

    fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }
}

/// Extract the destination connection id without a full header parse
///
/// Short headers carry no length on the wire; the endpoint supplies its
/// configured cid length as the routing context.
fn dst_cid(datagram: &[u8], local_cid_len: usize) -> Option<ConnectionId> {
    let first = *datagram.first()?;
    if first & LONG_HEADER_FORM != 0 {
        let len = *datagram.get(5)? as usize;
        if len > MAX_CID_SIZE || datagram.len() < 6 + len {
            return None;
        }
        Some(ConnectionId::new(&datagram[6..6 + len]))
    } else {
        if datagram.len() < 1 + local_cid_len {
            return None;
        }
        Some(ConnectionId::new(&datagram[1..1 + local_cid_len]))
    }
}

/// Whether a datagram begins with a v1 INITIAL long header, the only thing
/// that may create a session server-side
fn is_initial(datagram: &[u8]) -> bool {
    datagram.len() >= 5
        && datagram[0] & 0xf0 == 0xc0
        && datagram[1..5] == VERSION.to_be_bytes()
}

/// A QUIC server bound to a UDP socket
///
/// Datagrams are routed to sessions by destination connection id; unknown
/// ids bearing an INITIAL header create a session and surface it via
/// [`QuicServer::accept`].
#[derive(Clone)]
pub struct QuicServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    socket: Arc<UdpSocket>,
    sessions: SessionManager,
    accept_queue: Mutex<VecDeque<Session>>,
    accept_notify: Notify,
    shutdown_notify: Notify,
    closed: AtomicBool,
    endpoint_config: EndpointConfig,
    transport_config: Arc<TransportConfig>,
}

impl QuicServer {
    /// Bind a server socket with default configuration
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Self::bind_with(addr, EndpointConfig::default(), TransportConfig::default()).await
    }

    /// Bind a server socket with explicit configuration
    pub async fn bind_with(
        addr: SocketAddr,
        endpoint_config: EndpointConfig,
        transport_config: TransportConfig,
    ) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        debug!(addr = %socket.local_addr()?, "server listening");
        let inner = Arc::new(ServerInner {
            socket,
            sessions: SessionManager::new(),
            accept_queue: Mutex::new(VecDeque::new()),
            accept_notify: Notify::new(),
            shutdown_notify: Notify::new(),
            closed: AtomicBool::new(false),
            endpoint_config,
            transport_config: Arc::new(transport_config),
        });
        tokio::spawn(drive_server(inner.clone()));
        Ok(Self { inner })
    }

    /// The bound local address
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Wait for the next incoming connection
    ///
    /// Returns `None` once the server has been closed.
    pub async fn accept(&self) -> Option<Session> {
        loop {
            let notified = self.inner.accept_notify.notified();
            {
                let mut queue = self.inner.accept_queue.lock().unwrap();
                if let Some(session) = queue.pop_front() {
                    return Some(session);
                }
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Stop accepting and tear every session down
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for session in self.inner.sessions.drain() {
            Session::new(session).close(VarInt(0), b"server shutdown");
        }
        self.inner.accept_notify.notify_waiters();
        self.inner.accept_notify.notify_one();
        self.inner.shutdown_notify.notify_one();
    }
}

async fn drive_server(inner: Arc<ServerInner>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, remote) = tokio::select! {
            result = inner.socket.recv_from(&mut buf) => match result {
                Ok(x) => x,
                Err(e) => {
                    if inner.closed.load(Ordering::Acquire) {
                        break;
                    }
                    warn!(error = %e, "server socket receive failed");
                    continue;
                }
            },
            _ = inner.shutdown_notify.notified() => break,
        };
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        let datagram = BytesMut::from(&buf[..len]);
        route_datagram(&inner, datagram, remote);
    }
    debug!("server driver stopped");
}

fn route_datagram(inner: &Arc<ServerInner>, datagram: BytesMut, remote: SocketAddr) {
    let cid = match dst_cid(&datagram, inner.endpoint_config.cid_len) {
        Some(x) => x,
        None => {
            trace!("dropping unroutable datagram");
            return;
        }
    };
    if let Some(session) = inner.sessions.get(&cid) {
        session.enqueue_datagram(datagram);
        return;
    }
    if !is_initial(&datagram) {
        trace!(%cid, "dropping datagram for unknown connection");
        return;
    }

    debug!(%cid, %remote, "new connection");
    let session = SessionShared::new(
        Side::Server,
        cid,
        remote,
        inner.socket.clone(),
        inner.transport_config.clone(),
    );
    inner.sessions.insert(session.clone());
    session.queue_handshake_done();
    session.enqueue_datagram(datagram);
    {
        let mut queue = inner.accept_queue.lock().unwrap();
        queue.push_back(Session::new(session.clone()));
    }
    inner.accept_notify.notify_one();

    let endpoint = inner.clone();
    tokio::spawn(async move {
        session.clone().run().await;
        endpoint.sessions.remove(&session.cid());
    });
}

/// Errors produced while establishing a connection
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Binding or configuring the UDP socket failed
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    /// The server did not answer within the handshake timeout
    #[error("connection attempt timed out")]
    TimedOut,
}

/// A QUIC client: one socket, one session
pub struct QuicClient {
    session: Session,
    shared: Arc<SessionShared>,
    shutdown_notify: Arc<Notify>,
}

impl QuicClient {
    /// Connect to a server with default configuration
    pub async fn connect(remote: SocketAddr) -> Result<Self, ConnectError> {
        Self::connect_with(remote, EndpointConfig::default(), TransportConfig::default()).await
    }

    /// Connect to a server with explicit configuration
    ///
    /// Generates a fresh connection id, announces it with a padded INITIAL
    /// packet, and waits for the server's first answer.
    pub async fn connect_with(
        remote: SocketAddr,
        endpoint_config: EndpointConfig,
        transport_config: TransportConfig,
    ) -> Result<Self, ConnectError> {
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let cid = ConnectionId::random(&mut rand::thread_rng(), endpoint_config.cid_len);
        let transport_config = Arc::new(transport_config);
        let shared = SessionShared::new(
            Side::Client,
            cid,
            remote,
            socket.clone(),
            transport_config.clone(),
        );
        let shutdown_notify = Arc::new(Notify::new());

        // Datagram driver: everything this socket receives belongs to the
        // one session
        {
            let shared = shared.clone();
            let socket = socket.clone();
            let shutdown = shutdown_notify.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
                loop {
                    tokio::select! {
                        result = socket.recv_from(&mut buf) => match result {
                            Ok((len, from)) => {
                                if from != remote {
                                    trace!(%from, "dropping datagram from unexpected peer");
                                    continue;
                                }
                                shared.enqueue_datagram(BytesMut::from(&buf[..len]));
                            }
                            Err(e) => {
                                warn!(error = %e, "client socket receive failed");
                                break;
                            }
                        },
                        _ = shutdown.notified() => break,
                    }
                    if !shared.is_alive() {
                        break;
                    }
                }
            });
        }
        {
            let shared = shared.clone();
            let shutdown = shutdown_notify.clone();
            tokio::spawn(async move {
                shared.clone().run().await;
                shutdown.notify_one();
            });
        }

        shared.queue_connect();
        let timeout = transport_config.handshake_timeout;
        if !shared.wait_established(timeout).await {
            debug!(%cid, "connect timed out");
            let session = Session::new(shared.clone());
            session.close(VarInt(0), b"connect timeout");
            shutdown_notify.notify_one();
            return Err(ConnectError::TimedOut);
        }
        debug!(%cid, %remote, "connected");
        Ok(Self {
            session: Session::new(shared.clone()),
            shared,
            shutdown_notify,
        })
    }

    /// The connection to the server
    pub fn session(&self) -> Session {
        self.session.clone()
    }

    /// Open a new stream on the connection
    pub async fn open_stream(&self) -> Result<Stream, ConnectionError> {
        self.session.open_stream().await
    }

    /// Close the connection and stop the socket driver
    pub fn close(&self) {
        self.session.close(VarInt(0), b"client shutdown");
        self.shutdown_notify.notify_one();
    }
}

impl std::fmt::Debug for QuicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicClient")
            .field("cid", &self.shared.cid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_by_short_header_cid() {
        let cid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut datagram = vec![0x40u8];
        datagram.extend_from_slice(&cid);
        datagram.extend_from_slice(b"payload");
        assert_eq!(dst_cid(&datagram, 8), Some(cid));
        // Routing context too long for the datagram
        assert_eq!(dst_cid(&datagram[..5], 8), None);
    }

    #[test]
    fn routes_by_long_header_cid() {
        let cid = ConnectionId::new(&[9, 9, 9, 9]);
        let mut datagram = vec![0xc0u8];
        datagram.extend_from_slice(&VERSION.to_be_bytes());
        datagram.push(cid.len() as u8);
        datagram.extend_from_slice(&cid);
        datagram.push(0); // empty source cid
        assert_eq!(dst_cid(&datagram, 8), Some(cid));
        assert!(is_initial(&datagram));
    }

    #[test]
    fn non_initial_does_not_create() {
        // Handshake type bits
        let mut datagram = vec![0xe0u8];
        datagram.extend_from_slice(&VERSION.to_be_bytes());
        datagram.push(0);
        assert!(!is_initial(&datagram));
    }
}
