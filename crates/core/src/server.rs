use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Result, RtspError};
use crate::protocol::sdp::SessionDescription;
use crate::protocol::{RtspRequest, RtspResponse};
use crate::session::{DEFAULT_SESSION_TIMEOUT_SECS, Session, SessionManager};
use crate::stream::ServerStream;
use crate::transport::tcp::{self, ConnHandle};
use crate::transport::UdpTransport;

/// Default capacity of a connection's outbound queue, in messages.
pub const DEFAULT_WRITE_QUEUE_SIZE: usize = 512;

/// Server-level configuration used by protocol handlers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host advertised in the SDP `o=` line. `0.0.0.0` when `None`.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`) used when the publisher announced none.
    pub sdp_session_name: String,
    /// Idle time after which a silent connection is dropped (RFC 2326 §12.37).
    pub session_timeout: Duration,
    /// Offer RTP/AVP (UDP) delivery to subscribers.
    pub enable_udp: bool,
    /// Capacity of each connection's outbound queue. Media is dropped,
    /// never queued beyond it.
    pub write_queue_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            enable_udp: true,
            write_queue_size: DEFAULT_WRITE_QUEUE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Value of the SDP `o=` line for served descriptions.
    pub fn sdp_origin(&self) -> String {
        format!(
            "{} {} {} IN IP4 {}",
            self.sdp_username,
            self.sdp_session_id,
            self.sdp_session_version,
            self.public_host.as_deref().unwrap_or("0.0.0.0")
        )
    }
}

/// Outcome of a [`ServerHandler`] decision: the value on success, or the
/// negative response to send.
pub type Reply<T> = std::result::Result<T, RtspResponse>;

/// Application hooks invoked by the server for connection, session and
/// method events.
///
/// All methods run on the calling connection's thread. Implementations
/// must not block on I/O while holding their own locks; closing a session
/// or a stream from a hook is allowed.
pub trait ServerHandler: Send + Sync {
    fn on_conn_open(&self, _conn: &Arc<ConnHandle>) {}

    fn on_conn_close(&self, _conn: &Arc<ConnHandle>, _reason: &str) {}

    fn on_session_open(&self, _session: &Arc<Session>) {}

    /// Called once per session, after it stopped receiving and delivering
    /// media.
    fn on_session_close(&self, _session: &Arc<Session>) {}

    /// DESCRIBE: the stream to describe.
    fn on_describe(&self, request: &RtspRequest) -> Reply<Arc<ServerStream>>;

    /// ANNOUNCE: accept or refuse a publisher's description.
    fn on_announce(
        &self,
        session: &Arc<Session>,
        request: &RtspRequest,
        description: &SessionDescription,
    ) -> Reply<()>;

    /// SETUP by a subscriber: the stream to read from.
    fn on_setup(&self, request: &RtspRequest) -> Reply<Arc<ServerStream>>;

    fn on_play(&self, _session: &Arc<Session>, _request: &RtspRequest) -> Reply<()> {
        Ok(())
    }

    /// RECORD: the publisher is about to send media.
    fn on_record(&self, session: &Arc<Session>, request: &RtspRequest) -> Reply<()>;
}

/// State shared by the accept loop and every connection thread.
pub(crate) struct ServerContext {
    pub(crate) sessions: SessionManager,
    pub(crate) handler: Arc<dyn ServerHandler>,
    pub(crate) config: Arc<ServerConfig>,
    udp: OnceLock<Arc<UdpTransport>>,
    connections: Mutex<HashMap<u64, Arc<ConnHandle>>>,
    stopped: AtomicBool,
}

impl ServerContext {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn udp(&self) -> Option<&Arc<UdpTransport>> {
        self.udp.get()
    }

    pub(crate) fn register_connection(&self, conn: &Arc<ConnHandle>) {
        self.connections.lock().insert(conn.id(), conn.clone());
        // a stop() that ran before the insert would have missed it
        if self.is_stopped() {
            conn.close();
        }
    }

    pub(crate) fn unregister_connection(&self, conn: &Arc<ConnHandle>) {
        self.connections.lock().remove(&conn.id());
    }

    fn close_connections(&self) -> usize {
        let conns: Vec<Arc<ConnHandle>> = self.connections.lock().values().cloned().collect();
        for conn in &conns {
            conn.close();
        }
        conns.len()
    }
}

/// RTSP server engine.
///
/// Owns the session manager, the connection registry and the UDP sender.
/// Delegates TCP connection handling to [`transport::tcp`](crate::transport::tcp)
/// and every application decision to a [`ServerHandler`].
pub struct Server {
    ctx: Arc<ServerContext>,
    running: AtomicBool,
    bind_addr: String,
}

impl Server {
    /// Create a server with custom protocol/SDP configuration.
    pub fn with_config(bind_addr: &str, config: ServerConfig, handler: Arc<dyn ServerHandler>) -> Self {
        Self {
            ctx: Arc::new(ServerContext {
                sessions: SessionManager::new(),
                handler,
                config: Arc::new(config),
                udp: OnceLock::new(),
                connections: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
            }),
            running: AtomicBool::new(false),
            bind_addr: bind_addr.to_string(),
        }
    }

    /// Bind and serve until [`stop`](Self::stop) is called.
    ///
    /// Returns the bind error if the address cannot be listened on,
    /// [`RtspError::AlreadyRunning`] for a second concurrent call and
    /// [`RtspError::Closed`] after `stop`.
    pub fn run(&self) -> Result<()> {
        if self.ctx.is_stopped() {
            return Err(RtspError::Closed);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }

        let result = self.serve();

        let closed = self.ctx.close_connections();
        if closed > 0 {
            tracing::debug!(closed, "closed remaining connections");
        }
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn serve(&self) -> Result<()> {
        if self.ctx.config.enable_udp && self.ctx.udp().is_none() {
            let _ = self.ctx.udp.set(Arc::new(UdpTransport::bind()?));
        }

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;

        tracing::info!(addr = %self.bind_addr, "RTSP server listening");

        tcp::accept_loop(listener, self.ctx.clone());
        Ok(())
    }

    /// Stop accepting and drop every connection. Idempotent.
    pub fn stop(&self) {
        if self.ctx.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let closed = self.ctx.close_connections();
        tracing::info!(connections = closed, "server stopping");
    }
}
