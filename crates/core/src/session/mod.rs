//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! An RTSP session is a server-side state object created by the first
//! ANNOUNCE or SETUP of a client and destroyed by TEARDOWN or by the loss
//! of its connection. It tracks:
//!
//! - A unique session ID (hex string, returned in the `Session` header).
//! - Its role and state: a subscriber (Ready -> Playing <-> Paused) or a
//!   publisher (Announced -> Recording).
//! - For publishers, the announced description and the interleaved channel
//!   of every media set up for recording.
//! - For subscribers, the stream it is bound to.
//!
//! ## Session lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! SETUP          -> Ready
//! PLAY           -> Playing
//! PAUSE          -> Paused   (from Playing)
//! ANNOUNCE       -> Announced
//! RECORD         -> Recording (from Announced)
//! TEARDOWN       -> (removed)
//! TCP disconnect -> (removed, via cleanup)
//! ```

pub mod transport;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::media::RtpPacket;
use crate::protocol::sdp::SessionDescription;
use crate::stream::ServerStream;
use crate::transport::tcp::ConnHandle;
pub use transport::TransportHeader;

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// Callback receiving every RTP packet recorded by a publisher session,
/// with the index of the media it belongs to.
pub type PacketCallback = Box<dyn Fn(usize, &RtpPacket) + Send + Sync>;

/// RTSP session state machine (RFC 2326 §A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Subscriber set up, not yet playing.
    Ready,
    /// Media is being delivered to the client.
    Playing,
    /// Delivery suspended; can resume via PLAY.
    Paused,
    /// Publisher announced a description, not yet recording.
    Announced,
    /// Publisher is sending media.
    Recording,
}

/// A single RTSP session (RFC 2326 §3).
///
/// Interior mutability via `RwLock` allows shared references across the
/// connection thread, the relay and the stream fan-out.
pub struct Session {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    /// Session timeout in seconds (included in the `Session` response header).
    pub timeout_secs: u64,
    conn: Arc<ConnHandle>,
    state: RwLock<SessionState>,
    announced: RwLock<Option<SessionDescription>>,
    /// Interleaved RTP channel -> media index, for recording.
    record_channels: RwLock<HashMap<u8, usize>>,
    packet_callback: RwLock<Option<PacketCallback>>,
    stream: RwLock<Option<Weak<ServerStream>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.conn.peer_addr())
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a new session with a random ID, owned by `conn`.
    pub fn new(conn: Arc<ConnHandle>) -> Self {
        Session {
            id: format!("{:016X}", rand::random::<u64>()),
            timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            conn,
            state: RwLock::new(SessionState::Ready),
            announced: RwLock::new(None),
            record_channels: RwLock::new(HashMap::new()),
            packet_callback: RwLock::new(None),
            stream: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn conn(&self) -> &Arc<ConnHandle> {
        &self.conn
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    /// Transition to a new state.
    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        tracing::debug!(session_id = %self.id, old_state = ?*current, new_state = ?state, "state transition");
        *current = state;
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Whether this session is actively receiving media.
    pub fn is_playing(&self) -> bool {
        !self.is_closed() && *self.state.read() == SessionState::Playing
    }

    /// Whether this session announced a description (publisher role).
    pub fn is_publisher(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Announced | SessionState::Recording
        )
    }

    /// Record the description announced by this session.
    pub fn set_announced(&self, description: SessionDescription) {
        *self.announced.write() = Some(description);
        self.record_channels.write().clear();
        self.set_state(SessionState::Announced);
    }

    pub fn announced(&self) -> Option<SessionDescription> {
        self.announced.read().clone()
    }

    /// Map an interleaved RTP channel to a media index for recording.
    pub fn add_record_channel(&self, channel: u8, media_index: usize) {
        self.record_channels.write().insert(channel, media_index);
    }

    pub fn has_record_channels(&self) -> bool {
        !self.record_channels.read().is_empty()
    }

    /// Media index recorded on `channel`, if any.
    pub fn record_media_index(&self, channel: u8) -> Option<usize> {
        self.record_channels.read().get(&channel).copied()
    }

    /// Register the callback invoked for every RTP packet this session
    /// records, on any media. Replaces a previous callback.
    pub fn on_packet_rtp_any(&self, callback: PacketCallback) {
        *self.packet_callback.write() = Some(callback);
    }

    /// Hand a received RTP packet to the registered callback.
    pub fn dispatch_rtp(&self, media_index: usize, packet: &RtpPacket) {
        if self.is_closed() || self.state() != SessionState::Recording {
            return;
        }
        if let Some(callback) = self.packet_callback.read().as_ref() {
            callback(media_index, packet);
        }
    }

    /// Remember the stream this subscriber reads from.
    pub fn bind_stream(&self, stream: &Arc<ServerStream>) {
        *self.stream.write() = Some(Arc::downgrade(stream));
    }

    pub fn stream(&self) -> Option<Arc<ServerStream>> {
        self.stream.read().as_ref().and_then(Weak::upgrade)
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"3F2A9C0D11E5B7A4;timeout=60"`
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the session from outside its connection: stop dispatching and
    /// drop the client's connection. The connection thread then removes the
    /// session and reports it closed.
    pub fn close(&self) {
        if self.terminate() {
            tracing::info!(session_id = %self.id, peer = %self.peer_addr(), "closing session");
        }
        self.conn.close();
    }

    /// Mark closed and release the packet callback.
    /// Returns `false` if the session was already terminated.
    pub(crate) fn terminate(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.packet_callback.write().take();
        true
    }
}

/// Thread-safe registry of active sessions.
///
/// Backed by `parking_lot::RwLock` for fast concurrent reads.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new session owned by `conn` and register it.
    pub fn create_session(&self, conn: &Arc<ConnHandle>) -> Arc<Session> {
        let session = Arc::new(Session::new(conn.clone()));
        let id = session.id.clone();
        let total = {
            let mut sessions = self.sessions.write();
            sessions.insert(id.clone(), session.clone());
            sessions.len()
        };

        tracing::debug!(session_id = %id, peer = %conn.peer_addr(), total_sessions = total, "session created");

        session
    }

    /// Look up a session by ID.
    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove and return a session by ID.
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session removed");
        }
        removed
    }
}
