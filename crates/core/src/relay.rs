//! Single-publisher RTSP relay.
//!
//! A publisher ANNOUNCEs a description and RECORDs over interleaved TCP;
//! every RTP packet it sends is fanned out to the subscribers that
//! DESCRIBEd, SETUP and PLAYed the current stream. There is one stream
//! regardless of the request path.
//!
//! The current `(stream, publisher)` pair lives in one `Option` behind one
//! mutex, so a stream never exists without its publisher. The mutex is
//! only held to read or swap the pair and to publish the matching
//! [`PublishState`]; closing sessions and streams happens after it is
//! released.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Result, RtspError};
use crate::media::RtpPacket;
use crate::protocol::sdp::SessionDescription;
use crate::protocol::{RtspRequest, RtspResponse};
use crate::server::{Reply, Server, ServerConfig, ServerHandler};
use crate::session::Session;
use crate::stream::ServerStream;
use crate::transport::ConnHandle;

/// What happens when a client announces while another one is publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishPolicy {
    /// The newcomer wins; the previous publisher and its subscribers are
    /// disconnected.
    #[default]
    ReplaceExisting,
    /// The newcomer is refused with `503 Service Unavailable`.
    RejectWhileActive,
}

/// Observable publishing status of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    /// No publisher.
    Waiting,
    /// A publisher announced a stream but is not sending yet.
    Announced,
    /// The publisher is sending media.
    Recording,
}

#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub publish_policy: PublishPolicy,
}

/// The stream currently served and the session publishing it.
struct Publication {
    stream: Arc<ServerStream>,
    publisher: Arc<Session>,
}

/// Relay decisions, invoked by the server engine.
struct RelayState {
    config: RelayConfig,
    current: Mutex<Option<Publication>>,
    status: watch::Sender<PublishState>,
    closed: AtomicBool,
}

impl RelayState {
    fn current_stream(&self) -> Option<Arc<ServerStream>> {
        self.current.lock().as_ref().map(|p| p.stream.clone())
    }
}

impl ServerHandler for RelayState {
    fn on_conn_open(&self, conn: &Arc<ConnHandle>) {
        tracing::debug!(peer = %conn.peer_addr(), conn_id = conn.id(), "connection opened");
    }

    fn on_conn_close(&self, conn: &Arc<ConnHandle>, reason: &str) {
        tracing::debug!(peer = %conn.peer_addr(), conn_id = conn.id(), reason, "connection closed");
    }

    fn on_session_open(&self, session: &Arc<Session>) {
        tracing::debug!(session_id = %session.id, peer = %session.peer_addr(), "session opened");
    }

    fn on_session_close(&self, session: &Arc<Session>) {
        let taken = {
            let mut current = self.current.lock();
            if current
                .as_ref()
                .is_some_and(|p| Arc::ptr_eq(&p.publisher, session))
            {
                self.status.send_replace(PublishState::Waiting);
                current.take()
            } else {
                None
            }
        };

        match taken {
            Some(publication) => {
                tracing::info!(session_id = %session.id, "publisher left, closing stream");
                publication.stream.close();
            }
            None => {
                tracing::debug!(session_id = %session.id, "session closed");
            }
        }
    }

    fn on_describe(&self, request: &RtspRequest) -> Reply<Arc<ServerStream>> {
        self.current_stream().ok_or_else(|| {
            tracing::debug!(uri = %request.uri, "DESCRIBE without a stream");
            RtspResponse::not_found()
        })
    }

    fn on_announce(
        &self,
        session: &Arc<Session>,
        request: &RtspRequest,
        description: &SessionDescription,
    ) -> Reply<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RtspResponse::new(503, "Service Unavailable"));
        }

        let stream = Arc::new(ServerStream::new(description.clone(), &self.config.server));

        let previous = {
            let mut current = self.current.lock();
            if self.config.publish_policy == PublishPolicy::RejectWhileActive
                && current
                    .as_ref()
                    .is_some_and(|p| !Arc::ptr_eq(&p.publisher, session))
            {
                tracing::warn!(session_id = %session.id, uri = %request.uri, "refusing publisher, stream already active");
                return Err(RtspResponse::new(503, "Service Unavailable"));
            }
            self.status.send_replace(PublishState::Announced);
            current.replace(Publication {
                stream,
                publisher: session.clone(),
            })
        };

        tracing::info!(session_id = %session.id, peer = %session.peer_addr(), uri = %request.uri, "publisher announced");

        if let Some(previous) = previous {
            previous.stream.close();
            if !Arc::ptr_eq(&previous.publisher, session) {
                tracing::info!(
                    session_id = %previous.publisher.id,
                    peer = %previous.publisher.peer_addr(),
                    "evicting previous publisher"
                );
                previous.publisher.close();
            }
        }

        Ok(())
    }

    fn on_setup(&self, request: &RtspRequest) -> Reply<Arc<ServerStream>> {
        self.current_stream().ok_or_else(|| {
            tracing::debug!(uri = %request.uri, "SETUP without a stream");
            RtspResponse::not_found()
        })
    }

    fn on_play(&self, session: &Arc<Session>, request: &RtspRequest) -> Reply<()> {
        tracing::info!(session_id = %session.id, peer = %session.peer_addr(), uri = %request.uri, "subscriber playing");
        Ok(())
    }

    fn on_record(&self, session: &Arc<Session>, request: &RtspRequest) -> Reply<()> {
        let stream = {
            let current = self.current.lock();
            match current.as_ref() {
                Some(p) if Arc::ptr_eq(&p.publisher, session) => {
                    self.status.send_replace(PublishState::Recording);
                    p.stream.clone()
                }
                _ => {
                    tracing::warn!(session_id = %session.id, uri = %request.uri, "RECORD from a session that is not the publisher");
                    return Err(RtspResponse::method_not_valid());
                }
            }
        };

        session.on_packet_rtp_any(Box::new(move |media_index, packet: &RtpPacket| {
            stream.write_packet_rtp(media_index, packet);
        }));

        tracing::info!(session_id = %session.id, "publisher recording");
        Ok(())
    }
}

struct Inner {
    port: u16,
    state: Arc<RelayState>,
    server: Mutex<Option<Arc<Server>>>,
}

/// RTSP relay accepting one publisher and any number of subscribers.
///
/// Cloning yields another handle on the same relay, so one thread can
/// [`run`](Self::run) while another calls [`close`](Self::close).
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<Inner>,
}

impl RelayServer {
    /// Create a relay for `port` with the default configuration. No I/O.
    pub fn open(port: u16) -> Result<Self> {
        Self::with_config(port, RelayConfig::default())
    }

    pub fn with_config(port: u16, config: RelayConfig) -> Result<Self> {
        if port == 0 {
            return Err(RtspError::InvalidConfiguration(
                "relay port must be in 1..=65535".to_string(),
            ));
        }
        let (status, _) = watch::channel(PublishState::Waiting);
        Ok(Self {
            inner: Arc::new(Inner {
                port,
                state: Arc::new(RelayState {
                    config,
                    current: Mutex::new(None),
                    status,
                    closed: AtomicBool::new(false),
                }),
                server: Mutex::new(None),
            }),
        })
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Listen on `0.0.0.0:port` and serve until [`close`](Self::close).
    ///
    /// Returns `Ok(())` once closed, or the listen error.
    pub fn run(&self) -> Result<()> {
        let state = &self.inner.state;
        let server = {
            let mut slot = self.inner.server.lock();
            if state.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            if slot.is_some() {
                return Err(RtspError::AlreadyRunning);
            }
            let server = Arc::new(Server::with_config(
                &format!("0.0.0.0:{}", self.inner.port),
                state.config.server.clone(),
                state.clone(),
            ));
            *slot = Some(server.clone());
            server
        };

        tracing::info!(port = self.inner.port, policy = ?state.config.publish_policy, "relay starting");
        let result = server.run();

        {
            let mut slot = self.inner.server.lock();
            if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, &server)) {
                *slot = None;
            }
        }

        match result {
            Err(RtspError::Closed) => Ok(()),
            other => other,
        }
    }

    /// Stop listening, disconnect every session and drop the stream.
    /// Idempotent.
    pub fn close(&self) {
        let state = &self.inner.state;
        if state.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let server = self.inner.server.lock().take();
        if let Some(server) = server {
            server.stop();
        }

        let publication = {
            let mut current = state.current.lock();
            state.status.send_replace(PublishState::Waiting);
            current.take()
        };
        if let Some(publication) = publication {
            publication.stream.close();
            publication.publisher.close();
        }

        tracing::info!(port = self.inner.port, "relay closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.closed.load(Ordering::SeqCst)
    }

    /// Current publishing status.
    pub fn status(&self) -> PublishState {
        *self.inner.state.status.borrow()
    }

    /// Receiver notified on every publishing status change.
    pub fn subscribe_status(&self) -> watch::Receiver<PublishState> {
        self.inner.state.status.subscribe()
    }

    /// Whether a stream is currently published.
    pub fn has_stream(&self) -> bool {
        self.inner.state.current_stream().is_some()
    }

    /// Subscribers bound to the current stream.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .state
            .current_stream()
            .map_or(0, |s| s.reader_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &str = "v=0\r\ns=Cam\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n";

    fn state(policy: PublishPolicy) -> RelayState {
        let (status, _) = watch::channel(PublishState::Waiting);
        RelayState {
            config: RelayConfig {
                server: ServerConfig::default(),
                publish_policy: policy,
            },
            current: Mutex::new(None),
            status,
            closed: AtomicBool::new(false),
        }
    }

    fn session() -> Arc<Session> {
        Arc::new(Session::new(Arc::new(ConnHandle::detached(
            "127.0.0.1:7000".parse().unwrap(),
        ))))
    }

    fn request(method: &str) -> RtspRequest {
        RtspRequest::new(method, "rtsp://127.0.0.1:8554/live")
    }

    fn announce(state: &RelayState, session: &Arc<Session>) -> Reply<()> {
        let description = SessionDescription::parse(SDP).unwrap();
        state.on_announce(session, &request("ANNOUNCE"), &description)
    }

    #[test]
    fn open_rejects_port_zero() {
        assert!(matches!(
            RelayServer::open(0),
            Err(RtspError::InvalidConfiguration(_))
        ));
        assert_eq!(RelayServer::open(8554).unwrap().port(), 8554);
    }

    #[test]
    fn describe_and_setup_404_without_stream() {
        let state = state(PublishPolicy::default());
        assert_eq!(state.on_describe(&request("DESCRIBE")).unwrap_err().status_code, 404);
        assert_eq!(state.on_setup(&request("SETUP")).unwrap_err().status_code, 404);
    }

    #[test]
    fn announce_publishes_stream() {
        let state = state(PublishPolicy::default());
        let publisher = session();
        announce(&state, &publisher).unwrap();
        assert!(state.on_describe(&request("DESCRIBE")).is_ok());
        assert_eq!(*state.status.borrow(), PublishState::Announced);
    }

    #[test]
    fn new_announce_evicts_previous_publisher() {
        let state = state(PublishPolicy::ReplaceExisting);
        let first = session();
        let second = session();

        announce(&state, &first).unwrap();
        let first_stream = state.current_stream().unwrap();
        announce(&state, &second).unwrap();

        assert!(first.is_closed());
        assert!(first_stream.is_closed());
        assert!(!second.is_closed());
        let current = state.current.lock();
        let publication = current.as_ref().unwrap();
        assert!(Arc::ptr_eq(&publication.publisher, &second));
        assert!(!publication.stream.is_closed());
    }

    #[test]
    fn reannounce_by_same_session_keeps_it() {
        let state = state(PublishPolicy::ReplaceExisting);
        let publisher = session();
        announce(&state, &publisher).unwrap();
        let old_stream = state.current_stream().unwrap();
        announce(&state, &publisher).unwrap();
        assert!(old_stream.is_closed());
        assert!(!publisher.is_closed());
        assert!(state.current_stream().is_some());
    }

    #[test]
    fn reject_policy_refuses_second_publisher() {
        let state = state(PublishPolicy::RejectWhileActive);
        let first = session();
        announce(&state, &first).unwrap();
        let err = announce(&state, &session()).unwrap_err();
        assert_eq!(err.status_code, 503);
        assert!(!first.is_closed());
    }

    #[test]
    fn only_publisher_close_clears_stream() {
        let state = state(PublishPolicy::default());
        let publisher = session();
        let subscriber = session();
        announce(&state, &publisher).unwrap();
        let stream = state.current_stream().unwrap();

        state.on_session_close(&subscriber);
        assert!(state.current_stream().is_some());
        assert!(!stream.is_closed());

        state.on_session_close(&publisher);
        assert!(state.current_stream().is_none());
        assert!(stream.is_closed());
        assert_eq!(*state.status.borrow(), PublishState::Waiting);
    }

    #[test]
    fn evicted_publisher_close_is_ignored() {
        let state = state(PublishPolicy::default());
        let first = session();
        let second = session();
        announce(&state, &first).unwrap();
        announce(&state, &second).unwrap();

        state.on_session_close(&first);
        assert!(state.current_stream().is_some());
    }

    #[test]
    fn record_only_by_publisher() {
        let state = state(PublishPolicy::default());
        let publisher = session();
        announce(&state, &publisher).unwrap();

        let err = state.on_record(&session(), &request("RECORD")).unwrap_err();
        assert_eq!(err.status_code, 455);

        state.on_record(&publisher, &request("RECORD")).unwrap();
        assert_eq!(*state.status.borrow(), PublishState::Recording);
    }

    #[test]
    fn status_tracks_publication_under_concurrent_handover() {
        use std::sync::Barrier;
        use std::thread;

        let state = Arc::new(state(PublishPolicy::ReplaceExisting));
        for _ in 0..2000 {
            let first = session();
            let second = session();
            announce(&state, &first).unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let leaving = {
                let (state, barrier) = (state.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    state.on_session_close(&first);
                })
            };
            let arriving = {
                let (state, barrier) = (state.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    announce(&state, &second).unwrap();
                })
            };
            leaving.join().unwrap();
            arriving.join().unwrap();

            let current = state.current.lock();
            let status = *state.status.borrow();
            assert!(current.is_some());
            assert_eq!(status, PublishState::Announced);
        }
    }

    #[test]
    fn close_is_idempotent_and_drops_stream() {
        let relay = RelayServer::open(18599).unwrap();
        let mut status = relay.subscribe_status();
        relay.close();
        relay.close();
        assert!(relay.is_closed());
        assert!(!relay.has_stream());
        assert_eq!(*status.borrow_and_update(), PublishState::Waiting);
        // run after close returns immediately
        relay.run().unwrap();
    }
}
