//! Resilient upstream ingest.
//!
//! [`IngestClient`] keeps one RTSP connection to a camera or encoder alive,
//! depacketizes its H.264 video and hands every NAL unit, prefixed with the
//! Annex B start code, to a caller-supplied handler.
//!
//! ```text
//! Disconnected -> Connecting -> Negotiating -> Playing
//!                     ^                           |
//!                     +-------- Backoff <---------+ (error)
//!
//! close() -> Closed, from any state
//! ```
//!
//! The handler runs on a dedicated delivery thread fed by a bounded queue:
//! a slow handler loses access units instead of stalling the connection.

use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::client::{Connection, Connector, RtspClientConfig, RtspConnector};
use crate::error::{Result, RtspError};
use crate::media::{Depacketizer, RtpPacket, create_depacketizer, h264};
use crate::shutdown::Shutdown;
use crate::url::SourceUrl;

/// Annex B start code prefixed to every delivered NAL unit.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// How often a pending connect checks for [`IngestClient::close`].
const CONNECT_POLL: Duration = Duration::from_millis(50);

/// Error a handler may return. Logged, never propagated.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer of framed access units.
pub type AccessUnitHandler = Arc<dyn Fn(Vec<u8>) -> std::result::Result<(), HandlerError> + Send + Sync>;

/// How the delay between reconnect attempts evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Always wait the retry interval passed to [`IngestClient::run`].
    #[default]
    Fixed,
    /// Double the delay after every consecutive failure, up to `max`.
    Exponential { max: Duration },
}

/// Reconnect pacing: failed attempts since the last successful play and the
/// delay before the next one.
#[derive(Debug, Clone)]
pub struct RetryState {
    base: Duration,
    backoff: Backoff,
    attempt: u32,
    next: Duration,
}

impl RetryState {
    pub fn new(base: Duration, backoff: Backoff) -> Self {
        Self {
            base,
            backoff,
            attempt: 0,
            next: base,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_interval(&self) -> Duration {
        self.next
    }

    /// Count a failure. Returns the delay to wait before reconnecting.
    pub fn on_failure(&mut self) -> Duration {
        self.attempt += 1;
        let delay = self.next;
        self.next = match self.backoff {
            Backoff::Fixed => self.base,
            Backoff::Exponential { max } => self.next.saturating_mul(2).min(max.max(self.base)),
        };
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next = self.base;
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub backoff: Backoff,
    /// Consecutive benign decode results tolerated before the stream is
    /// considered stuck and the connection is restarted.
    pub max_benign_decode_streak: usize,
    /// Access units buffered for the handler before new ones are dropped.
    pub delivery_queue_size: usize,
    /// Used by the default [`RtspConnector`].
    pub client: RtspClientConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::Fixed,
            max_benign_decode_streak: 4096,
            delivery_queue_size: 64,
            client: RtspClientConfig::default(),
        }
    }
}

/// Observable ingest status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Disconnected,
    Connecting,
    Negotiating,
    Playing,
    Backoff,
    Closed,
}

/// Turns RTP packets into start-code framed NAL units.
pub struct AccessUnitExtractor {
    depacketizer: Box<dyn Depacketizer>,
    benign_streak: usize,
    max_benign_streak: usize,
}

impl AccessUnitExtractor {
    pub fn new(depacketizer: Box<dyn Depacketizer>, max_benign_streak: usize) -> Self {
        Self {
            depacketizer,
            benign_streak: 0,
            max_benign_streak,
        }
    }

    /// Feed one packet. Returns the framed NAL units it completed, possibly
    /// none. Fails on a non-benign decode error or once benign results
    /// exceed the configured streak.
    pub fn push(&mut self, packet: &RtpPacket) -> Result<Vec<Vec<u8>>> {
        match self.depacketizer.decode(packet) {
            Ok(nal_units) => {
                self.benign_streak = 0;
                Ok(nal_units.iter().map(|nal| frame(nal)).collect())
            }
            Err(e) if e.is_benign() => {
                self.benign_streak += 1;
                if self.benign_streak > self.max_benign_streak {
                    self.depacketizer.reset();
                    return Err(RtspError::DecodeStalled(self.benign_streak));
                }
                Ok(Vec::new())
            }
            Err(e) => {
                self.depacketizer.reset();
                Err(e.into())
            }
        }
    }
}

/// Prefix a NAL unit with [`START_CODE`].
pub fn frame(nal: &[u8]) -> Vec<u8> {
    let mut unit = Vec::with_capacity(START_CODE.len() + nal.len());
    unit.extend_from_slice(&START_CODE);
    unit.extend_from_slice(nal);
    unit
}

/// Packet callback state: extraction plus the queue towards the handler.
struct PacketSink {
    extractor: AccessUnitExtractor,
    queue: SyncSender<Vec<u8>>,
    dropped: u64,
    pts_warned: bool,
}

#[derive(Default)]
struct ActiveSlot {
    closed: bool,
    conn: Option<Arc<dyn Connection>>,
}

struct Inner {
    url: SourceUrl,
    connector: Arc<dyn Connector>,
    config: IngestConfig,
    handler: RwLock<Option<AccessUnitHandler>>,
    active: Mutex<ActiveSlot>,
    shutdown: Shutdown,
    state: watch::Sender<IngestState>,
    running: AtomicBool,
}

/// Resilient RTSP ingest client.
///
/// Cloning yields another handle on the same client, so one thread can
/// [`run`](Self::run) while another calls [`close`](Self::close).
#[derive(Clone)]
pub struct IngestClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for IngestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestClient")
            .field("url", &self.inner.url.to_string())
            .field("state", &self.state())
            .finish()
    }
}

/// Clears the running flag when `run` returns.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl IngestClient {
    /// Validate `address` and store the handler. No I/O.
    pub fn open<F>(address: &str, handler: F) -> Result<Self>
    where
        F: Fn(Vec<u8>) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        let config = IngestConfig::default();
        let connector = Arc::new(RtspConnector::new(config.client.clone()));
        Self::with_config(address, handler, config, connector)
    }

    pub fn with_config<F>(
        address: &str,
        handler: F,
        config: IngestConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self>
    where
        F: Fn(Vec<u8>) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        let url = SourceUrl::parse(address)?;
        if config.delivery_queue_size == 0 {
            return Err(RtspError::InvalidConfiguration(
                "delivery queue size must be positive".to_string(),
            ));
        }
        let (state, _) = watch::channel(IngestState::Disconnected);

        Ok(Self {
            inner: Arc::new(Inner {
                url,
                connector,
                config,
                handler: RwLock::new(Some(Arc::new(handler))),
                active: Mutex::new(ActiveSlot::default()),
                shutdown: Shutdown::new(),
                state,
                running: AtomicBool::new(false),
            }),
        })
    }

    pub fn url(&self) -> &SourceUrl {
        &self.inner.url
    }

    pub fn state(&self) -> IngestState {
        *self.inner.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<IngestState> {
        self.inner.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.active.lock().closed
    }

    /// Connect and ingest until [`close`](Self::close), reconnecting after
    /// every failure.
    ///
    /// A zero `retry_interval` disables reconnects: the first failure is
    /// returned. Otherwise returns `Ok(())` once closed.
    pub fn run(&self, retry_interval: Duration) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.inner.running);

        let mut retry = RetryState::new(retry_interval, self.inner.config.backoff);
        tracing::info!(url = %self.inner.url, retry_interval = ?retry_interval, "ingest starting");

        loop {
            if self.is_closed() {
                return Ok(());
            }

            let err = match self.connect_and_play(&mut retry) {
                Ok(()) => std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "upstream ended the session",
                )
                .into(),
                Err(e) => e,
            };
            self.release_connection();

            if self.is_closed() {
                return Ok(());
            }
            if retry_interval.is_zero() || !err.is_retryable() {
                tracing::error!(url = %self.inner.url, error = %err, "ingest failed");
                self.set_state(IngestState::Disconnected);
                return Err(err);
            }

            let delay = retry.on_failure();
            tracing::warn!(
                url = %self.inner.url,
                attempt = retry.attempt(),
                retry_in = ?delay,
                error = %err,
                "ingest failed, retrying"
            );
            self.set_state(IngestState::Backoff);

            if self.inner.shutdown.wait_timeout(delay) {
                return Ok(());
            }
        }
    }

    /// Stop ingesting: wake the backoff wait, close the active connection and
    /// drop the handler. Idempotent.
    pub fn close(&self) {
        let conn = {
            let mut slot = self.inner.active.lock();
            if slot.closed {
                return;
            }
            slot.closed = true;
            slot.conn.take()
        };

        self.inner.shutdown.trigger();
        self.inner.handler.write().take();
        if let Some(conn) = conn {
            conn.close();
        }
        self.inner.state.send_replace(IngestState::Closed);
        tracing::info!(url = %self.inner.url, "ingest closed");
    }

    /// One connection attempt, from connect to the end of playback.
    fn connect_and_play(&self, retry: &mut RetryState) -> Result<()> {
        self.set_state(IngestState::Connecting);
        let conn = self.connect()?;
        self.install(&conn)?;

        self.set_state(IngestState::Negotiating);
        let description = conn.describe()?;
        let (media_index, _, format) = description
            .find_video_format(h264::CODEC_NAME)
            .ok_or(RtspError::NoCompatibleMedia)?;
        let depacketizer = create_depacketizer(format)?;
        conn.setup(media_index)?;

        let (queue, deliveries) = mpsc::sync_channel(self.inner.config.delivery_queue_size);
        let inner = self.inner.clone();
        thread::Builder::new()
            .name("ingest-delivery".to_string())
            .spawn(move || {
                for unit in deliveries {
                    let Some(handler) = inner.handler.read().clone() else {
                        break;
                    };
                    if let Err(e) = handler(unit) {
                        tracing::warn!(error = %e, "access unit handler failed");
                    }
                }
            })?;

        let failure: Arc<Mutex<Option<RtspError>>> = Arc::new(Mutex::new(None));
        let sink = Mutex::new(PacketSink {
            extractor: AccessUnitExtractor::new(
                depacketizer,
                self.inner.config.max_benign_decode_streak,
            ),
            queue,
            dropped: 0,
            pts_warned: false,
        });
        let weak: Weak<dyn Connection> = Arc::downgrade(&conn);
        let reported = failure.clone();

        conn.on_packet_rtp(
            media_index,
            Box::new(move |packet: &RtpPacket| {
                let Some(conn) = weak.upgrade() else {
                    return;
                };
                let mut sink = sink.lock();

                if conn.packet_pts(media_index, packet).is_none() && !sink.pts_warned {
                    sink.pts_warned = true;
                    tracing::warn!(seq = packet.sequence_number, "presentation timestamp unavailable");
                }

                match sink.extractor.push(packet) {
                    Ok(units) => {
                        for unit in units {
                            match sink.queue.try_send(unit) {
                                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                                Err(TrySendError::Full(_)) => {
                                    sink.dropped += 1;
                                    if sink.dropped.is_power_of_two() {
                                        tracing::warn!(dropped = sink.dropped, "handler too slow, dropping access units");
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        drop(sink);
                        tracing::warn!(error = %e, "decoding failed, dropping connection");
                        reported.lock().get_or_insert(e);
                        conn.close();
                    }
                }
            }),
        );

        conn.play()?;
        self.set_state(IngestState::Playing);
        retry.reset();
        tracing::info!(url = %self.inner.url, media_index, "ingest playing");

        let waited = conn.wait();
        if let Some(e) = failure.lock().take() {
            return Err(e);
        }
        waited
    }

    /// Run the connector on its own thread so [`close`](Self::close) does
    /// not wait out a slow connect. A connection completing after close is
    /// closed by that thread.
    fn connect(&self) -> Result<Arc<dyn Connection>> {
        let (tx, rx) = mpsc::sync_channel(1);
        let connector = self.inner.connector.clone();
        let url = self.inner.url.clone();
        thread::Builder::new()
            .name("ingest-connect".to_string())
            .spawn(move || {
                if let Err(mpsc::SendError(Ok(conn))) = tx.send(connector.connect(&url)) {
                    tracing::debug!(url = %url, "connected after close, dropping connection");
                    conn.close();
                }
            })?;

        loop {
            match rx.recv_timeout(CONNECT_POLL) {
                Ok(result) => return result,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if self.inner.shutdown.is_triggered() {
                        return Err(RtspError::Closed);
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(std::io::Error::other("connect thread exited without a result").into());
                }
            }
        }
    }

    /// Make `conn` the active connection, unless the client was closed
    /// meanwhile.
    fn install(&self, conn: &Arc<dyn Connection>) -> Result<()> {
        let rejected = {
            let mut slot = self.inner.active.lock();
            if slot.closed {
                true
            } else {
                slot.conn = Some(conn.clone());
                false
            }
        };
        if rejected {
            conn.close();
            return Err(RtspError::Closed);
        }
        Ok(())
    }

    /// Close and forget the active connection.
    fn release_connection(&self) {
        let conn = self.inner.active.lock().conn.take();
        if let Some(conn) = conn {
            conn.close();
        }
    }

    fn set_state(&self, state: IngestState) {
        self.inner.state.send_if_modified(|current| {
            if *current == IngestState::Closed || *current == state {
                return false;
            }
            tracing::debug!(old_state = ?*current, new_state = ?state, "ingest state");
            *current = state;
            true
        });
    }
}
