//! The published stream and its fan-out to subscribers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::error::{Result, RtspError};
use crate::media::RtpPacket;
use crate::protocol::sdp::SessionDescription;
use crate::server::ServerConfig;
use crate::session::Session;
use crate::transport::Delivery;

/// A subscriber bound to the stream, with one delivery target per media
/// it set up.
struct Reader {
    session: Arc<Session>,
    targets: Vec<(usize, Delivery)>,
}

/// A description being served plus the sessions reading it.
///
/// Created from an announced description; every RTP packet written with
/// [`write_packet_rtp`](Self::write_packet_rtp) is forwarded to each
/// playing reader that set up the packet's media, in write order.
/// Forwarding never blocks.
pub struct ServerStream {
    description: SessionDescription,
    /// `description` as served to DESCRIBE: `trackID=N` controls, the
    /// server's origin.
    served: SessionDescription,
    readers: RwLock<HashMap<String, Reader>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStream")
            .field("medias", &self.description.media.len())
            .field("readers", &self.reader_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ServerStream {
    pub fn new(description: SessionDescription, config: &ServerConfig) -> Self {
        let mut served = description.with_track_controls();
        served.origin = Some(config.sdp_origin());
        if served.session_name.is_empty() {
            served.session_name = config.sdp_session_name.clone();
        }
        if !served.attributes.iter().any(|a| a.starts_with("tool:")) {
            served.attributes.insert(0, "tool:rtsp-relay".to_string());
        }

        Self {
            description,
            served,
            readers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// SDP body for DESCRIBE responses.
    pub fn sdp(&self) -> String {
        self.served.marshal()
    }

    /// Media a subscriber's SETUP URI refers to.
    pub fn media_index_for_uri(&self, uri: &str) -> Option<usize> {
        self.served.media_index_for_uri(uri)
    }

    /// Bind `session` to deliver media `media_index` through `delivery`.
    ///
    /// Fails with [`RtspError::Closed`] once the stream is closed.
    pub fn add_reader(&self, session: &Arc<Session>, media_index: usize, delivery: Delivery) -> Result<()> {
        let mut readers = self.readers.write();
        if self.is_closed() {
            return Err(RtspError::Closed);
        }
        let reader = readers.entry(session.id.clone()).or_insert_with(|| Reader {
            session: session.clone(),
            targets: Vec::new(),
        });
        reader.targets.retain(|(idx, _)| *idx != media_index);
        reader.targets.push((media_index, delivery));

        tracing::debug!(session_id = %session.id, media_index, readers = readers.len(), "reader added");
        Ok(())
    }

    pub fn remove_reader(&self, session_id: &str) {
        if self.readers.write().remove(session_id).is_some() {
            tracing::debug!(session_id, "reader removed");
        }
    }

    pub fn reader_count(&self) -> usize {
        self.readers.read().len()
    }

    /// Forward one RTP packet of media `media_index` to every playing
    /// reader. The packet is marshaled once and shared.
    pub fn write_packet_rtp(&self, media_index: usize, packet: &RtpPacket) {
        if self.is_closed() {
            return;
        }
        let data = packet.marshal();
        let readers = self.readers.read();
        for reader in readers.values() {
            if !reader.session.is_playing() {
                continue;
            }
            for (_, delivery) in reader.targets.iter().filter(|(idx, _)| *idx == media_index) {
                delivery.send(&data);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop forwarding and disconnect every reader. Idempotent.
    pub fn close(&self) {
        let readers: Vec<Reader> = {
            let mut readers = self.readers.write();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            readers.drain().map(|(_, r)| r).collect()
        };

        tracing::info!(readers = readers.len(), "closing stream");
        for reader in readers {
            reader.session.close();
        }
    }
}
