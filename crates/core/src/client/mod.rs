//! Upstream RTSP client seams.
//!
//! The ingest loop only talks to a [`Connector`] and the [`Connection`]s it
//! returns; [`rtsp::RtspConnector`] is the bundled implementation over
//! RTP/AVP/TCP interleaved transport. Tests substitute their own.

pub mod rtsp;

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::media::RtpPacket;
use crate::protocol::sdp::SessionDescription;
use crate::url::SourceUrl;

pub use rtsp::{RtspClientConfig, RtspConnector};

/// Callback receiving the RTP packets of one media, in arrival order.
pub type RtpCallback = Box<dyn Fn(&RtpPacket) + Send + Sync>;

/// Opens connections to an upstream.
pub trait Connector: Send + Sync {
    /// Establish the transport. Fails with
    /// [`RtspError::Connect`](crate::RtspError::Connect) when the upstream
    /// cannot be reached.
    fn connect(&self, url: &SourceUrl) -> Result<Arc<dyn Connection>>;
}

/// One live upstream connection.
///
/// Methods take `&self` so that [`close`](Self::close) can be called from
/// another thread while [`wait`](Self::wait) (or any negotiation step)
/// blocks.
pub trait Connection: Send + Sync {
    /// Ask for the stream description.
    fn describe(&self) -> Result<SessionDescription>;

    /// Set up delivery of media `media_index` of the described stream.
    fn setup(&self, media_index: usize) -> Result<()>;

    /// Register the callback for packets of `media_index`. Must be called
    /// before [`play`](Self::play).
    fn on_packet_rtp(&self, media_index: usize, callback: RtpCallback);

    /// Start delivery.
    fn play(&self) -> Result<()>;

    /// Presentation timestamp of a packet of `media_index`, relative to the
    /// first packet received on it. `None` when the clock is unknown.
    fn packet_pts(&self, media_index: usize, packet: &RtpPacket) -> Option<Duration>;

    /// Block until the connection ends: `Ok(())` after [`close`](Self::close),
    /// the transport error otherwise.
    fn wait(&self) -> Result<()>;

    /// Tear the connection down. Idempotent; unblocks every pending call.
    fn close(&self);
}
