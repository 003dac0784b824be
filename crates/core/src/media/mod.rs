//! Media payload handling: RTP packets and codec depacketization.
//!
//! The relay forwards RTP packets untouched; only the ingest client looks
//! inside them. It turns the RTP payload of the selected video media back
//! into NAL units with a codec-specific [`Depacketizer`].
//!
//! ## Supported codecs
//!
//! | Codec | Module | RFC | Status |
//! |-------|--------|-----|--------|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) | Single NAL, STAP-A, FU-A |

pub mod h264;
pub mod rtp;

use crate::error::{Result, RtspError};
use crate::protocol::sdp::Format;

pub use h264::H264Depacketizer;
pub use rtp::RtpPacket;

/// Errors reported by a [`Depacketizer`].
///
/// Two of them are progress reports rather than failures, see
/// [`is_benign`](Self::is_benign).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// A continuation fragment arrived before any starting fragment,
    /// typically right after joining a stream mid-frame.
    #[error("received a non-starting fragment without any previous starting fragment")]
    NonStartingPacketAndNoPrevious,

    /// The packet was consumed but the access unit is not complete yet.
    #[error("need more packets")]
    MorePacketsNeeded,

    /// A sequence number gap or an interrupted fragment run.
    #[error("discarding access unit since an RTP packet is missing")]
    PacketLost,

    #[error("malformed payload: {0}")]
    Malformed(&'static str),

    #[error("packet type {0} is not supported")]
    UnsupportedPacketType(u8),

    #[error("access unit size ({size}) exceeds limit ({max})")]
    AccessUnitTooLarge { size: usize, max: usize },

    #[error("NAL unit count ({count}) exceeds limit ({max})")]
    TooManyNalUnits { count: usize, max: usize },
}

impl DecodeError {
    /// Whether the decoder is merely waiting for more data.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::NonStartingPacketAndNoPrevious | Self::MorePacketsNeeded
        )
    }
}

/// NAL units of one complete access unit, or why there are none yet.
pub type DecodeResult = std::result::Result<Vec<Vec<u8>>, DecodeError>;

/// Codec-specific RTP depacketizer.
///
/// Fed one RTP packet at a time, in arrival order. Returns the NAL units
/// of an access unit once the packet carrying the RTP marker bit completes
/// it, or a [`DecodeError`] otherwise.
pub trait Depacketizer: Send {
    fn decode(&mut self, packet: &RtpPacket) -> DecodeResult;

    /// Codec name as used in `a=rtpmap` (e.g. `"H264"`).
    fn codec_name(&self) -> &'static str;

    /// Drop any partially assembled fragment or access unit.
    fn reset(&mut self);
}

/// Build the depacketizer for an SDP format.
///
/// Fails with [`RtspError::DecoderInit`] when the codec is unknown or its
/// parameters ask for a mode the depacketizer cannot handle.
pub fn create_depacketizer(format: &Format) -> Result<Box<dyn Depacketizer>> {
    if format.is_codec(h264::CODEC_NAME) {
        let depacketizer = H264Depacketizer::from_format(format)?;
        return Ok(Box::new(depacketizer));
    }
    Err(RtspError::DecoderInit(format!(
        "no depacketizer for payload type {} ({})",
        format.payload_type,
        format.encoding.as_deref().unwrap_or("unknown")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_conditions() {
        assert!(DecodeError::NonStartingPacketAndNoPrevious.is_benign());
        assert!(DecodeError::MorePacketsNeeded.is_benign());
        assert!(!DecodeError::PacketLost.is_benign());
        assert!(!DecodeError::UnsupportedPacketType(25).is_benign());
    }

    #[test]
    fn create_for_unknown_codec_fails() {
        let format = Format {
            payload_type: 97,
            encoding: Some("VP8".to_string()),
            clock_rate: 90000,
            channels: None,
            fmtp: None,
        };
        assert!(matches!(
            create_depacketizer(&format),
            Err(RtspError::DecoderInit(_))
        ));
    }
}
