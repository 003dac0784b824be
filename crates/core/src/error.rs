//! Error types for the relay library.

use std::fmt;

use crate::media::DecodeError;

/// Errors that can occur in the relay library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Caller**: [`InvalidConfiguration`](Self::InvalidConfiguration): bad
///   address, port or handler. Never retried.
/// - **Upstream**: [`Connect`](Self::Connect), [`Negotiation`](Self::Negotiation),
///   [`NotFound`](Self::NotFound), [`NoCompatibleMedia`](Self::NoCompatibleMedia),
///   [`DecoderInit`](Self::DecoderInit), [`Decode`](Self::Decode),
///   [`DecodeStalled`](Self::DecodeStalled): transient, retried by the
///   ingest loop.
/// - **Transport**: [`Io`](Self::Io): socket failures; terminate the
///   affected session only.
/// - **Protocol**: [`Parse`](Self::Parse): malformed RTSP, SDP or RTP.
/// - **Lifecycle**: [`AlreadyRunning`](Self::AlreadyRunning),
///   [`Closed`](Self::Closed), [`SessionNotFound`](Self::SessionNotFound).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Address, port or handler rejected before any I/O happened.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// TCP connect to the upstream failed (DNS, refused, timeout).
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The upstream answered a request with an unexpected status or an
    /// unusable message.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The upstream answered `404 Not Found`.
    #[error("not found: {0}")]
    NotFound(String),

    /// The stream description has no video media in a supported codec.
    #[error("no compatible media in stream description")]
    NoCompatibleMedia,

    /// The payload decoder could not be constructed for the selected format.
    #[error("decoder initialization failed: {0}")]
    DecoderInit(String),

    /// A non-benign decode error; fatal for the current connection.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Too many consecutive benign decode results without a complete
    /// access unit.
    #[error("decoder stalled after {0} consecutive incomplete packets")]
    DecodeStalled(usize),

    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP message, SDP body or RTP packet.
    #[error("parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// No session with the given ID exists in the [`SessionManager`](crate::session::SessionManager).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// `run()` was called while the component was already running.
    #[error("already running")]
    AlreadyRunning,

    /// The component was closed while the operation was in flight.
    #[error("closed")]
    Closed,
}

impl RtspError {
    /// Whether the ingest loop should retry after this error.
    ///
    /// Caller errors and lifecycle errors are terminal; everything coming
    /// from the upstream or the network is treated as transient, since the
    /// upstream state may change between attempts.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidConfiguration(_) | Self::AlreadyRunning | Self::Closed
        )
    }

    pub(crate) fn parse(kind: ParseErrorKind) -> Self {
        Self::Parse { kind }
    }
}

/// Specific kind of parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// Status line did not have the expected `Version Code Reason` format.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a number or exceeded the body limit.
    InvalidContentLength,
    /// The SDP body was missing `v=` or had a malformed `m=` line.
    InvalidSdp,
    /// The RTP packet was shorter than its header claims.
    InvalidRtpPacket,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
            Self::InvalidSdp => write!(f, "invalid session description"),
            Self::InvalidRtpPacket => write!(f, "invalid RTP packet"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
