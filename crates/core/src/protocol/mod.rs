//! RTSP protocol implementation (RFC 2326).
//!
//! This module handles the text-based RTSP signaling protocol: parsing
//! and building requests and responses, reading them off a connection
//! shared with interleaved media, routing server methods, SDP, and the
//! client's authentication.
//!
//! Both directions share the message types: the server parses
//! [`RtspRequest`]s and answers with [`RtspResponse`]s, the ingest client
//! does the reverse. [`codec::read_message`] tells requests, responses and
//! `$` frames apart on a connection carrying interleaved media.
//!
//! | Method | Relay role | Client use |
//! |--------|------------|------------|
//! | OPTIONS | capability discovery | keepalive |
//! | DESCRIBE | served SDP, `404` without a publisher | first request |
//! | ANNOUNCE | publisher posts its SDP | - |
//! | SETUP | `mode=record` for publishers, play otherwise | one media, interleaved |
//! | PLAY / PAUSE | subscriber delivery | start delivery |
//! | RECORD | publisher starts sending | - |
//! | TEARDOWN | ends the session | on close |
//! | GET_PARAMETER | keepalive | - |

pub mod auth;
pub mod codec;
pub mod handler;
pub mod request;
pub mod response;
pub mod sdp;

pub use handler::MethodHandler;
pub use request::RtspRequest;
pub use response::RtspResponse;
