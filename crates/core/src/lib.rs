//! RTSP ingest client and single-publisher relay server.
//!
//! - [`IngestClient`] pulls H.264 from an upstream RTSP source, reconnecting
//!   with backoff, and hands start-code framed access units to a callback.
//! - [`RelayServer`] accepts one publisher (ANNOUNCE/RECORD) and fans its
//!   RTP packets out to every subscriber (DESCRIBE/SETUP/PLAY).
//!
//! Both are built on the bundled RTSP engine: [`client`] on the ingest side,
//! [`server`] with its [`ServerHandler`] seam on the relay side.

pub mod client;
pub mod error;
pub mod ingest;
pub mod media;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod stream;
pub mod transport;
pub mod url;

pub use error::{Result, RtspError};
pub use ingest::{
    AccessUnitHandler, Backoff, HandlerError, IngestClient, IngestConfig, IngestState, RetryState,
    START_CODE,
};
pub use relay::{PublishPolicy, PublishState, RelayConfig, RelayServer};
pub use server::{Server, ServerConfig, ServerHandler};
pub use url::SourceUrl;
