//! Network transport layer for RTSP signaling and RTP media delivery.
//!
//! - **TCP** ([`tcp`]): carries RTSP request/response signaling. One TCP
//!   connection per client, with a reader thread and a writer thread per
//!   connection.
//!
//! - **Interleaved** ([`interleaved`]): RTP multiplexed onto the RTSP TCP
//!   connection with `$` framing (RFC 2326 §10.12). Publishers always use
//!   it; subscribers may.
//!
//! - **UDP** ([`udp`]): a single ephemeral socket shared for all outbound
//!   RTP delivery to UDP subscribers.

pub mod interleaved;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

pub use tcp::ConnHandle;
pub use udp::UdpTransport;

/// Where a subscriber receives the RTP packets of one media.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// `$` frames on the subscriber's own RTSP connection.
    Interleaved { conn: Arc<ConnHandle>, channel: u8 },
    /// Datagrams from the server's shared UDP socket.
    Udp {
        transport: Arc<UdpTransport>,
        addr: SocketAddr,
    },
}

impl Delivery {
    /// Send one marshaled RTP packet without blocking.
    ///
    /// Returns `false` when the packet was dropped (queue full, socket
    /// buffer full, or the peer is gone).
    pub fn send(&self, packet: &Bytes) -> bool {
        match self {
            Delivery::Interleaved { conn, channel } => match interleaved::encode_frame(*channel, packet) {
                Some(frame) => conn.try_send(frame),
                None => {
                    tracing::warn!(len = packet.len(), "RTP packet too large for interleaved frame");
                    false
                }
            },
            Delivery::Udp { transport, addr } => match transport.send_to(packet, *addr) {
                Ok(_) => true,
                Err(e) => {
                    tracing::trace!(%addr, error = %e, "UDP send failed");
                    false
                }
            },
        }
    }
}
