use std::net::{SocketAddr, UdpSocket};

use crate::error::Result;

/// UDP transport for outbound RTP packet delivery.
///
/// Binds a single ephemeral socket (`0.0.0.0:0`) shared by every UDP
/// subscriber. The socket is non-blocking: a full send buffer drops the
/// datagram instead of stalling the publisher's connection thread.
///
/// This layer is address-only; it does not know about sessions or
/// streams. The caller resolves session state to socket addresses.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind an ephemeral UDP socket for outbound RTP.
    pub fn bind() -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        tracing::debug!(local = ?socket.local_addr().ok(), "UDP transport bound");
        Ok(Self { socket })
    }

    /// Local port, advertised as `server_port` in SETUP responses.
    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Send raw bytes to a specific socket address.
    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, addr)?)
    }
}
