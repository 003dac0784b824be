use std::io::{BufReader, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use crate::error::RtspError;
use crate::protocol::MethodHandler;
use crate::protocol::RtspResponse;
use crate::protocol::codec::{self, Message};
use crate::server::ServerContext;

static CONN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Item of a connection's outbound queue.
#[derive(Debug)]
pub(crate) enum Outbound {
    Data(Bytes),
    Close,
}

/// Shared handle on one client connection.
///
/// Owned jointly by the connection thread, its sessions and the streams
/// delivering to it. Everything written to the client goes through a
/// bounded queue drained by the connection's writer thread, so a slow
/// subscriber never blocks the publisher feeding it.
#[derive(Debug)]
pub struct ConnHandle {
    id: u64,
    peer_addr: SocketAddr,
    socket: Option<TcpStream>,
    tx: Option<SyncSender<Outbound>>,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl ConnHandle {
    fn new(socket: TcpStream, peer_addr: SocketAddr, tx: SyncSender<Outbound>) -> Self {
        Self {
            id: CONN_COUNTER.fetch_add(1, Ordering::SeqCst),
            peer_addr,
            socket: Some(socket),
            tx: Some(tx),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// A handle with no socket behind it. Sends are discarded.
    pub(crate) fn detached(peer_addr: SocketAddr) -> Self {
        Self {
            id: CONN_COUNTER.fetch_add(1, Ordering::SeqCst),
            peer_addr,
            socket: None,
            tx: None,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Packets dropped because the outbound queue was full.
    pub fn dropped_packets(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shut the connection down. Both the reader and the writer thread
    /// observe it promptly. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(socket) = &self.socket {
            let _ = socket.shutdown(Shutdown::Both);
        }
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(Outbound::Close);
        }
    }

    /// Queue signaling data, waiting for room. Returns `false` once the
    /// writer is gone.
    pub(crate) fn send(&self, data: Bytes) -> bool {
        match &self.tx {
            Some(tx) if !self.is_closed() => tx.send(Outbound::Data(data)).is_ok(),
            _ => false,
        }
    }

    /// Queue media without blocking; drops the packet when the queue is
    /// full.
    pub(crate) fn try_send(&self, data: Bytes) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        if self.is_closed() {
            return false;
        }
        match tx.try_send(Outbound::Data(data)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(peer = %self.peer_addr, dropped, "outbound queue full, dropping packets");
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Non-blocking TCP accept loop.
///
/// Checks the server's stop flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
pub(crate) fn accept_loop(listener: TcpListener, ctx: Arc<ServerContext>) {
    while !ctx.is_stopped() {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let c = ctx.clone();
                thread::spawn(move || {
                    Connection::handle(stream, c);
                });
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if !ctx.is_stopped() {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    reader: BufReader<TcpStream>,
    conn: Arc<ConnHandle>,
    handler: MethodHandler,
}

impl Connection {
    /// Entry point: set up a connection and run its request loop.
    fn handle(stream: TcpStream, ctx: Arc<ServerContext>) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        let (reader_stream, writer_stream) = match (stream.try_clone(), stream.try_clone()) {
            (Ok(r), Ok(w)) => (r, w),
            _ => return,
        };
        let _ = stream.set_nodelay(true);
        let _ = reader_stream.set_read_timeout(Some(ctx.config.session_timeout));

        let (tx, rx) = mpsc::sync_channel(ctx.config.write_queue_size.max(1));
        thread::spawn(move || write_loop(writer_stream, rx, peer_addr));

        let conn = Arc::new(ConnHandle::new(stream, peer_addr, tx));
        ctx.register_connection(&conn);

        tracing::info!(%peer_addr, conn_id = conn.id(), "client connected");
        ctx.handler.on_conn_open(&conn);

        let handler = MethodHandler::new(ctx.clone(), conn.clone());

        let mut connection = Connection {
            reader: BufReader::new(reader_stream),
            conn: conn.clone(),
            handler,
        };

        let reason = connection.run(&ctx);
        connection.cleanup();
        ctx.unregister_connection(&conn);

        ctx.handler.on_conn_close(&conn, reason);
        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, ctx: &ServerContext) -> &'static str {
        let peer = self.conn.peer_addr();

        while !ctx.is_stopped() && !self.conn.is_closed() {
            match codec::read_message(&mut self.reader) {
                Ok(None) => return "connection closed by client",
                Ok(Some(Message::Request(request))) => {
                    tracing::debug!(
                        %peer,
                        method = %request.method,
                        uri = %request.uri,
                        version = %request.version,
                        "request"
                    );

                    let response = self.handler.handle(&request);

                    tracing::debug!(%peer, status = response.status_code, "response");

                    if !self.conn.send(Bytes::from(response.serialize())) {
                        return "write error";
                    }
                }
                Ok(Some(Message::Interleaved { channel, payload })) => {
                    self.handler.handle_frame(channel, &payload);
                }
                Ok(Some(Message::Response(response))) => {
                    tracing::trace!(%peer, status = response.status_code, "ignoring response from client");
                }
                Err(RtspError::Io(e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    return "session timed out";
                }
                Err(RtspError::Io(_)) => {
                    if self.conn.is_closed() {
                        return "closed by server";
                    }
                    return "read error";
                }
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "parse error");
                    let response = RtspResponse::bad_request();
                    if !self.conn.send(Bytes::from(response.serialize())) {
                        return "write error";
                    }
                }
            }
        }

        if self.conn.is_closed() {
            "closed by server"
        } else {
            "server shutting down"
        }
    }

    /// Close sessions owned by this connection and stop the writer.
    fn cleanup(&mut self) {
        let closed = self.handler.close_all();
        if closed > 0 {
            tracing::info!(peer = %self.conn.peer_addr(), closed, "cleaned up sessions on disconnect");
        }
        self.conn.close();
    }
}

/// Drain the outbound queue onto the socket until closed or a write fails.
fn write_loop(mut socket: TcpStream, rx: Receiver<Outbound>, peer_addr: SocketAddr) {
    while let Ok(Outbound::Data(data)) = rx.recv() {
        if let Err(e) = socket.write_all(&data) {
            tracing::debug!(%peer_addr, error = %e, "write failed");
            break;
        }
    }
    let _ = socket.shutdown(Shutdown::Both);
}
