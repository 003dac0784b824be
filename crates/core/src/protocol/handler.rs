use std::net::SocketAddr;
use std::sync::Arc;

use crate::media::RtpPacket;
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp::SessionDescription;
use crate::server::ServerContext;
use crate::session::transport::{LowerTransport, TransportHeader};
use crate::session::{Session, SessionState};
use crate::transport::interleaved::rtp_channel_for_media;
use crate::transport::{ConnHandle, Delivery};

/// Methods advertised in OPTIONS responses.
const PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, RECORD, PAUSE, TEARDOWN, GET_PARAMETER";

/// Handles RTSP method requests for a single TCP connection.
///
/// Tracks which sessions were created on this connection so they
/// can be cleaned up when the connection drops.
pub struct MethodHandler {
    ctx: Arc<ServerContext>,
    conn: Arc<ConnHandle>,
    /// Session IDs created during this connection, for cleanup on disconnect.
    session_ids: Vec<String>,
}

impl MethodHandler {
    pub(crate) fn new(ctx: Arc<ServerContext>, conn: Arc<ConnHandle>) -> Self {
        MethodHandler {
            ctx,
            conn,
            session_ids: Vec::new(),
        }
    }

    /// Returns session IDs owned by this connection (for cleanup on disconnect).
    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    fn client_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0").to_string();

        let response = match request.method.as_str() {
            "OPTIONS" => self.handle_options(),
            "DESCRIBE" => self.handle_describe(request),
            "ANNOUNCE" => self.handle_announce(request),
            "SETUP" => self.handle_setup(request),
            "PLAY" => self.handle_play(request),
            "RECORD" => self.handle_record(request),
            "PAUSE" => self.handle_pause(request),
            "TEARDOWN" => self.handle_teardown(request),
            "GET_PARAMETER" | "SET_PARAMETER" => self.handle_get_parameter(request),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::new(501, "Not Implemented")
            }
        };

        response.add_header("CSeq", &cseq)
    }

    /// Route an interleaved frame to the recording session owning its
    /// channel. RTCP and unknown channels are ignored.
    pub fn handle_frame(&self, channel: u8, payload: &[u8]) {
        let Some((session, media_index)) = self.session_ids.iter().find_map(|id| {
            let session = self.ctx.sessions.get_session(id)?;
            let idx = session.record_media_index(channel)?;
            Some((session, idx))
        }) else {
            tracing::trace!(channel, "frame on unmapped channel");
            return;
        };

        match RtpPacket::parse(payload) {
            Ok(packet) => session.dispatch_rtp(media_index, &packet),
            Err(e) => {
                tracing::debug!(session_id = %session.id, channel, error = %e, "dropping invalid RTP packet")
            }
        }
    }

    /// Close every session of this connection. Returns how many there were.
    pub fn close_all(&mut self) -> usize {
        let ids = std::mem::take(&mut self.session_ids);
        ids.iter().filter(|id| self.close_session(id)).count()
    }

    fn handle_options(&self) -> RtspResponse {
        tracing::debug!("OPTIONS");
        RtspResponse::ok().add_header("Public", PUBLIC_METHODS)
    }

    fn handle_describe(&self, request: &RtspRequest) -> RtspResponse {
        tracing::debug!(uri = %request.uri, "DESCRIBE");

        let stream = match self.ctx.handler.on_describe(request) {
            Ok(stream) => stream,
            Err(response) => return response,
        };

        let base = format!("{}/", request.uri.trim_end_matches('/'));
        RtspResponse::ok()
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &base)
            .with_body(stream.sdp())
    }

    fn handle_announce(&mut self, request: &RtspRequest) -> RtspResponse {
        let Some(body) = request.body.as_deref() else {
            tracing::warn!(uri = %request.uri, "ANNOUNCE without body");
            return RtspResponse::bad_request();
        };
        if let Some(content_type) = request.get_header("Content-Type")
            && !content_type.eq_ignore_ascii_case("application/sdp")
        {
            tracing::warn!(content_type, "ANNOUNCE with non-SDP body");
            return RtspResponse::new(415, "Unsupported Media Type");
        }

        let description = match SessionDescription::parse(body) {
            Ok(d) if !d.media.is_empty() => d,
            Ok(_) => {
                tracing::warn!("ANNOUNCE description has no media");
                return RtspResponse::bad_request();
            }
            Err(e) => {
                tracing::warn!(error = %e, "ANNOUNCE with invalid SDP");
                return RtspResponse::bad_request();
            }
        };

        let session = match request.session_id() {
            Some(id) => match self.owned_session(id) {
                Some(session) if session.is_publisher() || session.stream().is_none() => session,
                Some(_) => return RtspResponse::method_not_valid(),
                None => return RtspResponse::session_not_found(),
            },
            None => self.open_session(),
        };

        if let Err(response) = self.ctx.handler.on_announce(&session, request, &description) {
            return response;
        }

        tracing::info!(
            session_id = %session.id,
            peer = %self.client_addr(),
            medias = description.media.len(),
            "stream announced"
        );
        session.set_announced(description);

        RtspResponse::ok().add_header("Session", &session.session_header_value())
    }

    fn handle_setup(&mut self, request: &RtspRequest) -> RtspResponse {
        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!("SETUP missing Transport header");
            return RtspResponse::bad_request();
        };

        let Some(transport) = TransportHeader::parse(transport_header) else {
            tracing::warn!(transport_header, "SETUP invalid Transport header");
            return RtspResponse::unsupported_transport();
        };
        if transport.multicast {
            return RtspResponse::unsupported_transport();
        }

        let existing = match request.session_id() {
            Some(id) => match self.owned_session(id) {
                Some(session) => Some(session),
                None => {
                    tracing::warn!(session_id = id, "SETUP for unknown session");
                    return RtspResponse::session_not_found();
                }
            },
            None => None,
        };

        match existing {
            Some(session) if session.is_publisher() => {
                self.setup_record(&session, request, &transport)
            }
            _ if transport.record => {
                tracing::warn!(uri = %request.uri, "SETUP mode=record without ANNOUNCE");
                RtspResponse::method_not_valid()
            }
            existing => self.setup_play(existing, request, &transport),
        }
    }

    /// SETUP of a media the publisher is going to record.
    fn setup_record(
        &self,
        session: &Arc<Session>,
        request: &RtspRequest,
        transport: &TransportHeader,
    ) -> RtspResponse {
        if session.state() != SessionState::Announced {
            return RtspResponse::method_not_valid();
        }

        let (rtp_channel, rtcp_channel) = match (transport.lower, transport.interleaved) {
            (LowerTransport::Tcp, Some(channels)) => channels,
            _ => {
                tracing::warn!(session_id = %session.id, "publisher requested non-interleaved transport");
                return RtspResponse::unsupported_transport();
            }
        };

        let media_index = session
            .announced()
            .and_then(|d| d.media_index_for_uri(&request.uri));
        let Some(media_index) = media_index else {
            tracing::warn!(uri = %request.uri, "SETUP for unknown track");
            return RtspResponse::not_found();
        };

        session.add_record_channel(rtp_channel, media_index);
        tracing::debug!(session_id = %session.id, media_index, rtp_channel, "record channel set up");

        RtspResponse::ok()
            .add_header(
                "Transport",
                &format!(
                    "RTP/AVP/TCP;unicast;interleaved={}-{};mode=record",
                    rtp_channel, rtcp_channel
                ),
            )
            .add_header("Session", &session.session_header_value())
    }

    /// SETUP of a media the client is going to play.
    fn setup_play(
        &mut self,
        existing: Option<Arc<Session>>,
        request: &RtspRequest,
        transport: &TransportHeader,
    ) -> RtspResponse {
        let stream = match self.ctx.handler.on_setup(request) {
            Ok(stream) => stream,
            Err(response) => return response,
        };

        let Some(media_index) = stream.media_index_for_uri(&request.uri) else {
            tracing::warn!(uri = %request.uri, "SETUP for unknown track");
            return RtspResponse::not_found();
        };

        let (delivery, transport_response) = match transport.lower {
            LowerTransport::Tcp => {
                let (rtp, rtcp) = transport.interleaved.unwrap_or_else(|| {
                    let rtp = rtp_channel_for_media(media_index);
                    (rtp, rtp.wrapping_add(1))
                });
                (
                    Delivery::Interleaved {
                        conn: self.conn.clone(),
                        channel: rtp,
                    },
                    format!("RTP/AVP/TCP;unicast;interleaved={}-{}", rtp, rtcp),
                )
            }
            LowerTransport::Udp => {
                let Some(udp) = self.ctx.udp() else {
                    tracing::warn!("client requested UDP transport (disabled)");
                    return RtspResponse::unsupported_transport();
                };
                let Some((client_rtp, client_rtcp)) = transport.client_ports else {
                    tracing::warn!("SETUP UDP transport without client_port");
                    return RtspResponse::bad_request();
                };
                let server_port = udp.local_port();
                (
                    Delivery::Udp {
                        transport: udp.clone(),
                        addr: SocketAddr::new(self.client_addr().ip(), client_rtp),
                    },
                    format!(
                        "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                        client_rtp,
                        client_rtcp,
                        server_port,
                        server_port.wrapping_add(1)
                    ),
                )
            }
        };

        let session = match existing {
            Some(session) => session,
            None => self.open_session(),
        };
        if let Some(bound) = session.stream()
            && !Arc::ptr_eq(&bound, &stream)
        {
            return RtspResponse::method_not_valid();
        }

        if let Err(e) = stream.add_reader(&session, media_index, delivery) {
            tracing::warn!(session_id = %session.id, error = %e, "stream closed during SETUP");
            return RtspResponse::not_found();
        }
        session.bind_stream(&stream);

        tracing::info!(
            session_id = %session.id,
            peer = %self.client_addr(),
            uri = %request.uri,
            media_index,
            transport = %transport_response,
            "subscriber set up"
        );

        RtspResponse::ok()
            .add_header("Transport", &transport_response)
            .add_header("Session", &session.session_header_value())
    }

    fn handle_play(&mut self, request: &RtspRequest) -> RtspResponse {
        let session = match self.request_session(request, "PLAY") {
            Ok(session) => session,
            Err(response) => return response,
        };

        if session.stream().is_none() {
            tracing::warn!(session_id = %session.id, "PLAY before SETUP");
            return RtspResponse::method_not_valid();
        }

        if let Err(response) = self.ctx.handler.on_play(&session, request) {
            return response;
        }

        session.set_state(SessionState::Playing);
        tracing::info!(session_id = %session.id, "session started playing");

        RtspResponse::ok()
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=0.000-")
    }

    fn handle_record(&mut self, request: &RtspRequest) -> RtspResponse {
        let session = match self.request_session(request, "RECORD") {
            Ok(session) => session,
            Err(response) => return response,
        };

        if session.state() != SessionState::Announced || !session.has_record_channels() {
            tracing::warn!(session_id = %session.id, state = ?session.state(), "RECORD not valid in this state");
            return RtspResponse::method_not_valid();
        }

        if let Err(response) = self.ctx.handler.on_record(&session, request) {
            return response;
        }

        session.set_state(SessionState::Recording);
        tracing::info!(session_id = %session.id, peer = %self.client_addr(), "session started recording");

        RtspResponse::ok().add_header("Session", &session.session_header_value())
    }

    fn handle_pause(&mut self, request: &RtspRequest) -> RtspResponse {
        let session = match self.request_session(request, "PAUSE") {
            Ok(session) => session,
            Err(response) => return response,
        };

        match session.state() {
            SessionState::Playing | SessionState::Paused => {
                session.set_state(SessionState::Paused);
                tracing::info!(session_id = %session.id, "session paused");
                RtspResponse::ok().add_header("Session", &session.session_header_value())
            }
            _ => RtspResponse::method_not_valid(),
        }
    }

    fn handle_teardown(&mut self, request: &RtspRequest) -> RtspResponse {
        let session = match self.request_session(request, "TEARDOWN") {
            Ok(session) => session,
            Err(response) => return response,
        };

        self.session_ids.retain(|id| id != &session.id);
        self.close_session(&session.id);
        tracing::info!(session_id = %session.id, "session terminated via TEARDOWN");
        RtspResponse::ok()
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive (RFC 2326 §10.8).
    fn handle_get_parameter(&self, request: &RtspRequest) -> RtspResponse {
        tracing::trace!("GET_PARAMETER keepalive");

        let mut resp = RtspResponse::ok();

        if let Some(id) = request.session_id()
            && self.owned_session(id).is_some()
        {
            resp = resp.add_header("Session", id);
        }

        resp
    }

    /// Session named by the request's `Session` header, owned by this
    /// connection.
    fn request_session(&self, request: &RtspRequest, method: &str) -> Result<Arc<Session>, RtspResponse> {
        let Some(id) = request.session_id() else {
            tracing::warn!(method, "missing Session header");
            return Err(RtspResponse::session_not_found());
        };
        self.owned_session(id).ok_or_else(|| {
            tracing::warn!(method, session_id = id, "unknown session");
            RtspResponse::session_not_found()
        })
    }

    fn owned_session(&self, id: &str) -> Option<Arc<Session>> {
        if !self.session_ids.iter().any(|owned| owned == id) {
            return None;
        }
        self.ctx.sessions.get_session(id)
    }

    fn open_session(&mut self) -> Arc<Session> {
        let session = self.ctx.sessions.create_session(&self.conn);
        self.session_ids.push(session.id.clone());
        self.ctx.handler.on_session_open(&session);
        session
    }

    /// Remove a session and report it closed. Returns `false` if it was
    /// already gone.
    fn close_session(&self, id: &str) -> bool {
        let Some(session) = self.ctx.sessions.remove_session(id) else {
            return false;
        };
        if let Some(stream) = session.stream() {
            stream.remove_reader(&session.id);
        }
        session.terminate();
        self.ctx.handler.on_session_close(&session);
        true
    }
}
