use crate::error::{ParseErrorKind, RtspError};

/// A parsed RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2.
///
/// The same type is used in both directions: the server parses incoming
/// requests with [`parse`](Self::parse) (the body, if any, is attached by
/// the reader after `Content-Length` bytes arrive), and the client builds
/// outgoing ones with [`new`](Self::new) / [`add_header`](Self::add_header)
/// and writes them with [`serialize`](Self::serialize).
#[derive(Debug, Clone)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, etc.).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:port/stream/trackID=0`).
    pub uri: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    /// Headers as ordered (name, value) pairs. Names are stored as-received;
    /// lookups via [`get_header`](Self::get_header) are case-insensitive.
    pub headers: Vec<(String, String)>,
    /// Message body (SDP for ANNOUNCE).
    pub body: Option<String>,
}

impl RtspRequest {
    /// Start building an outgoing request.
    pub fn new(method: &str, uri: &str) -> Self {
        RtspRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            version: "RTSP/1.0".to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Parse the request line and headers of an RTSP request.
    ///
    /// Expects the message head: request line, headers, and trailing blank
    /// line. Returns [`RtspError::Parse`] on malformed input.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let mut lines = raw.lines();

        let request_line = lines
            .next()
            .ok_or(RtspError::parse(ParseErrorKind::EmptyRequest))?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();

        if parts.len() != 3 {
            return Err(RtspError::parse(ParseErrorKind::InvalidRequestLine));
        }

        let method = parts[0].to_string();
        let uri = parts[1].to_string();
        let version = parts[2].to_string();

        if version != "RTSP/1.0" {
            tracing::warn!(version, "client sent non-RTSP/1.0 version");
        }

        let headers = parse_headers(lines)?;

        Ok(RtspRequest {
            method,
            uri,
            version,
            headers,
            body: None,
        })
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the CSeq header value, which numbers and orders RTSP
    /// request/response pairs (RFC 2326 §12.17).
    ///
    /// Every RTSP request must include a CSeq, and the response must echo it.
    pub fn cseq(&self) -> Option<&str> {
        self.get_header("CSeq")
    }

    /// Session ID from the `Session` header, without the `;timeout=` suffix.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
            .filter(|s| !s.is_empty())
    }

    /// Serialize to the RTSP text wire format.
    ///
    /// If a body is present, `Content-Length` is appended automatically.
    pub fn serialize(&self) -> String {
        let mut request = format!("{} {} {}\r\n", self.method, self.uri, self.version);

        for (name, value) in &self.headers {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }

        if let Some(body) = &self.body {
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
            request.push_str("\r\n");
            request.push_str(body);
        } else {
            request.push_str("\r\n");
        }
        request
    }
}

/// Parse `Name: Value` header lines up to the first empty line.
pub(crate) fn parse_headers<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> crate::error::Result<Vec<(String, String)>> {
    let mut headers = Vec::new();

    for line in lines {
        if line.is_empty() {
            break;
        }

        let colon_pos = line
            .find(':')
            .ok_or(RtspError::parse(ParseErrorKind::InvalidHeader))?;

        let name = line[..colon_pos].trim().to_string();
        let value = line[colon_pos + 1..].trim().to_string();

        headers.push((name, value));
    }

    Ok(headers)
}
