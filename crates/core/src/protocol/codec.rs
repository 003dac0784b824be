//! Reading RTSP messages off a byte stream.
//!
//! Once a session uses interleaved transport, requests, responses and `$`
//! frames share one TCP connection, so the reader must decide per message
//! what comes next.

use std::io::{self, BufRead, Read};

use bytes::Bytes;

use super::request::RtspRequest;
use super::response::RtspResponse;
use crate::error::{ParseErrorKind, Result, RtspError};
use crate::transport::interleaved::{self, FRAME_MARKER};

/// Upper bound for a message body (SDP). Anything larger is a protocol
/// violation, not a description.
pub const MAX_BODY_SIZE: usize = 128 * 1024;

/// Upper bound for the header section of a single message.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// One unit read from an RTSP connection.
#[derive(Debug)]
pub enum Message {
    Request(RtspRequest),
    Response(RtspResponse),
    /// Binary frame on an interleaved channel.
    Interleaved { channel: u8, payload: Bytes },
}

/// Read the next message. Returns `Ok(None)` on a clean EOF between
/// messages.
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<Message>> {
    // skip stray CRLFs between messages
    loop {
        let next = reader.fill_buf()?.first().copied();
        match next {
            None => return Ok(None),
            Some(b'\r') | Some(b'\n') => reader.consume(1),
            Some(_) => break,
        }
    }

    if reader.fill_buf()?.first() == Some(&FRAME_MARKER) {
        let (channel, payload) = interleaved::read_frame(reader)?;
        return Ok(Some(Message::Interleaved { channel, payload }));
    }

    let head = read_head(reader)?;
    if head.starts_with("RTSP/") {
        let mut response = RtspResponse::parse(&head)?;
        response.body = read_body(reader, response.get_header("Content-Length"))?;
        Ok(Some(Message::Response(response)))
    } else {
        let mut request = RtspRequest::parse(&head)?;
        request.body = read_body(reader, request.get_header("Content-Length"))?;
        Ok(Some(Message::Request(request)))
    }
}

/// Read lines up to and including the blank line ending the header section.
fn read_head<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        head.push_str(&line);
        if line == "\r\n" || line == "\n" {
            return Ok(head);
        }
        if head.len() > MAX_HEAD_SIZE {
            return Err(RtspError::parse(ParseErrorKind::InvalidHeader));
        }
    }
}

fn read_body<R: Read>(reader: &mut R, content_length: Option<&str>) -> Result<Option<String>> {
    let Some(len) = content_length else {
        return Ok(None);
    };
    let len: usize = len
        .trim()
        .parse()
        .map_err(|_| RtspError::parse(ParseErrorKind::InvalidContentLength))?;
    if len > MAX_BODY_SIZE {
        return Err(RtspError::parse(ParseErrorKind::InvalidContentLength));
    }
    if len == 0 {
        return Ok(None);
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(String::from_utf8_lossy(&body).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    #[test]
    fn reads_request_with_body_then_frame() {
        let mut wire = b"ANNOUNCE rtsp://localhost/live RTSP/1.0\r\n\
            CSeq: 2\r\n\
            Content-Length: 5\r\n\r\n\
            v=0\r\n"
            .to_vec();
        wire.extend_from_slice(&interleaved::encode_frame(0, &[1, 2, 3]).unwrap());
        let mut reader = BufReader::new(&wire[..]);

        match read_message(&mut reader).unwrap() {
            Some(Message::Request(req)) => {
                assert_eq!(req.method, "ANNOUNCE");
                assert_eq!(req.body.as_deref(), Some("v=0\r\n"));
            }
            other => panic!("expected request, got {other:?}"),
        }
        match read_message(&mut reader).unwrap() {
            Some(Message::Interleaved { channel, payload }) => {
                assert_eq!(channel, 0);
                assert_eq!(&payload[..], &[1, 2, 3]);
            }
            other => panic!("expected frame, got {other:?}"),
        }
        assert!(read_message(&mut reader).unwrap().is_none());
    }

    #[test]
    fn reads_response() {
        let wire = b"\r\nRTSP/1.0 200 OK\r\nCSeq: 1\r\nSession: 12AB;timeout=60\r\n\r\n";
        let mut reader = BufReader::new(&wire[..]);
        match read_message(&mut reader).unwrap() {
            Some(Message::Response(resp)) => {
                assert_eq!(resp.status_code, 200);
                assert_eq!(resp.get_header("Session"), Some("12AB;timeout=60"));
                assert!(resp.body.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn truncated_head_is_an_error() {
        let wire = b"OPTIONS rtsp://localhost RTSP/1.0\r\nCSeq: 1\r\n";
        let mut reader = BufReader::new(&wire[..]);
        assert!(matches!(read_message(&mut reader), Err(RtspError::Io(_))));
    }

    #[test]
    fn oversize_body_rejected() {
        let wire = format!(
            "ANNOUNCE rtsp://localhost RTSP/1.0\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_SIZE + 1
        );
        let mut reader = BufReader::new(wire.as_bytes());
        assert!(matches!(
            read_message(&mut reader),
            Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidContentLength
            })
        ));
    }
}
