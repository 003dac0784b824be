//! SDP (Session Description Protocol) parsing and generation (RFC 4566 / RFC 8866).
//!
//! The relay receives an SDP body with ANNOUNCE and hands a re-marshaled
//! copy to every DESCRIBE; the ingest client parses the DESCRIBE answer of
//! its upstream. The subset understood here:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                              ← session name
//! c=IN IP4 <addr>                               ← connection address
//! t=0 0                                         ← timing (live stream)
//! a=tool:rtsp-relay                             ← session attributes
//! m=video 0 RTP/AVP 96                          ← media description
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=fmtp:96 packetization-mode=1                ← codec parameters
//! a=control:trackID=0                           ← track control URL
//! ```
//!
//! Lines this module does not model (`b=`, `i=`, unknown attributes) are
//! kept verbatim so a relayed description loses nothing but its controls.

use crate::error::{ParseErrorKind, Result, RtspError};

/// A parsed session description.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionDescription {
    /// Raw `o=` value.
    pub origin: Option<String>,
    pub session_name: String,
    /// Raw session-level `c=` value.
    pub connection: Option<String>,
    /// Session-level `a=` values (without the `a=` prefix), control excluded.
    pub attributes: Vec<String>,
    /// Session-level aggregate control (`a=control:`), if any.
    pub control: Option<String>,
    pub media: Vec<Media>,
}

/// One `m=` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    /// Media type: `video`, `audio`, `application`, ...
    pub kind: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<Format>,
    /// Media-level `a=control:` value.
    pub control: Option<String>,
    /// Remaining media-level lines, verbatim (`a=...`, `b=...`, `c=...`).
    pub extra: Vec<String>,
}

/// One payload format of a media section (`m=` payload type plus its
/// `a=rtpmap` and `a=fmtp`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    pub payload_type: u8,
    /// Encoding name from `a=rtpmap` (e.g. `H264`).
    pub encoding: Option<String>,
    pub clock_rate: u32,
    pub channels: Option<u16>,
    /// Raw `a=fmtp` parameter string.
    pub fmtp: Option<String>,
}

impl Format {
    /// Whether the rtpmap encoding name matches `codec` (case-insensitive).
    pub fn is_codec(&self, codec: &str) -> bool {
        self.encoding
            .as_deref()
            .is_some_and(|e| e.eq_ignore_ascii_case(codec))
    }

    /// Look up a `key=value` parameter of the `a=fmtp` line.
    ///
    /// ```
    /// use relay::protocol::sdp::Format;
    ///
    /// let f = Format {
    ///     payload_type: 96,
    ///     encoding: Some("H264".into()),
    ///     clock_rate: 90000,
    ///     channels: None,
    ///     fmtp: Some("packetization-mode=1; profile-level-id=42e01f".into()),
    /// };
    /// assert_eq!(f.param("profile-level-id"), Some("42e01f"));
    /// assert_eq!(f.param("sprop-parameter-sets"), None);
    /// ```
    pub fn param(&self, name: &str) -> Option<&str> {
        self.fmtp.as_deref()?.split(';').find_map(|kv| {
            let (key, value) = kv.trim().split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then_some(value.trim())
        })
    }

    /// Static payload types (RFC 3551) may omit `a=rtpmap`.
    fn from_payload_type(payload_type: u8) -> Self {
        let (encoding, clock_rate) = match payload_type {
            0 => (Some("PCMU"), 8000),
            8 => (Some("PCMA"), 8000),
            14 => (Some("MPA"), 90000),
            26 => (Some("JPEG"), 90000),
            32 => (Some("MPV"), 90000),
            _ => (None, 90000),
        };
        Format {
            payload_type,
            encoding: encoding.map(str::to_string),
            clock_rate,
            channels: None,
            fmtp: None,
        }
    }
}

impl Media {
    pub fn format(&self, payload_type: u8) -> Option<&Format> {
        self.formats.iter().find(|f| f.payload_type == payload_type)
    }

    fn format_mut(&mut self, payload_type: u8) -> Option<&mut Format> {
        self.formats
            .iter_mut()
            .find(|f| f.payload_type == payload_type)
    }
}

impl SessionDescription {
    /// Parse an SDP body.
    ///
    /// Requires a leading `v=0`; tolerant of unknown line types and of
    /// `\n` line endings.
    pub fn parse(body: &str) -> Result<Self> {
        let invalid = || RtspError::parse(ParseErrorKind::InvalidSdp);

        let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());
        if lines.next() != Some("v=0") {
            return Err(invalid());
        }

        let mut sdp = SessionDescription::default();

        for line in lines {
            let (kind, value) = line.split_once('=').ok_or_else(invalid)?;

            if kind == "m" {
                sdp.media.push(parse_media_line(value).ok_or_else(invalid)?);
                continue;
            }

            match sdp.media.last_mut() {
                None => match kind {
                    "o" => sdp.origin = Some(value.to_string()),
                    "s" => sdp.session_name = value.to_string(),
                    "c" => sdp.connection = Some(value.to_string()),
                    "a" => match value.strip_prefix("control:") {
                        Some(control) => sdp.control = Some(control.to_string()),
                        None => sdp.attributes.push(value.to_string()),
                    },
                    // t=, b=, i=... are regenerated or dropped
                    _ => {}
                },
                Some(media) => {
                    if kind == "a" {
                        parse_media_attribute(media, value)?;
                    } else {
                        media.extra.push(line.to_string());
                    }
                }
            }
        }

        Ok(sdp)
    }

    /// Serialize to SDP text with CRLF line endings.
    pub fn marshal(&self) -> String {
        let mut sdp: Vec<String> = Vec::new();

        sdp.push("v=0".to_string());
        sdp.push(format!(
            "o={}",
            self.origin.as_deref().unwrap_or("- 0 0 IN IP4 127.0.0.1")
        ));
        let name = if self.session_name.is_empty() {
            "Stream"
        } else {
            &self.session_name
        };
        sdp.push(format!("s={}", name));
        if let Some(c) = &self.connection {
            sdp.push(format!("c={}", c));
        }
        sdp.push("t=0 0".to_string());
        for attr in &self.attributes {
            sdp.push(format!("a={}", attr));
        }
        if let Some(control) = &self.control {
            sdp.push(format!("a=control:{}", control));
        }

        for media in &self.media {
            let payload_types: Vec<String> = media
                .formats
                .iter()
                .map(|f| f.payload_type.to_string())
                .collect();
            sdp.push(format!(
                "m={} {} {} {}",
                media.kind,
                media.port,
                media.protocol,
                payload_types.join(" ")
            ));
            // non-attribute lines (c=, b=) precede attributes (RFC 4566 §5)
            sdp.extend(media.extra.iter().filter(|l| !l.starts_with("a=")).cloned());
            for format in &media.formats {
                if let Some(encoding) = &format.encoding {
                    match format.channels {
                        Some(ch) => sdp.push(format!(
                            "a=rtpmap:{} {}/{}/{}",
                            format.payload_type, encoding, format.clock_rate, ch
                        )),
                        None => sdp.push(format!(
                            "a=rtpmap:{} {}/{}",
                            format.payload_type, encoding, format.clock_rate
                        )),
                    }
                }
                if let Some(fmtp) = &format.fmtp {
                    sdp.push(format!("a=fmtp:{} {}", format.payload_type, fmtp));
                }
            }
            sdp.extend(media.extra.iter().filter(|l| l.starts_with("a=")).cloned());
            if let Some(control) = &media.control {
                sdp.push(format!("a=control:{}", control));
            }
        }

        tracing::trace!("SDP: {}", sdp.join("\r\n"));

        format!("{}\r\n", sdp.join("\r\n"))
    }

    /// Copy of this description with `trackID=N` media controls and no
    /// aggregate control, as served to subscribers.
    pub fn with_track_controls(&self) -> Self {
        let mut sdp = self.clone();
        sdp.control = None;
        for (i, media) in sdp.media.iter_mut().enumerate() {
            media.control = Some(format!("trackID={}", i));
        }
        sdp
    }

    /// Index of the media a SETUP request URI refers to.
    ///
    /// Matches the media's own control, then the `trackID=N` form used by
    /// [`with_track_controls`](Self::with_track_controls). A single-media
    /// description also accepts any URI (aggregate control).
    pub fn media_index_for_uri(&self, uri: &str) -> Option<usize> {
        let uri = uri.trim_end_matches('/');
        let by_control = self.media.iter().position(|m| {
            m.control
                .as_deref()
                .is_some_and(|c| !c.is_empty() && c != "*" && uri.ends_with(c))
        });
        if by_control.is_some() {
            return by_control;
        }

        if let Some(idx) = uri
            .rsplit_once("trackID=")
            .and_then(|(_, n)| n.parse::<usize>().ok())
        {
            return (idx < self.media.len()).then_some(idx);
        }

        (self.media.len() == 1).then_some(0)
    }

    /// First video media carrying a format of the given codec.
    pub fn find_video_format(&self, codec: &str) -> Option<(usize, &Media, &Format)> {
        self.media
            .iter()
            .enumerate()
            .filter(|(_, m)| m.kind == "video")
            .find_map(|(i, m)| {
                m.formats
                    .iter()
                    .find(|f| f.is_codec(codec))
                    .map(|f| (i, m, f))
            })
    }
}

fn parse_media_line(value: &str) -> Option<Media> {
    let mut parts = value.split_whitespace();
    let kind = parts.next()?.to_string();
    // "<port>/<count>" is legal; only the port matters
    let port = parts.next()?.split('/').next()?.parse().ok()?;
    let protocol = parts.next()?.to_string();
    let formats = parts
        .map(|pt| pt.parse::<u8>().ok().map(Format::from_payload_type))
        .collect::<Option<Vec<_>>>()?;

    Some(Media {
        kind,
        port,
        protocol,
        formats,
        control: None,
        extra: Vec::new(),
    })
}

fn parse_media_attribute(media: &mut Media, value: &str) -> Result<()> {
    let invalid = || RtspError::parse(ParseErrorKind::InvalidSdp);

    if let Some(control) = value.strip_prefix("control:") {
        media.control = Some(control.trim().to_string());
    } else if let Some(rtpmap) = value.strip_prefix("rtpmap:") {
        let (pt, rtpmap_value) = rtpmap.trim().split_once(' ').ok_or_else(invalid)?;
        let pt: u8 = pt.parse().map_err(|_| invalid())?;
        let mut rtpmap_value = rtpmap_value.trim().split('/');
        let encoding = rtpmap_value.next().unwrap_or_default().to_string();
        let clock_rate = rtpmap_value
            .next()
            .and_then(|r| r.parse().ok())
            .ok_or_else(invalid)?;
        let channels = rtpmap_value.next().and_then(|c| c.parse().ok());
        if let Some(format) = media.format_mut(pt) {
            format.encoding = Some(encoding);
            format.clock_rate = clock_rate;
            format.channels = channels;
        }
    } else if let Some(fmtp) = value.strip_prefix("fmtp:") {
        let (pt, params) = fmtp.trim().split_once(' ').unwrap_or((fmtp.trim(), ""));
        let pt: u8 = pt.parse().map_err(|_| invalid())?;
        if let Some(format) = media.format_mut(pt) {
            format.fmtp = Some(params.trim().to_string());
        }
    } else {
        media.extra.push(format!("a={}", value));
    }
    Ok(())
}
