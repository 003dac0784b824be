//! Client-side RTSP authentication (RFC 2326 §D.2, RFC 2617).
//!
//! The upstream answers an unauthenticated request with `401` and one or
//! more `WWW-Authenticate` challenges. Digest is preferred over Basic when
//! both are offered.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::response::RtspResponse;
use crate::error::{Result, RtspError};

/// A challenge taken from a `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic {
        realm: String,
    },
    Digest {
        realm: String,
        nonce: String,
        opaque: Option<String>,
        /// Set when the server offers `qop=auth`.
        qop_auth: bool,
    },
}

impl Challenge {
    /// Parse one `WWW-Authenticate` value. Unknown schemes yield `None`.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        let params = parse_params(params);
        let get = |name: &str| {
            params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };

        if scheme.eq_ignore_ascii_case("basic") {
            Some(Challenge::Basic {
                realm: get("realm").unwrap_or_default(),
            })
        } else if scheme.eq_ignore_ascii_case("digest") {
            if let Some(algorithm) = get("algorithm")
                && !algorithm.eq_ignore_ascii_case("md5")
            {
                tracing::warn!(algorithm, "unsupported digest algorithm");
                return None;
            }
            Some(Challenge::Digest {
                realm: get("realm")?,
                nonce: get("nonce")?,
                opaque: get("opaque"),
                qop_auth: get("qop")
                    .is_some_and(|q| q.split(',').any(|v| v.trim().eq_ignore_ascii_case("auth"))),
            })
        } else {
            None
        }
    }
}

/// Builds `Authorization` headers for one upstream connection.
#[derive(Debug, Clone)]
pub struct Authenticator {
    username: String,
    password: String,
    challenge: Option<Challenge>,
    nonce_count: u32,
}

impl Authenticator {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            challenge: None,
            nonce_count: 0,
        }
    }

    /// Whether a challenge has been accepted.
    pub fn is_ready(&self) -> bool {
        self.challenge.is_some()
    }

    /// Take the best challenge of a `401` response.
    pub fn accept_challenge(&mut self, response: &RtspResponse) -> Result<()> {
        let challenges: Vec<Challenge> = response
            .get_headers("WWW-Authenticate")
            .filter_map(Challenge::parse)
            .collect();

        let best = challenges
            .iter()
            .find(|c| matches!(c, Challenge::Digest { .. }))
            .or_else(|| challenges.first())
            .cloned()
            .ok_or_else(|| {
                RtspError::Negotiation("401 without a supported authentication challenge".into())
            })?;

        self.challenge = Some(best);
        self.nonce_count = 0;
        Ok(())
    }

    /// `Authorization` value for a request, if a challenge was accepted.
    pub fn authorization(&mut self, method: &str, uri: &str) -> Option<String> {
        match self.challenge.as_ref()? {
            Challenge::Basic { .. } => {
                let token = STANDARD.encode(format!("{}:{}", self.username, self.password));
                Some(format!("Basic {}", token))
            }
            Challenge::Digest {
                realm,
                nonce,
                opaque,
                qop_auth,
            } => {
                let ha1 = md5_hex(&format!("{}:{}:{}", self.username, realm, self.password));
                let ha2 = md5_hex(&format!("{}:{}", method, uri));

                let mut value = format!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
                    self.username, realm, nonce, uri
                );

                if *qop_auth {
                    self.nonce_count += 1;
                    let nc = format!("{:08x}", self.nonce_count);
                    let cnonce = format!("{:016x}", rand::random::<u64>());
                    let response =
                        md5_hex(&format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2));
                    value.push_str(&format!(
                        ", response=\"{}\", qop=auth, nc={}, cnonce=\"{}\"",
                        response, nc, cnonce
                    ));
                } else {
                    let response = md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2));
                    value.push_str(&format!(", response=\"{}\"", response));
                }

                if let Some(opaque) = opaque {
                    value.push_str(&format!(", opaque=\"{}\"", opaque));
                }
                Some(value)
            }
        }
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Split `k1="v, 1", k2=v2` into pairs, honoring quoted commas.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let after = after.trim_start();

        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (quoted[..end].to_string(), &quoted[end + 1..]),
                None => (quoted.to_string(), ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (after[..end].trim().to_string(), &after[end..]),
                None => (after.trim().to_string(), ""),
            }
        };

        params.push((key, value));
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unauthorized(headers: &[&str]) -> RtspResponse {
        headers.iter().fold(
            RtspResponse::new(401, "Unauthorized").add_header("CSeq", "1"),
            |resp, h| resp.add_header("WWW-Authenticate", h),
        )
    }

    #[test]
    fn parses_digest_challenge() {
        let c = Challenge::parse(r#"Digest realm="IP Camera", nonce="abc, def", qop="auth,auth-int""#)
            .unwrap();
        assert_eq!(
            c,
            Challenge::Digest {
                realm: "IP Camera".into(),
                nonce: "abc, def".into(),
                opaque: None,
                qop_auth: true,
            }
        );
    }

    #[test]
    fn unknown_scheme_ignored() {
        assert!(Challenge::parse("Bearer realm=\"x\"").is_none());
        assert!(Challenge::parse("Digest realm=\"x\", nonce=\"n\", algorithm=SHA-256").is_none());
    }

    #[test]
    fn basic_authorization() {
        let mut auth = Authenticator::new("admin", "secret");
        assert!(auth.authorization("DESCRIBE", "rtsp://cam/").is_none());
        auth.accept_challenge(&unauthorized(&["Basic realm=\"cam\""]))
            .unwrap();
        assert_eq!(
            auth.authorization("DESCRIBE", "rtsp://cam/").unwrap(),
            "Basic YWRtaW46c2VjcmV0"
        );
    }

    #[test]
    fn digest_preferred_and_computed() {
        // RFC 2617 §3.5 example values, without qop
        let mut auth = Authenticator::new("Mufasa", "Circle Of Life");
        auth.accept_challenge(&unauthorized(&[
            "Basic realm=\"testrealm@host.com\"",
            "Digest realm=\"testrealm@host.com\", nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\"",
        ]))
        .unwrap();
        let value = auth.authorization("GET", "/dir/index.html").unwrap();
        assert!(value.starts_with("Digest username=\"Mufasa\""));
        let expected = {
            let ha1 = md5_hex("Mufasa:testrealm@host.com:Circle Of Life");
            let ha2 = md5_hex("GET:/dir/index.html");
            md5_hex(&format!("{}:dcd98b7102dd2f0e8b11d0f600bfb0c093:{}", ha1, ha2))
        };
        assert!(value.contains(&format!("response=\"{}\"", expected)));
    }

    #[test]
    fn digest_qop_increments_nonce_count() {
        let mut auth = Authenticator::new("u", "p");
        auth.accept_challenge(&unauthorized(&[
            "Digest realm=\"r\", nonce=\"n\", qop=\"auth\", opaque=\"o\"",
        ]))
        .unwrap();
        let first = auth.authorization("DESCRIBE", "rtsp://h/").unwrap();
        let second = auth.authorization("SETUP", "rtsp://h/trackID=0").unwrap();
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
        assert!(first.contains("opaque=\"o\""));
    }

    #[test]
    fn missing_challenge_is_negotiation_error() {
        let mut auth = Authenticator::new("u", "p");
        assert!(matches!(
            auth.accept_challenge(&unauthorized(&[])),
            Err(RtspError::Negotiation(_))
        ));
    }
}
