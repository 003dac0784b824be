use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::error::{Result, RtspError};

/// Default RTSP port (RFC 2326 §3.2).
pub const DEFAULT_RTSP_PORT: u16 = 554;

/// An upstream RTSP address: `rtsp://[user:pass@]host[:port]/path`.
///
/// Validated once at configuration time and immutable afterwards. The
/// `Display` impl redacts the password so the value is safe to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUrl {
    url: Url,
}

impl SourceUrl {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RtspError::InvalidConfiguration(
                "source address is empty".to_string(),
            ));
        }

        let url = Url::parse(input).map_err(|e| {
            RtspError::InvalidConfiguration(format!("source address is not a URL: {e}"))
        })?;

        if url.scheme() != "rtsp" {
            return Err(RtspError::InvalidConfiguration(format!(
                "unsupported scheme '{}' (expected rtsp)",
                url.scheme()
            )));
        }

        match url.host_str() {
            Some(host) if !host.is_empty() => {}
            _ => {
                return Err(RtspError::InvalidConfiguration(
                    "source address has no host".to_string(),
                ));
            }
        }

        Ok(Self { url })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port().unwrap_or(DEFAULT_RTSP_PORT)
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// `host:port`, suitable for `ToSocketAddrs`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    /// Username and password from the userinfo part, if a username is present.
    pub fn credentials(&self) -> Option<(String, String)> {
        if self.url.username().is_empty() {
            return None;
        }
        Some((
            self.url.username().to_string(),
            self.url.password().unwrap_or_default().to_string(),
        ))
    }

    /// The URL without userinfo, as sent in RTSP request lines.
    pub fn request_uri(&self) -> String {
        let mut url = self.url.clone();
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url.to_string()
    }
}

impl FromStr for SourceUrl {
    type Err = RtspError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for SourceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.url.password().is_some() {
            let mut redacted = self.url.clone();
            let _ = redacted.set_password(Some("***"));
            write!(f, "{redacted}")
        } else {
            write!(f, "{}", self.url)
        }
    }
}

/// Resolve a media `a=control` attribute against a base URL (RFC 2326 §C.1.1).
///
/// Absolute controls are used as-is, `*` or an empty control means the
/// aggregate (base) URL, anything else is appended as a relative path.
pub fn resolve_control(base: &str, control: Option<&str>) -> String {
    match control {
        None | Some("") | Some("*") => base.to_string(),
        Some(c) if c.starts_with("rtsp://") || c.starts_with("rtsps://") => c.to_string(),
        Some(c) => {
            if base.ends_with('/') {
                format!("{base}{c}")
            } else {
                format!("{base}/{c}")
            }
        }
    }
}
