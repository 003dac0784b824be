/// Lower transport requested in a `Transport` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransport {
    /// `RTP/AVP` or `RTP/AVP/UDP`.
    Udp,
    /// `RTP/AVP/TCP`, RTP interleaved on the RTSP connection (RFC 2326 §10.12).
    Tcp,
}

/// Parsed `Transport` header (RFC 2326 §12.39).
///
/// ## Wire format examples
///
/// ```text
/// Subscriber, UDP:
///   Transport: RTP/AVP;unicast;client_port=8000-8001
///
/// Publisher, interleaved:
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1;mode=record
/// ```
///
/// Only the first entry of a comma-separated list is honored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    pub lower: LowerTransport,
    pub multicast: bool,
    /// `client_port=RTP-RTCP`.
    pub client_ports: Option<(u16, u16)>,
    /// `interleaved=RTP-RTCP` channel pair.
    pub interleaved: Option<(u8, u8)>,
    /// `mode=record` (the client intends to publish).
    pub record: bool,
}

impl TransportHeader {
    /// Parse the `Transport` header value.
    ///
    /// ## Examples
    ///
    /// ```
    /// use relay::session::transport::{LowerTransport, TransportHeader};
    ///
    /// let th = TransportHeader::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(th.lower, LowerTransport::Udp);
    /// assert_eq!(th.client_ports, Some((8000, 8001)));
    ///
    /// let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-1;mode=record").unwrap();
    /// assert_eq!(th.interleaved, Some((0, 1)));
    /// assert!(th.record);
    ///
    /// assert!(TransportHeader::parse("RAW/RAW/UDP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        let spec = header.split(',').next()?;
        let mut parts = spec.split(';').map(str::trim);

        let lower = match parts.next()?.to_ascii_uppercase().as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => LowerTransport::Udp,
            "RTP/AVP/TCP" => LowerTransport::Tcp,
            _ => return None,
        };

        let mut th = TransportHeader {
            lower,
            multicast: false,
            client_ports: None,
            interleaved: None,
            record: false,
        };

        for part in parts {
            if part.eq_ignore_ascii_case("multicast") {
                th.multicast = true;
            } else if let Some(ports) = part.strip_prefix("client_port=") {
                th.client_ports = Some(parse_pair(ports)?);
            } else if let Some(channels) = part.strip_prefix("interleaved=") {
                th.interleaved = Some(parse_pair(channels)?);
            } else if let Some(mode) = part.strip_prefix("mode=") {
                th.record = mode.trim_matches('"').eq_ignore_ascii_case("record");
            }
        }

        Some(th)
    }
}

/// `"N-M"` or a single `"N"` (then `M = N + 1`).
fn parse_pair<T>(value: &str) -> Option<(T, T)>
where
    T: std::str::FromStr + Copy + TryFrom<u32>,
    u32: From<T>,
{
    match value.split_once('-') {
        Some((a, b)) => Some((a.parse().ok()?, b.parse().ok()?)),
        None => {
            let a: T = value.parse().ok()?;
            let b = T::try_from(u32::from(a) + 1).ok()?;
            Some((a, b))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_udp_transport() {
        let th = TransportHeader::parse("RTP/AVP;unicast;client_port=5000-5001").unwrap();
        assert_eq!(th.lower, LowerTransport::Udp);
        assert_eq!(th.client_ports, Some((5000, 5001)));
        assert!(!th.record);
    }

    #[test]
    fn parse_interleaved_record() {
        let th = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=2-3;mode=\"RECORD\"")
            .unwrap();
        assert_eq!(th.lower, LowerTransport::Tcp);
        assert_eq!(th.interleaved, Some((2, 3)));
        assert!(th.record);
    }

    #[test]
    fn single_channel_implies_pair() {
        let th = TransportHeader::parse("RTP/AVP/TCP;interleaved=4").unwrap();
        assert_eq!(th.interleaved, Some((4, 5)));
        assert!(TransportHeader::parse("RTP/AVP/TCP;interleaved=255").is_none());
    }

    #[test]
    fn parse_no_client_port() {
        let th = TransportHeader::parse("RTP/AVP;unicast").unwrap();
        assert!(th.client_ports.is_none());
    }

    #[test]
    fn first_spec_of_list_wins() {
        let th = TransportHeader::parse(
            "RTP/AVP/TCP;unicast;interleaved=0-1, RTP/AVP;unicast;client_port=6000-6001",
        )
        .unwrap();
        assert_eq!(th.lower, LowerTransport::Tcp);
        assert!(th.client_ports.is_none());
    }

    #[test]
    fn multicast_flag() {
        let th = TransportHeader::parse("RTP/AVP;multicast").unwrap();
        assert!(th.multicast);
    }
}
