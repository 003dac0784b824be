use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ParseErrorKind, Result, RtspError};

const FIXED_HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 2;

/// An RTP packet (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |                  CSRC list (CC entries)                       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Padding is stripped on parse and never written back. The header
/// extension, when present, is kept verbatim so a relayed packet is
/// byte-identical to what the publisher sent (minus padding).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,
    /// RTP payload type (7-bit, RFC 3551).
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    /// Header extension as `(profile, data)`; `data` is a multiple of 4 bytes.
    pub extension: Option<(u16, Bytes)>,
    pub payload: Bytes,
}

impl RtpPacket {
    /// A packet with an empty CSRC list and no extension.
    pub fn new(
        payload_type: u8,
        sequence_number: u16,
        timestamp: u32,
        ssrc: u32,
        marker: bool,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension: None,
            payload: payload.into(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let invalid = || RtspError::parse(ParseErrorKind::InvalidRtpPacket);

        if data.len() < FIXED_HEADER_LEN || data[0] >> 6 != RTP_VERSION {
            return Err(invalid());
        }

        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0f) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7f;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = FIXED_HEADER_LEN;
        if data.len() < offset + csrc_count * 4 {
            return Err(invalid());
        }
        let csrc = data[offset..offset + csrc_count * 4]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        offset += csrc_count * 4;

        let extension = if has_extension {
            if data.len() < offset + 4 {
                return Err(invalid());
            }
            let profile = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4;
            if data.len() < offset + words * 4 {
                return Err(invalid());
            }
            let ext = Bytes::copy_from_slice(&data[offset..offset + words * 4]);
            offset += words * 4;
            Some((profile, ext))
        } else {
            None
        };

        let mut end = data.len();
        if has_padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(invalid());
            }
            end -= pad;
        }

        Ok(Self {
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension,
            payload: Bytes::copy_from_slice(&data[offset..end]),
        })
    }

    /// Serialize header and payload to wire format.
    pub fn marshal(&self) -> Bytes {
        let ext_len = self.extension.as_ref().map_or(0, |(_, d)| 4 + d.len());
        let mut buf = BytesMut::with_capacity(
            FIXED_HEADER_LEN + self.csrc.len() * 4 + ext_len + self.payload.len(),
        );

        let mut first = RTP_VERSION << 6 | (self.csrc.len() as u8 & 0x0f);
        if self.extension.is_some() {
            first |= 0x10;
        }
        buf.put_u8(first);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7f));
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }
        if let Some((profile, data)) = &self.extension {
            buf.put_u16(*profile);
            buf.put_u16((data.len() / 4) as u16);
            buf.put_slice(data);
        }
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet() -> RtpPacket {
        RtpPacket::new(96, 0x1234, 90000, 0xAABBCCDD, true, vec![0x65, 0x01, 0x02])
    }

    #[test]
    fn version_is_2() {
        let buf = make_packet().marshal();
        assert_eq!(buf[0] >> 6, 2);
    }

    #[test]
    fn marker_and_payload_type() {
        let buf = make_packet().marshal();
        assert_eq!(buf[1] & 0x80, 0x80);
        assert_eq!(buf[1] & 0x7f, 96);
    }

    #[test]
    fn parse_fixed_header() {
        let pkt = RtpPacket::parse(&make_packet().marshal()).unwrap();
        assert_eq!(pkt.sequence_number, 0x1234);
        assert_eq!(pkt.timestamp, 90000);
        assert_eq!(pkt.ssrc, 0xAABBCCDD);
        assert!(pkt.marker);
        assert_eq!(&pkt.payload[..], &[0x65, 0x01, 0x02]);
    }

    #[test]
    fn parse_csrc_and_extension() {
        let mut pkt = make_packet();
        pkt.csrc = vec![1, 2];
        pkt.extension = Some((0xBEDE, Bytes::from_static(&[1, 2, 3, 4])));
        let wire = pkt.marshal();
        assert_eq!(wire[0] & 0x0f, 2);
        assert_eq!(wire[0] & 0x10, 0x10);
        assert_eq!(RtpPacket::parse(&wire).unwrap(), pkt);
    }

    #[test]
    fn parse_strips_padding() {
        let mut wire = make_packet().marshal().to_vec();
        wire[0] |= 0x20;
        wire.extend_from_slice(&[0, 0, 3]);
        let pkt = RtpPacket::parse(&wire).unwrap();
        assert_eq!(&pkt.payload[..], &[0x65, 0x01, 0x02]);
    }

    #[test]
    fn rejects_short_or_bad_version() {
        assert!(RtpPacket::parse(&[0x80, 96, 0, 1]).is_err());
        let mut wire = make_packet().marshal().to_vec();
        wire[0] = 0x40;
        assert!(RtpPacket::parse(&wire).is_err());
    }

    #[test]
    fn rejects_truncated_csrc_list() {
        let mut wire = make_packet().marshal().to_vec();
        wire[0] |= 0x0f;
        assert!(RtpPacket::parse(&wire).is_err());
    }
}
