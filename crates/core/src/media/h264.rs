use super::rtp::RtpPacket;
use super::{DecodeError, DecodeResult, Depacketizer};
use crate::error::{Result, RtspError};
use crate::protocol::sdp::Format;

pub const CODEC_NAME: &str = "H264";

/// Upper bound on the reassembled size of one access unit.
pub const MAX_ACCESS_UNIT_SIZE: usize = 8 * 1024 * 1024;

/// Upper bound on the number of NAL units in one access unit.
pub const MAX_NALUS_PER_ACCESS_UNIT: usize = 3 * 8 * 1024;

const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_STAP_B: u8 = 25;
const NAL_TYPE_MTAP16: u8 = 26;
const NAL_TYPE_MTAP24: u8 = 27;
const NAL_TYPE_FU_A: u8 = 28;
const NAL_TYPE_FU_B: u8 = 29;

/// H.264 RTP depacketizer (RFC 6184).
///
/// Reverses the three payload structures a non-interleaved sender uses:
///
/// - **Single NAL Unit** (§5.6): any other type, the payload is the NAL.
///
/// - **STAP-A** (§5.7.1): type 24, a list of `[size: u16][NAL]` entries
///   aggregated into one packet.
///
/// - **FU-A** (§5.8): type 28, one NAL split across packets. Each
///   fragment carries a 2-byte FU header:
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]
///   ```
///
///   The original NAL header is rebuilt as `F|NRI` from the indicator and
///   `NAL_Type` from the FU header.
///
/// NAL units accumulate until the packet with the RTP marker bit set
/// (§5.1: last packet of an access unit), which releases the whole
/// access unit. Every other packet yields [`DecodeError::MorePacketsNeeded`].
///
/// STAP-B, MTAP and FU-B only occur in interleaved mode
/// (`packetization-mode=2`), which is rejected at construction.
#[derive(Debug, Default)]
pub struct H264Depacketizer {
    fragments: Vec<u8>,
    fragments_active: bool,
    expected_sequence: u16,
    frame: Vec<Vec<u8>>,
    frame_size: usize,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from an SDP format, honoring `packetization-mode` (RFC 6184 §8.1).
    pub fn from_format(format: &Format) -> Result<Self> {
        match format.param("packetization-mode") {
            None | Some("0") | Some("1") => Ok(Self::new()),
            Some("2") => Err(RtspError::DecoderInit(
                "packetization-mode=2 (interleaved) is not supported".to_string(),
            )),
            Some(other) => Err(RtspError::DecoderInit(format!(
                "invalid packetization-mode '{other}'"
            ))),
        }
    }

    fn reset_fragments(&mut self) {
        self.fragments.clear();
        self.fragments_active = false;
    }

    fn reset_frame(&mut self) {
        self.frame.clear();
        self.frame_size = 0;
    }

    /// Extract the NAL units carried by a single RTP packet.
    fn decode_nal_units(&mut self, packet: &RtpPacket) -> DecodeResult {
        let payload = &packet.payload[..];
        if payload.is_empty() {
            return Err(DecodeError::Malformed("empty payload"));
        }

        let nal_type = payload[0] & 0x1f;

        if nal_type == NAL_TYPE_FU_A {
            return self.decode_fu_a(packet);
        }

        if self.fragments_active {
            // A non-fragment in the middle of a fragment run: the rest of
            // the fragmented NAL never arrived.
            self.reset_fragments();
            return Err(DecodeError::PacketLost);
        }

        match nal_type {
            NAL_TYPE_STAP_A => Self::decode_stap_a(&payload[1..]),
            NAL_TYPE_STAP_B | NAL_TYPE_MTAP16 | NAL_TYPE_MTAP24 | NAL_TYPE_FU_B => {
                Err(DecodeError::UnsupportedPacketType(nal_type))
            }
            _ => Ok(vec![payload.to_vec()]),
        }
    }

    fn decode_stap_a(mut data: &[u8]) -> DecodeResult {
        let mut nal_units = Vec::new();

        while !data.is_empty() {
            if data.len() < 2 {
                return Err(DecodeError::Malformed("STAP-A size field truncated"));
            }
            let size = u16::from_be_bytes([data[0], data[1]]) as usize;
            data = &data[2..];

            // Some encoders pad the aggregate with zeroes.
            if size == 0 {
                break;
            }
            if data.len() < size {
                return Err(DecodeError::Malformed("STAP-A NAL unit truncated"));
            }
            nal_units.push(data[..size].to_vec());
            data = &data[size..];
        }

        if nal_units.is_empty() {
            return Err(DecodeError::Malformed("STAP-A without NAL units"));
        }
        Ok(nal_units)
    }

    fn decode_fu_a(&mut self, packet: &RtpPacket) -> DecodeResult {
        let payload = &packet.payload[..];
        if payload.len() < 2 {
            return Err(DecodeError::Malformed("FU-A header truncated"));
        }

        let start = payload[1] & 0x80 != 0;
        let end = payload[1] & 0x40 != 0;

        if start {
            if end {
                self.reset_fragments();
                return Err(DecodeError::Malformed(
                    "FU-A fragment with both start and end bits",
                ));
            }

            let nal_header = (payload[0] & 0xe0) | (payload[1] & 0x1f);
            self.fragments.clear();
            self.fragments.push(nal_header);
            self.fragments.extend_from_slice(&payload[2..]);
            self.fragments_active = true;
            self.expected_sequence = packet.sequence_number.wrapping_add(1);
            return Err(DecodeError::MorePacketsNeeded);
        }

        if !self.fragments_active {
            return Err(DecodeError::NonStartingPacketAndNoPrevious);
        }

        if packet.sequence_number != self.expected_sequence {
            tracing::debug!(
                expected = self.expected_sequence,
                got = packet.sequence_number,
                "FU-A sequence gap"
            );
            self.reset_fragments();
            return Err(DecodeError::PacketLost);
        }

        let size = self.frame_size + self.fragments.len() + payload.len() - 2;
        if size > MAX_ACCESS_UNIT_SIZE {
            self.reset_fragments();
            return Err(DecodeError::AccessUnitTooLarge {
                size,
                max: MAX_ACCESS_UNIT_SIZE,
            });
        }

        self.fragments.extend_from_slice(&payload[2..]);
        self.expected_sequence = packet.sequence_number.wrapping_add(1);

        if !end {
            return Err(DecodeError::MorePacketsNeeded);
        }

        self.fragments_active = false;
        let nal = std::mem::take(&mut self.fragments);

        tracing::trace!(
            nal_type = nal[0] & 0x1f,
            nal_size = nal.len(),
            "FU-A NAL unit reassembled"
        );

        Ok(vec![nal])
    }

    /// Extract NAL units from an H.264 Annex B bitstream.
    ///
    /// Scans for start codes (both 4-byte `00 00 00 01` and 3-byte
    /// `00 00 01`) and returns the NAL data between them, excluding
    /// the start codes themselves.
    ///
    /// The start code length is tracked per-NAL to ensure boundaries
    /// between adjacent NALs are computed correctly when mixed 3-byte
    /// and 4-byte start codes appear.
    pub fn extract_nal_units(data: &[u8]) -> Vec<Vec<u8>> {
        let mut nal_units = Vec::new();
        let mut i = 0usize;

        // (nal_data_start_index, start_code_length)
        let mut start_entries: Vec<(usize, usize)> = Vec::new();

        while i < data.len() {
            if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
                start_entries.push((i + 4, 4));
                i += 4;
            } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
                start_entries.push((i + 3, 3));
                i += 3;
            } else {
                i += 1;
            }
        }

        for (idx, &(start, _)) in start_entries.iter().enumerate() {
            let end = if idx + 1 < start_entries.len() {
                let (next_start, next_sc_len) = start_entries[idx + 1];
                next_start - next_sc_len
            } else {
                data.len()
            };

            if start < end {
                nal_units.push(data[start..end].to_vec());
            }
        }

        nal_units
    }

    /// Some cameras put an Annex B bitstream inside a single NAL payload.
    fn split_annex_b(frame: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let annex_b = |nal: &[u8]| nal.starts_with(&[0, 0, 0, 1]) || nal.starts_with(&[0, 0, 1]);
        if frame.len() == 1 && annex_b(&frame[0]) {
            let split = Self::extract_nal_units(&frame[0]);
            if !split.is_empty() {
                return split;
            }
        }
        frame
    }
}

impl Depacketizer for H264Depacketizer {
    fn decode(&mut self, packet: &RtpPacket) -> DecodeResult {
        let nal_units = self.decode_nal_units(packet)?;

        let count = self.frame.len() + nal_units.len();
        if count > MAX_NALUS_PER_ACCESS_UNIT {
            self.reset_frame();
            return Err(DecodeError::TooManyNalUnits {
                count,
                max: MAX_NALUS_PER_ACCESS_UNIT,
            });
        }

        let size = self.frame_size + nal_units.iter().map(Vec::len).sum::<usize>();
        if size > MAX_ACCESS_UNIT_SIZE {
            self.reset_frame();
            return Err(DecodeError::AccessUnitTooLarge {
                size,
                max: MAX_ACCESS_UNIT_SIZE,
            });
        }

        self.frame.extend(nal_units);
        self.frame_size = size;

        if !packet.marker {
            return Err(DecodeError::MorePacketsNeeded);
        }

        let frame = std::mem::take(&mut self.frame);
        self.frame_size = 0;

        tracing::trace!(
            nal_count = frame.len(),
            timestamp = packet.timestamp,
            "access unit decoded"
        );

        Ok(Self::split_annex_b(frame))
    }

    fn codec_name(&self) -> &'static str {
        CODEC_NAME
    }

    fn reset(&mut self) {
        self.reset_fragments();
        self.reset_frame();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(seq: u16, marker: bool, payload: &[u8]) -> RtpPacket {
        RtpPacket::new(96, seq, 3000, 0xAABBCCDD, marker, payload.to_vec())
    }

    fn format(fmtp: Option<&str>) -> Format {
        Format {
            payload_type: 96,
            encoding: Some("H264".to_string()),
            clock_rate: 90000,
            channels: None,
            fmtp: fmtp.map(str::to_string),
        }
    }

    // --- NAL extraction ---

    #[test]
    fn extract_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = H264Depacketizer::extract_nal_units(&data);
        assert_eq!(nals, vec![vec![0x65, 0xAA, 0xBB]]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = H264Depacketizer::extract_nal_units(&data);
        assert_eq!(nals, vec![vec![0x67, 0x42], vec![0x68, 0xCE]]);
    }

    #[test]
    fn extract_no_start_code() {
        assert!(H264Depacketizer::extract_nal_units(&[0xFF, 0xFE]).is_empty());
    }

    // --- Depacketization ---

    #[test]
    fn single_nal_with_marker() {
        let mut d = H264Depacketizer::new();
        let au = d.decode(&packet(1, true, &[0x65, 0xAA, 0xBB])).unwrap();
        assert_eq!(au, vec![vec![0x65, 0xAA, 0xBB]]);
    }

    #[test]
    fn nal_units_accumulate_until_marker() {
        let mut d = H264Depacketizer::new();
        assert_eq!(
            d.decode(&packet(1, false, &[0x67, 0x42])),
            Err(DecodeError::MorePacketsNeeded)
        );
        assert_eq!(
            d.decode(&packet(2, false, &[0x68, 0xCE])),
            Err(DecodeError::MorePacketsNeeded)
        );
        let au = d.decode(&packet(3, true, &[0x65, 0x88])).unwrap();
        assert_eq!(au, vec![vec![0x67, 0x42], vec![0x68, 0xCE], vec![0x65, 0x88]]);
    }

    #[test]
    fn stap_a_aggregate() {
        let mut d = H264Depacketizer::new();
        let payload = [
            0x78, // STAP-A, NRI=3
            0x00, 0x02, 0x67, 0x42, // SPS
            0x00, 0x02, 0x68, 0xCE, // PPS
        ];
        let au = d.decode(&packet(1, true, &payload)).unwrap();
        assert_eq!(au, vec![vec![0x67, 0x42], vec![0x68, 0xCE]]);
    }

    #[test]
    fn stap_a_truncated() {
        let mut d = H264Depacketizer::new();
        assert!(matches!(
            d.decode(&packet(1, true, &[0x78, 0x00, 0x05, 0x67])),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn fu_a_reassembly() {
        let mut d = H264Depacketizer::new();
        // FU indicator NRI=3 type=28, FU header S=1 type=5
        assert_eq!(
            d.decode(&packet(10, false, &[0x7C, 0x85, 0x01, 0x02])),
            Err(DecodeError::MorePacketsNeeded)
        );
        assert_eq!(
            d.decode(&packet(11, false, &[0x7C, 0x05, 0x03])),
            Err(DecodeError::MorePacketsNeeded)
        );
        let au = d.decode(&packet(12, true, &[0x7C, 0x45, 0x04])).unwrap();
        assert_eq!(au, vec![vec![0x65, 0x01, 0x02, 0x03, 0x04]]);
    }

    #[test]
    fn fu_a_without_start_is_benign() {
        let mut d = H264Depacketizer::new();
        let err = d.decode(&packet(5, false, &[0x7C, 0x05, 0x03])).unwrap_err();
        assert_eq!(err, DecodeError::NonStartingPacketAndNoPrevious);
        assert!(err.is_benign());
    }

    #[test]
    fn fu_a_sequence_gap_is_packet_lost() {
        let mut d = H264Depacketizer::new();
        let _ = d.decode(&packet(10, false, &[0x7C, 0x85, 0x01]));
        let err = d.decode(&packet(12, true, &[0x7C, 0x45, 0x02])).unwrap_err();
        assert_eq!(err, DecodeError::PacketLost);
        assert!(!err.is_benign());

        // The decoder recovers on the next starting fragment.
        let _ = d.decode(&packet(13, false, &[0x7C, 0x85, 0x01]));
        let au = d.decode(&packet(14, true, &[0x7C, 0x45, 0x02])).unwrap();
        assert_eq!(au, vec![vec![0x65, 0x01, 0x02]]);
    }

    #[test]
    fn fu_a_sequence_wraps() {
        let mut d = H264Depacketizer::new();
        let _ = d.decode(&packet(u16::MAX, false, &[0x7C, 0x85, 0x01]));
        let au = d.decode(&packet(0, true, &[0x7C, 0x45, 0x02])).unwrap();
        assert_eq!(au, vec![vec![0x65, 0x01, 0x02]]);
    }

    #[test]
    fn interleaved_mode_types_unsupported() {
        let mut d = H264Depacketizer::new();
        assert_eq!(
            d.decode(&packet(1, true, &[0x19, 0x00])),
            Err(DecodeError::UnsupportedPacketType(25))
        );
    }

    #[test]
    fn empty_payload_is_malformed() {
        let mut d = H264Depacketizer::new();
        assert!(matches!(
            d.decode(&packet(1, true, &[])),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn annex_b_payload_split() {
        let mut d = H264Depacketizer::new();
        let au = d
            .decode(&packet(1, true, &[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xCE]))
            .unwrap();
        assert_eq!(au, vec![vec![0x67, 0x42], vec![0x68, 0xCE]]);
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut d = H264Depacketizer::new();
        let _ = d.decode(&packet(1, false, &[0x67, 0x42]));
        d.reset();
        let au = d.decode(&packet(2, true, &[0x65, 0x88])).unwrap();
        assert_eq!(au, vec![vec![0x65, 0x88]]);
    }

    #[test]
    fn packetization_mode_from_format() {
        assert!(H264Depacketizer::from_format(&format(None)).is_ok());
        assert!(H264Depacketizer::from_format(&format(Some("packetization-mode=1"))).is_ok());
        assert!(matches!(
            H264Depacketizer::from_format(&format(Some(
                "profile-level-id=42e01f;packetization-mode=2"
            ))),
            Err(RtspError::DecoderInit(_))
        ));
    }
}
