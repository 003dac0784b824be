use std::io::{self, Read};

use bytes::{BufMut, Bytes, BytesMut};

/// Marker byte of an interleaved binary frame (RFC 2326 §10.12).
pub const FRAME_MARKER: u8 = b'$';

/// Largest payload a frame can carry (16-bit length field).
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Wrap an RTP/RTCP packet for the RTSP TCP connection.
///
/// ```text
/// +-----+---------+----------------+--------------------+
/// | '$' | channel | length (BE u16) | payload (length)  |
/// +-----+---------+----------------+--------------------+
/// ```
///
/// Payloads longer than [`MAX_FRAME_PAYLOAD`] cannot be framed and yield
/// `None`.
pub fn encode_frame(channel: u8, payload: &[u8]) -> Option<Bytes> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return None;
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u8(FRAME_MARKER);
    buf.put_u8(channel);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Some(buf.freeze())
}

/// Read one frame whose `$` marker has not been consumed yet.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<(u8, Bytes)> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    if header[0] != FRAME_MARKER {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "interleaved frame without '$' marker",
        ));
    }
    let channel = header[1];
    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok((channel, Bytes::from(payload)))
}

/// RTP channel of an interleaved pair; RTCP uses the next one.
pub fn rtp_channel_for_media(media_index: usize) -> u8 {
    (media_index * 2) as u8
}
