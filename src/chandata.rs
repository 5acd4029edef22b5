//! TURN channel-data framing (RFC 5766 §11.5).
//!
//! A frame is a 4-byte header followed by the raw payload: 16-bit channel
//! number (high bits `01`), 16-bit payload length, payload. Datagram
//! transports carry the frame unpadded.

use bytes::{BufMut, BytesMut};

/// Lowest channel number a TURN server may assign.
pub const MIN_CHANNEL_NUMBER: u16 = 0x4000;
/// Highest channel number this client will issue.
pub const MAX_CHANNEL_NUMBER: u16 = 0x7FFE;

pub(crate) const HEADER_LEN: usize = 4;

/// Whether `datagram` looks like a channel-data frame (leading bits `01`).
pub(crate) fn is_channel_data(datagram: &[u8]) -> bool {
    datagram.len() >= HEADER_LEN && datagram[0] & 0xC0 == 0x40
}

pub(crate) fn encode(number: u16, payload: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u16(number);
    frame.put_u16(payload.len() as u16);
    frame.put_slice(payload);
    frame
}

/// Splits a frame into channel number and payload.
///
/// Returns `None` for frames too short to carry their declared length;
/// trailing bytes beyond the declared length (padding on stream transports)
/// are ignored.
pub(crate) fn parse(frame: &[u8]) -> Option<(u16, &[u8])> {
    if frame.len() < HEADER_LEN {
        return None;
    }
    let number = u16::from_be_bytes([frame[0], frame[1]]);
    let len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    let payload = frame.get(HEADER_LEN..HEADER_LEN + len)?;
    Some((number, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let frame = encode(0x4001, b"hello world!");
        assert_eq!(&frame[..4], &[0x40, 0x01, 0x00, 0x0c]);
        let (number, payload) = parse(&frame).unwrap();
        assert_eq!(number, 0x4001);
        assert_eq!(payload, b"hello world!");
    }

    #[test]
    fn empty_payload() {
        let frame = encode(MIN_CHANNEL_NUMBER, &[]);
        assert_eq!(frame.len(), HEADER_LEN);
        let (number, payload) = parse(&frame).unwrap();
        assert_eq!(number, MIN_CHANNEL_NUMBER);
        assert!(payload.is_empty());
    }

    #[test]
    fn padding_ignored() {
        let mut frame = encode(0x4abc, b"abc").to_vec();
        frame.push(0); // stream-transport alignment byte
        let (_, payload) = parse(&frame).unwrap();
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn truncated_frames_rejected() {
        assert!(parse(&[0x40]).is_none());
        // Header declares 4 payload bytes but only 2 follow.
        assert!(parse(&[0x40, 0x00, 0x00, 0x04, 1, 2]).is_none());
    }

    #[test]
    fn classification() {
        assert!(is_channel_data(&[0x40, 0x00, 0x00, 0x00]));
        assert!(is_channel_data(&[0x7f, 0xff, 0x00, 0x00]));
        assert!(!is_channel_data(&[0x00, 0x01, 0x00, 0x00])); // STUN type byte
        assert!(!is_channel_data(&[0x80, 0x00, 0x00, 0x00]));
        assert!(!is_channel_data(&[0x40, 0x00])); // too short
    }
}
