//! AudioSocket frame codec
//!
//! Wire format, big-endian:
//!
//! ```text
//! +------+--------+----------------+
//! | kind | length |    payload     |
//! | 1 B  |  2 B   |  length bytes  |
//! +------+--------+----------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::call_id::CallId;
use crate::error::{AudioSocketError, Result};

/// Frame kind: hangup, empty payload.
pub const KIND_HANGUP: u8 = 0x00;
/// Frame kind: call identifier, 16-byte payload.
pub const KIND_ID: u8 = 0x01;
/// Frame kind: SLIN audio payload.
pub const KIND_AUDIO: u8 = 0x10;
/// Frame kind: error, first payload byte is the error code.
pub const KIND_ERROR: u8 = 0xff;

/// Header size: kind byte plus big-endian u16 length.
pub const HEADER_LEN: usize = 3;

/// A decoded AudioSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Call identifier announced by the peer.
    Id(CallId),
    /// Opaque SLIN audio payload.
    Audio(Bytes),
    /// Graceful hangup.
    Hangup,
    /// Error report from the peer.
    Error { code: u8, detail: Bytes },
}

impl Frame {
    /// The wire kind byte of this frame.
    pub fn kind(&self) -> u8 {
        match self {
            Frame::Id(_) => KIND_ID,
            Frame::Audio(_) => KIND_AUDIO,
            Frame::Hangup => KIND_HANGUP,
            Frame::Error { .. } => KIND_ERROR,
        }
    }

    /// Payload length on the wire.
    pub fn payload_len(&self) -> usize {
        match self {
            Frame::Id(_) => 16,
            Frame::Audio(pcm) => pcm.len(),
            Frame::Hangup => 0,
            Frame::Error { detail, .. } => 1 + detail.len(),
        }
    }

    /// Serialize into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN + self.payload_len());
        buf.put_u8(self.kind());
        buf.put_u16(self.payload_len() as u16);
        match self {
            Frame::Id(call_id) => buf.put_slice(&call_id.to_wire()),
            Frame::Audio(pcm) => buf.put_slice(pcm),
            Frame::Hangup => {}
            Frame::Error { code, detail } => {
                buf.put_u8(*code);
                buf.put_slice(detail);
            }
        }
    }

    /// Serialize into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Interpret a kind byte and its payload as a frame.
    ///
    /// Decoding is strict: an unknown kind, an ID payload that is not
    /// exactly 16 bytes, or an ERROR frame without a code byte all fail.
    pub fn from_parts(kind: u8, payload: Bytes) -> Result<Frame> {
        match kind {
            KIND_HANGUP => Ok(Frame::Hangup),
            KIND_ID => Ok(Frame::Id(CallId::from_wire(&payload)?)),
            KIND_AUDIO => Ok(Frame::Audio(payload)),
            KIND_ERROR => {
                let mut payload = payload;
                if payload.is_empty() {
                    return Err(AudioSocketError::EmptyErrorPayload);
                }
                let code = payload.get_u8();
                Ok(Frame::Error {
                    code,
                    detail: payload,
                })
            }
            other => Err(AudioSocketError::UnknownKind(other)),
        }
    }

    /// Decode one frame from `buf`, returning `None` when more bytes are
    /// needed. Consumes nothing until a whole frame is available.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        if buf.len() < HEADER_LEN + length {
            return Ok(None);
        }
        let kind = buf.get_u8();
        let _ = buf.get_u16();
        let payload = buf.split_to(length).freeze();
        Frame::from_parts(kind, payload).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn hangup_is_three_zero_bytes() {
        assert_eq!(&Frame::Hangup.to_bytes()[..], &[0x00, 0x00, 0x00]);
    }

    #[test]
    fn encode_decode_round_trips() {
        round_trip(Frame::Hangup);
        round_trip(Frame::Id(CallId::generate()));
        round_trip(Frame::Audio(Bytes::from(vec![0u8; 320])));
        round_trip(Frame::Audio(Bytes::new()));
        round_trip(Frame::Error {
            code: 0x02,
            detail: Bytes::from_static(b"no media"),
        });
    }

    #[test]
    fn id_frame_length_is_checked() {
        let mut buf = BytesMut::new();
        buf.put_u8(KIND_ID);
        buf.put_u16(8);
        buf.put_slice(&[0u8; 8]);
        let err = Frame::decode(&mut buf).unwrap_err();
        assert!(matches!(err, AudioSocketError::InvalidIdLength(8)));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x42);
        buf.put_u16(0);
        let err = Frame::decode(&mut buf).unwrap_err();
        assert!(matches!(err, AudioSocketError::UnknownKind(0x42)));
    }

    #[test]
    fn empty_error_payload_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(KIND_ERROR);
        buf.put_u16(0);
        let err = Frame::decode(&mut buf).unwrap_err();
        assert!(matches!(err, AudioSocketError::EmptyErrorPayload));
    }

    #[test]
    fn partial_header_waits_for_more() {
        let mut buf = BytesMut::new();
        buf.put_u8(KIND_AUDIO);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        buf.put_u16(4);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        buf.put_slice(&[1, 2, 3, 4]);
        let frame = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::Audio(Bytes::from_static(&[1, 2, 3, 4])));
    }
}
