//! Framed codec for the length-prefixed wire protocol.
//!
//! Layout of one frame on the wire:
//!
//! | bytes  | field |
//! |--------|-------|
//! | 4      | little-endian length `L`, covering everything after itself |
//! | 1      | command |
//! | 1      | flags |
//! | 16     | conversation id, little-endian UUID byte order |
//! | L - 18 | payload |
//!
//! A frame advertising `L < 18` cannot hold its own header; that is a fatal
//! protocol error and fails the connection.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::frame::Frame;

/// Command + flags + conversation id: everything the length prefix covers
/// except the payload.
pub const FRAME_HEADER_LEN: usize = 1 + 1 + 16;
/// Size of the length prefix itself.
pub const LENGTH_PREFIX_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The advertised length cannot hold the fixed header.
    #[error("frame length {length} is below the 18-byte minimum")]
    LengthBelowMinimum { length: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Stateless between frames: partial-frame bytes stay in the `BytesMut`
/// handed to `decode`, so the decoder's output is a pure function of the
/// bytes fed so far, however they were chunked.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> FrameCodec {
        FrameCodec
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let mut length_bytes = [0u8; LENGTH_PREFIX_LEN];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let length = u32::from_le_bytes(length_bytes) as usize;
        if length < FRAME_HEADER_LEN {
            return Err(FrameError::LengthBelowMinimum { length });
        }
        if src.len() < LENGTH_PREFIX_LEN + length {
            // Partial frame; ask for the remainder before parsing again.
            src.reserve(LENGTH_PREFIX_LEN + length - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_LEN);
        let command = src.get_u8();
        let frame_flags = src.get_u8();
        let mut id_bytes = [0u8; 16];
        src.copy_to_slice(&mut id_bytes);
        let conversation_id = Uuid::from_bytes_le(id_bytes);
        let payload = src.split_to(length - FRAME_HEADER_LEN).freeze();
        Ok(Some(Frame {
            command,
            flags: frame_flags,
            conversation_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let length = FRAME_HEADER_LEN + frame.payload.len();
        dst.reserve(LENGTH_PREFIX_LEN + length);
        dst.put_u32_le(length as u32);
        dst.put_u8(frame.command);
        dst.put_u8(frame.flags);
        dst.put_slice(&frame.conversation_id.to_bytes_le());
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
