#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use thiserror::Error;

/// Size of the big-endian length prefix in front of every frame.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge { len: usize, max: usize },

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData { need: usize, have: usize },

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

impl FramingError {
	/// True when more bytes may still complete the frame.
	pub fn is_incomplete(&self) -> bool {
		matches!(self, FramingError::InsufficientData { .. })
	}
}

/// Length-prefixed protobuf codec with a fixed payload bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
	max_frame_size: usize,
}

impl Default for FrameCodec {
	fn default() -> Self {
		Self::new(DEFAULT_MAX_FRAME_SIZE)
	}
}

impl FrameCodec {
	pub const fn new(max_frame_size: usize) -> Self {
		Self { max_frame_size }
	}

	pub const fn max_frame_size(&self) -> usize {
		self.max_frame_size
	}

	fn check_len(&self, len: usize) -> Result<(), FramingError> {
		if len > self.max_frame_size {
			return Err(FramingError::FrameTooLarge {
				len,
				max: self.max_frame_size,
			});
		}
		Ok(())
	}

	/// Encode `msg` into a fresh frame.
	pub fn encode<M: Message>(&self, msg: &M) -> Result<Vec<u8>, FramingError> {
		let payload_len = msg.encoded_len();
		self.check_len(payload_len)?;

		let mut out = Vec::with_capacity(frame_len_from_payload_len(payload_len));
		out.put_u32(payload_len as u32);
		msg.encode(&mut out)?;
		Ok(out)
	}

	/// Append a frame for `msg` to `buf`.
	pub fn encode_into<M: Message>(&self, buf: &mut BytesMut, msg: &M) -> Result<(), FramingError> {
		let payload_len = msg.encoded_len();
		self.check_len(payload_len)?;

		buf.reserve(frame_len_from_payload_len(payload_len));
		buf.put_u32(payload_len as u32);
		msg.encode(buf)?;
		Ok(())
	}

	/// Payload length announced by the prefix at the start of `src`, if present.
	pub fn peek_len(&self, src: &[u8]) -> Result<Option<usize>, FramingError> {
		let Some(prefix) = src.get(..LENGTH_PREFIX_LEN) else {
			return Ok(None);
		};
		let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
		self.check_len(len)?;
		Ok(Some(len))
	}

	/// Decode one frame from the start of `src`, returning the message and bytes consumed.
	pub fn decode<M: Message + Default>(&self, src: &[u8]) -> Result<(M, usize), FramingError> {
		let Some(len) = self.peek_len(src)? else {
			return Err(FramingError::InsufficientData {
				need: LENGTH_PREFIX_LEN,
				have: src.len(),
			});
		};

		let need = frame_len_from_payload_len(len);
		if src.len() < need {
			return Err(FramingError::InsufficientData { need, have: src.len() });
		}

		let msg = M::decode(&src[LENGTH_PREFIX_LEN..need])?;
		Ok((msg, need))
	}

	/// Pop one complete frame off `buf`. `Ok(None)` means more bytes are needed.
	pub fn try_decode<M: Message + Default>(&self, buf: &mut BytesMut) -> Result<Option<M>, FramingError> {
		let Some(len) = self.peek_len(buf)? else {
			return Ok(None);
		};

		let need = frame_len_from_payload_len(len);
		if buf.len() < need {
			return Ok(None);
		}

		let mut frame = buf.split_to(need);
		frame.advance(LENGTH_PREFIX_LEN);
		Ok(Some(M::decode(frame.freeze())?))
	}
}

/// Encode a protobuf message into a length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	FrameCodec::new(max_frame_size).encode(msg)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default<M: Message>(msg: &M) -> Result<Vec<u8>, FramingError> {
	FrameCodec::default().encode(msg)
}

/// Append an encoded frame into the provided buffer.
pub fn encode_frame_into<M: Message>(buf: &mut BytesMut, msg: &M, max_frame_size: usize) -> Result<(), FramingError> {
	FrameCodec::new(max_frame_size).encode_into(buf, msg)
}

#[inline]
pub const fn frame_len_from_payload_len(payload_len: usize) -> usize {
	LENGTH_PREFIX_LEN + payload_len
}

/// Decode a single frame from the start of `src`.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	FrameCodec::new(max_frame_size).decode(src)
}

/// Try to decode a single frame from a growable buffer.
pub fn try_decode_frame_from_buffer<M: Message + Default>(
	buf: &mut BytesMut,
	max_frame_size: usize,
) -> Result<Option<M>, FramingError> {
	FrameCodec::new(max_frame_size).try_decode(buf)
}
