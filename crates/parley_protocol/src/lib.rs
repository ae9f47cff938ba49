#![forbid(unsafe_code)]

pub mod convert;
pub mod endpoint;
pub mod framing;
pub mod pb;

pub use endpoint::{EndpointError, QuicEndpoint};
pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FrameCodec, FramingError, LENGTH_PREFIX_LEN, decode_frame, encode_frame,
	encode_frame_default, encode_frame_into, frame_len_from_payload_len, try_decode_frame_from_buffer,
};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation carried in `Envelope.version`.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;

	/// ALPN identifier negotiated on every QUIC connection.
	pub const ALPN: &[u8] = b"parley-v1";
}
