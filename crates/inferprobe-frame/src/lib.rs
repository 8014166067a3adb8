//! Length-prefixed message framing with channel tagging.
//!
//! Every message is framed with:
//! - A 2-byte magic number ("FP") for stream synchronization
//! - A 2-byte little-endian channel ID
//! - A 4-byte little-endian payload length
//!
//! Blocking callers use [`FrameReader`] / [`FrameWriter`]; async callers wrap
//! a stream in `tokio_util::codec::Framed*` with [`FrameCodec`].

pub mod channel;
pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use channel::{channel_name, CONTROL, PROCESS};
pub use codec::{
    decode_frame, encode_frame, Frame, FrameCodec, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
