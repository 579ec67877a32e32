//! Length-prefixed frame codec for the cTrader TCP stream.
//!
//! Wire format: 4-byte big-endian unsigned length `L`, followed by
//! exactly `L` payload bytes. Payload decoding (the JSON envelope) is
//! the session's concern; this layer only reassembles frames.

pub mod frame;

pub use frame::{FrameCodec, MAX_FRAME_LEN};

use thiserror::Error;

/// Codec error types.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    FrameTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;
