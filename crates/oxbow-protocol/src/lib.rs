//! Wire messages exchanged between an oxbow host and the worker process it
//! supervises inside an isolated environment.
//!
//! The channel is a plain TCP stream on localhost carrying length-prefixed
//! JSON frames. Both sides of the conversation live in this crate so the
//! host library and the worker binary cannot drift apart.

mod codec;
mod frame;

pub use codec::{Connection, MAX_FRAME_LEN, read_frame, write_frame};
pub use frame::Frame;

/// Errors raised while encoding, decoding or transporting frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to encode or decode a frame")]
    Json(#[from] serde_json::Error),

    #[error("frame of {len} bytes exceeds the maximum of {MAX_FRAME_LEN} bytes")]
    FrameTooLarge { len: usize },
}

impl ProtocolError {
    /// True when the error means the peer went away rather than that the
    /// stream carried garbage. The host treats these as a lost connection
    /// (null result), not as a failure.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}
