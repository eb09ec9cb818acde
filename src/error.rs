use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::session::SessionState;

/// Everything that can end a feed session without a persisted artifact.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Fewer than 17 bytes were available where a frame was expected.
    #[error("malformed frame: expected {expected} bytes, got {got}")]
    MalformedFrame { expected: usize, got: usize },

    /// The stream ended with bytes left over that do not form a whole frame.
    #[error("truncated frame: {residual} residual bytes at end of stream")]
    TruncatedFrame { residual: usize },

    #[error("symbol bytes {bytes:02x?} are not ASCII")]
    InvalidSymbol { bytes: [u8; 4] },

    #[error("side indicator {byte:#04x} is not B, S or R")]
    InvalidSide { byte: u8 },

    #[error("unknown request tag {tag}")]
    UnknownRequest { tag: u8 },

    /// Only the compact one-byte resend form is available in compatibility mode.
    #[error("sequence {sequence} cannot be encoded in a one-byte resend request")]
    SequenceOutOfRange { sequence: i32 },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("timed out while {state}")]
    Timeout { state: SessionState },

    #[error("session cancelled while {state}")]
    Cancelled { state: SessionState },

    #[error("recovery incomplete, still missing sequences {missing:?}")]
    RecoveryIncomplete { missing: Vec<i32> },

    /// The initial batch implies more gaps than the session will chase.
    #[error("{missing} sequences missing, more than the limit of {limit}")]
    TooManyGaps { missing: u64, limit: usize },

    #[error("session already ran and ended {state}")]
    SessionReused { state: SessionState },

    #[error("invalid exchange config: {0}")]
    InvalidConfig(String),

    #[error("persisting {} failed", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, FeedError>;

impl FeedError {
    /// True when the underlying transport gave up waiting for bytes.
    pub fn is_timeout(&self) -> bool {
        match self {
            FeedError::Transport(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            FeedError::Timeout { .. } => true,
            _ => false,
        }
    }
}
