use crate::container::blocktab::BlockKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImgxError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(String),

    #[error("truncated container: need {needed} bytes at offset {offset}")]
    Truncated { offset: u64, needed: u64 },

    #[error("password does not match this container")]
    Authentication,

    #[error("checksum mismatch in {kind} block at offset {offset}")]
    Integrity { kind: BlockKind, offset: u64 },

    #[error("target too small: need {required} bytes, target has {available}")]
    Capacity { required: u64, available: u64 },

    #[error("operation cancelled")]
    Cancelled,
}

impl ImgxError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        ImgxError::Format(msg.into())
    }
}

// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, ImgxError>;
