use thiserror::Error;

/// Failure kinds surfaced by every fallible operation in this crate.
#[derive(Error, Debug)]
pub enum UsmError {
    #[error("not a usm file (bad signature)")]
    NotUsm,

    #[error("malformed @UTF table: {reason}")]
    MalformedTable { reason: String },

    #[error("malformed chunk: {reason}")]
    MalformedChunk { reason: String },

    #[error("unsupported codec tag: {tag}")]
    UnsupportedCodec { tag: String },

    #[error("container is encrypted but no key was installed")]
    DecryptionRequired,

    #[error("operation requires a key but none is installed")]
    KeyMissing,

    #[error("page protocol violated on channel {channel}: {reason}")]
    StreamOrdering { channel: String, reason: String },

    #[error(transparent)]
    IoFailure(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, UsmError>;
