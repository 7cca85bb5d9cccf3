use thiserror::Error;

// ---

#[derive(Debug, Error)]
pub enum PeerFileError {
    // ---
    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] crate::frame::FrameError),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("source ended at byte {offset}, expected {file_size}")]
    SourceTruncated { offset: u64, file_size: u64 },

    #[error("transfer not found: {0}")]
    TransferNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

pub type Result<T> = std::result::Result<T, PeerFileError>;
