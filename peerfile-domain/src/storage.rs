use std::path::PathBuf;

// ---

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

// ---

use super::error::Result;
use super::metadata::TransferMetadata;

// ---------------------------------------------------------------------------
// ByteSource
// ---------------------------------------------------------------------------

/// Boxed reader returned by [`ByteSource::open_at`].
pub type ChunkReader = Box<dyn AsyncRead + Send + Unpin>;

/// Producer of the bytes being sent.
///
/// A reader returned by [`open_at`](Self::open_at) is finite and is not
/// restartable; continuing from a different offset takes a fresh call.
#[async_trait]
pub trait ByteSource: Send {
    // ---
    fn file_name(&self) -> &str;

    /// Size in bytes.  Fixed for the lifetime of the source.
    fn file_size(&self) -> u64;

    /// MIME type or other label; empty when unknown.
    fn file_type(&self) -> &str;

    /// Open a reader positioned at `offset`.
    async fn open_at(&mut self, offset: u64) -> Result<ChunkReader>;
}

/// Convenience type alias for a heap-allocated [`ByteSource`].
pub type ByteSourcePtr = Box<dyn ByteSource>;

// ---------------------------------------------------------------------------
// ByteSink
// ---------------------------------------------------------------------------

/// Consumer of received bytes, in arrival order.
#[async_trait]
pub trait ByteSink: Send {
    // ---
    async fn append(&mut self, bytes: Bytes) -> Result<()>;

    /// All bytes have arrived; produce the reconstructed object.
    async fn finalize(&mut self, metadata: &TransferMetadata) -> Result<ReceivedFile>;

    /// Drop everything appended so far.  The sink may be appended to again
    /// afterwards (a restarted transfer).
    async fn discard(&mut self) -> Result<()>;
}

/// Convenience type alias for a heap-allocated [`ByteSink`].
pub type ByteSinkPtr = Box<dyn ByteSink>;

// ---------------------------------------------------------------------------
// ReceivedFile
// ---------------------------------------------------------------------------

/// Where the reconstructed bytes ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    // ---
    Memory(Bytes),
    Disk(PathBuf),
}

// ---

/// A completed transfer as seen by the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    // ---
    pub metadata: TransferMetadata,
    pub content: FileContent,
}
