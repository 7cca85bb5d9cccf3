use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ---

use super::error::{PeerFileError, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Current metadata record version.  Bump when a field is added or changes
/// meaning.
pub const METADATA_VERSION: u32 = 1;

/// Default chunk size: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

// ---------------------------------------------------------------------------
// TransferMetadata
// ---------------------------------------------------------------------------

/// Description of the file being transferred, carried once in the
/// `FILE_START` payload.
///
/// Serialized as a JSON object with camelCase keys.  Every field is
/// required; deserialization of a record with a missing field fails rather
/// than filling in a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransferMetadata {
    // ---
    pub version: u32,

    pub file_name: String,

    /// Size in bytes.
    pub file_size: u64,

    /// MIME type or other free-form label; empty when unknown.
    pub file_type: String,

    /// Bytes per `FILE_CHUNK`; the last chunk may be shorter.
    pub chunk_size: u32,

    /// `ceil(file_size / chunk_size)`.
    pub chunks_total: u64,
}

// ---

impl TransferMetadata {
    // ---
    /// Build a record for the current version, computing `chunks_total`.
    ///
    /// Errors if `chunk_size` is zero.
    pub fn new(
        file_name: impl Into<String>,
        file_size: u64,
        file_type: impl Into<String>,
        chunk_size: u32,
    ) -> Result<Self> {
        // ---
        if chunk_size == 0 {
            return Err(PeerFileError::Metadata("chunk size must be positive".into()));
        }

        Ok(Self {
            version: METADATA_VERSION,
            file_name: file_name.into(),
            file_size,
            file_type: file_type.into(),
            chunk_size,
            chunks_total: chunks_total(file_size, chunk_size),
        })
    }

    // ---

    /// Length of chunk number `index` (zero-based), or 0 past the end.
    pub fn chunk_len(&self, index: u64) -> u64 {
        // ---
        let start = index.saturating_mul(self.chunk_size as u64);
        if start >= self.file_size {
            return 0;
        }
        (self.file_size - start).min(self.chunk_size as u64)
    }

    // ---

    /// Serialize to the `FILE_START` payload.
    pub fn to_payload(&self) -> Result<Bytes> {
        // ---
        let json = serde_json::to_vec(self)
            .map_err(|e| PeerFileError::Metadata(format!("serialize: {e}")))?;
        Ok(Bytes::from(json))
    }

    // ---

    /// Parse and validate a `FILE_START` payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        // ---
        let meta: TransferMetadata = serde_json::from_slice(payload)
            .map_err(|e| PeerFileError::Metadata(format!("deserialize: {e}")))?;
        meta.validate()?;
        Ok(meta)
    }

    // ---

    fn validate(&self) -> Result<()> {
        // ---
        if self.version != METADATA_VERSION {
            return Err(PeerFileError::Metadata(format!(
                "unsupported version: expected {METADATA_VERSION}, got {}",
                self.version
            )));
        }

        if self.chunk_size == 0 {
            return Err(PeerFileError::Metadata("chunk size must be positive".into()));
        }

        let expected = chunks_total(self.file_size, self.chunk_size);
        if self.chunks_total != expected {
            return Err(PeerFileError::Metadata(format!(
                "chunksTotal {} disagrees with ceil({} / {}) = {expected}",
                self.chunks_total, self.file_size, self.chunk_size
            )));
        }

        Ok(())
    }
}

// ---

/// `ceil(file_size / chunk_size)`.  `chunk_size` must be non-zero.
pub fn chunks_total(file_size: u64, chunk_size: u32) -> u64 {
    file_size.div_ceil(chunk_size as u64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
