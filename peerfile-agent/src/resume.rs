//! Resume negotiation records.
//!
//! The sender works in bytes, the receiver counts whole chunks.  Because only
//! the final chunk may be short, `chunks * chunk_size` is always an exact
//! chunk boundary and converts losslessly:
//!
//! ```text
//!   receiver: chunks_received = 3          (chunk_size 8192)
//!   sender:   offset_bytes    = 3 * 8192 = 24576, clamped to file_size
//! ```
//!
//! Both records travel as JSON on the signaling path, ahead of any frame:
//! the sender opens with an [`AttachRequest`] and the receiver answers with
//! a [`ResumeOffer`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ---

use peerfile_domain::{PeerFileError, Result, TransferId};

// ---------------------------------------------------------------------------
// resume_offset
// ---------------------------------------------------------------------------

/// Byte offset a sender resumes from when the receiver holds `chunks`.
pub fn resume_offset(chunks: u64, chunk_size: u32, file_size: u64) -> u64 {
    chunks.saturating_mul(chunk_size as u64).min(file_size)
}

// ---------------------------------------------------------------------------
// AttachRequest
// ---------------------------------------------------------------------------

/// First message a sender writes on a fresh channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachRequest {
    // ---
    pub transfer_id: TransferId,
}

// ---

impl AttachRequest {
    // ---
    pub fn new(transfer_id: TransferId) -> Self {
        Self { transfer_id }
    }

    pub fn to_message(&self) -> Result<Bytes> {
        to_message(self)
    }

    pub fn from_message(msg: &[u8]) -> Result<Self> {
        from_message(msg)
    }
}

// ---------------------------------------------------------------------------
// ResumeOffer
// ---------------------------------------------------------------------------

/// What the receiver already holds for a transfer.
///
/// A zero count means "start from the beginning, `FILE_START` included".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeOffer {
    // ---
    pub transfer_id: TransferId,

    pub chunks_received: u64,

    /// Chunk size of the partial transfer, once `FILE_START` has been seen.
    /// A resuming sender must use it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u32>,
}

// ---

impl ResumeOffer {
    // ---
    /// Offer for a transfer the receiver has never seen.
    pub fn fresh(transfer_id: TransferId) -> Self {
        // ---
        Self {
            transfer_id,
            chunks_received: 0,
            chunk_size: None,
        }
    }

    // ---

    /// Byte offset to resume from.  `chunk_size` is the sender's
    /// configured size; the offer's own size wins when present.
    pub fn offset_bytes(&self, chunk_size: u32, file_size: u64) -> u64 {
        resume_offset(self.chunks_received, self.chunk_size.unwrap_or(chunk_size), file_size)
    }

    /// Chunk size the sender should use.
    pub fn effective_chunk_size(&self, configured: u32) -> u32 {
        self.chunk_size.unwrap_or(configured)
    }

    pub fn to_message(&self) -> Result<Bytes> {
        to_message(self)
    }

    pub fn from_message(msg: &[u8]) -> Result<Self> {
        from_message(msg)
    }
}

// ---

fn to_message<T: Serialize>(value: &T) -> Result<Bytes> {
    // ---
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| PeerFileError::Transport(format!("signaling serialize error: {e}")))
}

fn from_message<T: for<'de> Deserialize<'de>>(msg: &[u8]) -> Result<T> {
    // ---
    serde_json::from_slice(msg)
        .map_err(|e| PeerFileError::Transport(format!("signaling deserialize error: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
