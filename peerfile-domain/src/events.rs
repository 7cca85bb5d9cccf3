use std::fmt;

// ---

use serde::{Deserialize, Serialize};

// ---

use super::metadata::TransferMetadata;
use super::storage::ReceivedFile;

// ---------------------------------------------------------------------------
// TransferId
// ---------------------------------------------------------------------------

/// Opaque identifier tagging one transfer across channel instances.
///
/// Stable across reconnections; the multiplexer uses it to find the
/// receiver session a fresh channel belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

// ---

impl TransferId {
    // ---
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransferId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for TransferId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// TransferProgress
// ---------------------------------------------------------------------------

/// Progress snapshot for one side of a transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    // ---
    /// Bytes sent (sender) or received (receiver).
    pub bytes: u64,

    pub file_size: u64,

    /// `0.0 ..= 1.0`.  Exactly `1.0` only on completion.
    pub fraction: f64,
}

// ---

impl TransferProgress {
    // ---
    /// Percentage rounded to three decimals, e.g. `42.125`.
    pub fn percent(&self) -> f64 {
        (self.fraction * 100_000.0).round() / 1_000.0
    }
}

// ---------------------------------------------------------------------------
// Initiator
// ---------------------------------------------------------------------------

/// Which end asked for a pause, resume or cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    // ---
    /// This end, through its handle.
    Local,

    /// The other end, through a control frame.
    Peer,
}

// ---------------------------------------------------------------------------
// SenderEvent
// ---------------------------------------------------------------------------

/// Lifecycle notifications from a sender session.
#[derive(Debug, Clone, PartialEq)]
pub enum SenderEvent {
    // ---
    Progress(TransferProgress),

    Paused(Initiator),

    Resumed(Initiator),

    Cancelled(Initiator),

    /// `FILE_END` sent; every byte was handed to the channel.
    Done { bytes_sent: u64 },

    /// The session cannot continue (channel closed, source truncated).
    /// Resumption takes a new session on a new channel.
    Failed { offset: u64, reason: String },
}

// ---------------------------------------------------------------------------
// ReceiverEvent
// ---------------------------------------------------------------------------

/// Lifecycle notifications from a receiver session.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    // ---
    /// `FILE_START` accepted.
    Started(TransferMetadata),

    Progress(TransferProgress),

    Paused(Initiator),

    Resumed(Initiator),

    Cancelled(Initiator),

    /// Every declared byte arrived and the sink was finalized.  Fires once.
    Done(ReceivedFile),

    /// `FILE_END` arrived before `file_size` bytes did.  The session stays
    /// incomplete.
    Incomplete { bytes_received: u64, file_size: u64 },

    /// The channel closed mid-transfer.  Progress is kept; the session waits
    /// for a replacement channel.
    Interrupted { bytes_received: u64, chunks_received: u64 },

    /// A replacement channel was attached.
    Reattached { chunks_received: u64 },

    /// The sink failed to store or finalize bytes.
    Failed { reason: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn percent_rounds_to_three_decimals() {
        // ---
        let p = TransferProgress {
            bytes: 1,
            file_size: 3,
            fraction: 1.0 / 3.0,
        };
        assert_eq!(p.percent(), 33.333);
    }

    // ---

    #[test]
    fn transfer_id_serializes_as_plain_string() {
        // ---
        let id = TransferId::from("cat1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"cat1\"");
        assert_eq!(id.to_string(), "cat1");
    }
}
