//! Frame codec for the transfer channel.
//!
//! Every message exchanged on a transfer channel is exactly one frame:
//!
//! ```text
//! +--------+------------------------------+
//! | header | payload                      |
//! | 1 byte | 0..N bytes (may be empty)    |
//! +--------+------------------------------+
//! ```
//!
//! There is no length prefix.  The channel preserves message boundaries, so
//! one [`Frame::encode`] corresponds to exactly one [`Frame::decode`] on the
//! far side.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ControlHeader
// ---------------------------------------------------------------------------

/// Control code carried in byte 0 of every frame.
///
/// The numeric values are part of the wire format and must match on both
/// ends of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlHeader {
    // ---
    /// Payload: JSON [`crate::TransferMetadata`].
    FileStart = 0,

    /// Payload: raw file bytes, at most `chunk_size`.
    FileChunk = 1,

    /// Payload: decimal text count of chunks the receiver has accepted.
    FileChunkAck = 2,

    /// Payload: empty.
    FileEnd = 3,

    /// Payload: empty.
    TransferPause = 4,

    /// Payload: decimal text count of chunks the requester already has.
    TransferResume = 5,

    /// Payload: empty.
    TransferCancel = 6,
}

// ---

impl ControlHeader {
    // ---
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ---

impl TryFrom<u8> for ControlHeader {
    // ---
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        // ---
        match value {
            0 => Ok(Self::FileStart),
            1 => Ok(Self::FileChunk),
            2 => Ok(Self::FileChunkAck),
            3 => Ok(Self::FileEnd),
            4 => Ok(Self::TransferPause),
            5 => Ok(Self::TransferResume),
            6 => Ok(Self::TransferCancel),
            other => Err(FrameError::UnknownHeader(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// FrameError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    // ---
    #[error("empty message has no header byte")]
    Empty,

    #[error("unknown control header 0x{0:02X}")]
    UnknownHeader(u8),

    #[error("invalid count payload: {0:?}")]
    InvalidCount(String),
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One decoded channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    // ---
    pub header: ControlHeader,

    /// Everything after byte 0.  Empty, never absent, for 1-byte messages.
    pub payload: Bytes,
}

// ---

impl Frame {
    // ---
    pub fn new(header: ControlHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    // ---

    /// A frame with an empty payload (`FILE_END`, `TRANSFER_PAUSE`, ...).
    pub fn control(header: ControlHeader) -> Self {
        Self::new(header, Bytes::new())
    }

    // ---

    /// A frame whose payload is the decimal text form of `count`.
    ///
    /// Used by `TRANSFER_RESUME` and `FILE_CHUNK_ACK`.
    pub fn count_payload(header: ControlHeader, count: u64) -> Self {
        Self::new(header, Bytes::from(count.to_string()))
    }

    // ---

    /// Parse a decimal text count payload.
    pub fn parse_count(&self) -> Result<u64, FrameError> {
        // ---
        let text = std::str::from_utf8(&self.payload)
            .map_err(|_| FrameError::InvalidCount(format!("{:?}", &self.payload[..])))?;

        text.trim()
            .parse::<u64>()
            .map_err(|_| FrameError::InvalidCount(text.to_string()))
    }

    // ---

    /// Encode into one channel message: header byte followed by the payload.
    pub fn encode(&self) -> Bytes {
        // ---
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.header.as_u8());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    // ---

    /// Decode one channel message.
    ///
    /// The payload is a zero-copy slice of `msg`.
    pub fn decode(msg: Bytes) -> Result<Self, FrameError> {
        // ---
        let first = *msg.first().ok_or(FrameError::Empty)?;
        let header = ControlHeader::try_from(first)?;
        Ok(Self {
            header,
            payload: msg.slice(1..),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
