//! Core traits, frame codec and types for peerfile transfers.
//!
//! This crate defines the vocabulary of the system. The agent and the link
//! simulator depend on `peerfile-domain` and speak its types. No transfer
//! logic lives here.
//!
//! # Structure
//!
//! - [`error`]    — [`PeerFileError`] and [`Result<T>`] alias
//! - [`frame`]    — [`Frame`] codec and the [`ControlHeader`] table
//! - [`metadata`] — [`TransferMetadata`] carried by `FILE_START`
//! - [`channel`]  — [`ChannelTx`] / [`ChannelRx`] capability traits
//! - [`flow`]     — [`FlowGate`] backpressure accounting for channel impls
//! - [`storage`]  — [`ByteSource`] / [`ByteSink`] traits
//! - [`events`]   — [`TransferId`], progress and lifecycle events

mod channel;
mod error;
mod events;
mod flow;
mod frame;
mod metadata;
mod storage;

// --- error
pub use error::{PeerFileError, Result};

// --- frame
pub use frame::{ControlHeader, Frame, FrameError};

// --- metadata
pub use metadata::{chunks_total, TransferMetadata, DEFAULT_CHUNK_SIZE, METADATA_VERSION};

// --- channel
pub use channel::{
    // ---
    Channel,
    ChannelRx,
    ChannelRxPtr,
    ChannelTx,
    ChannelTxPtr,
};

// --- flow
pub use flow::{FlowGate, DEFAULT_HIGH_WATER_BYTES};

// --- storage
pub use storage::{
    // ---
    ByteSink,
    ByteSinkPtr,
    ByteSource,
    ByteSourcePtr,
    ChunkReader,
    FileContent,
    ReceivedFile,
};

// --- events
pub use events::{
    // ---
    Initiator,
    ReceiverEvent,
    SenderEvent,
    TransferId,
    TransferProgress,
};
