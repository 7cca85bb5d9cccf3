//! Peerfile transfer core: session state machines, their async drivers, the
//! transfer multiplexer, storage backends and a TCP channel.
//!
//! # Layers
//!
//! ```text
//!  SenderSession / ReceiverSession   pure state machines, input -> effects
//!          │
//!  spawn_sender / spawn_receiver     tokio tasks executing the effects
//!          │
//!  TransferMux                       transfer id -> live receiver session
//!          │
//!  Channel (peerfile-domain)         TcpChannel, or link-sim in tests
//! ```
//!
//! The state machines never touch a channel, a file or a clock.  Every
//! protocol rule is tested against them directly; the drivers only move
//! bytes.

mod config;
mod receiver;
mod receiver_task;
mod resume;
mod sender;
mod sender_task;
mod storage;
mod tcp;
mod transfer_mux;

// Gateway re-exports; siblings import via super::Symbol.

// --- config
pub use config::{Config, Mode, ReceiverConfig, SenderConfig};

// --- state machines
pub use receiver::{ReceiverEffect, ReceiverInput, ReceiverSession, ReceiverState};
pub use sender::{SenderEffect, SenderInput, SenderSession, SenderState};

// --- resume negotiation
pub use resume::{resume_offset, AttachRequest, ResumeOffer};

// --- drivers
pub use receiver_task::{spawn_receiver, ReceiverHandle, ReceiverStatus};
pub use sender_task::{spawn_sender, SenderHandle};
pub use transfer_mux::{Attachment, TransferMux};

pub(crate) use receiver_task::ReceiverTask;

// --- storage
pub use storage::{
    // ---
    FileSink,
    FileSource,
    MemorySink,
    MemorySource,
};

// --- tcp
pub use tcp::{read_message, write_message, TcpChannel, MAX_MESSAGE_LEN};
