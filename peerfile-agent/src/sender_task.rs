//! [`SenderTask`] — async driver for one [`SenderSession`].
//!
//! The task owns the channel, the byte source and the session.  Its loop
//! selects over three things:
//!
//! - commands from [`SenderHandle`] (start, pause, resume, cancel)
//! - inbound frames from the receiver
//! - the chunk pump: wait for channel capacity, then read one chunk
//!
//! The pump takes the open reader out of `self.reader` while a read is in
//! progress.  If another branch wins the race the pump future is dropped and
//! the reader with it, so the next pump reopens the source at the session's
//! confirmed offset.  A half-finished read can never leak bytes into the
//! stream.

use std::collections::VecDeque;

// ---

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};

// ---

use peerfile_domain::{
    // ---
    ByteSourcePtr,
    Channel,
    ChannelTx,
    ChunkReader,
    Frame,
    Result,
    SenderEvent,
    TransferId,
    TransferMetadata,
};

// ---

use super::{SenderConfig, SenderEffect, SenderInput, SenderSession, SenderState};

// ---------------------------------------------------------------------------
// SenderHandle
// ---------------------------------------------------------------------------

/// Cheap-clone handle to a running [`SenderTask`].
///
/// Commands are fire-and-forget; once the task has reached a terminal state
/// they are dropped.
#[derive(Clone)]
pub struct SenderHandle {
    // ---
    transfer_id: TransferId,
    cmd_tx: mpsc::UnboundedSender<SenderInput>,
    state_rx: watch::Receiver<SenderState>,
}

// ---

impl SenderHandle {
    // ---
    pub fn transfer_id(&self) -> &TransferId {
        &self.transfer_id
    }

    pub fn start(&self) {
        self.command(SenderInput::Start);
    }

    pub fn pause(&self) {
        self.command(SenderInput::Pause);
    }

    pub fn resume(&self) {
        self.command(SenderInput::Resume);
    }

    pub fn cancel(&self) {
        self.command(SenderInput::Cancel);
    }

    /// Current state of the session.
    pub fn state(&self) -> SenderState {
        *self.state_rx.borrow()
    }

    // ---

    /// Wait until the session reaches `Done`, `Cancelled` or `Failed`.
    pub async fn finished(&self) -> SenderState {
        // ---
        let mut rx = self.state_rx.clone();
        let result = rx.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        match result {
            Ok(state) => state,
            // Task gone: the last published state is final.
            Err(_) => *rx.borrow(),
        }
    }

    // ---

    fn command(&self, input: SenderInput) {
        // ---
        if self.cmd_tx.send(input).is_err() {
            tracing::debug!(transfer_id = %self.transfer_id, "sender: task exited, command dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// spawn_sender
// ---------------------------------------------------------------------------

/// Build a sender session for `source` and spawn its driver.
///
/// `resume_offset` comes from the receiver's [`crate::ResumeOffer`]; pass 0
/// for a fresh transfer.  Nothing is sent until [`SenderHandle::start`].
///
/// Returns the handle and the event stream for this transfer.
pub fn spawn_sender(
    // ---
    transfer_id: TransferId,
    channel: Channel,
    source: ByteSourcePtr,
    config: &SenderConfig,
    resume_offset: u64,
) -> Result<(SenderHandle, mpsc::UnboundedReceiver<SenderEvent>)> {
    // ---
    let meta = TransferMetadata::new(
        source.file_name(),
        source.file_size(),
        source.file_type(),
        config.chunk_size,
    )?;
    let session = SenderSession::new(meta, resume_offset);

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(session.state());

    tracing::info!(
        %transfer_id,
        file = source.file_name(),
        size = source.file_size(),
        offset = session.offset(),
        "sender: session created",
    );

    let task = SenderTask {
        transfer_id: transfer_id.clone(),
        session,
        channel,
        source,
        reader: None,
        cmd_rx,
        cmd_open: true,
        event_tx,
        state_tx,
    };
    tokio::spawn(task.run());

    let handle = SenderHandle {
        transfer_id,
        cmd_tx,
        state_rx,
    };
    Ok((handle, event_rx))
}

// ---------------------------------------------------------------------------
// SenderTask
// ---------------------------------------------------------------------------

/// Outcome of one pump step.
enum Pumped {
    Chunk(Bytes),
    Exhausted,
    SourceError(String),
    ChannelClosed,
}

// ---

struct SenderTask {
    // ---
    transfer_id: TransferId,
    session: SenderSession,
    channel: Channel,
    source: ByteSourcePtr,

    /// Open reader positioned at `session.offset()`.  `None` forces a reopen.
    reader: Option<ChunkReader>,

    cmd_rx: mpsc::UnboundedReceiver<SenderInput>,

    /// `false` once every handle has been dropped.
    cmd_open: bool,

    event_tx: mpsc::UnboundedSender<SenderEvent>,
    state_tx: watch::Sender<SenderState>,
}

// ---

impl SenderTask {
    // ---
    async fn run(mut self) {
        // ---
        let transfer_id = self.transfer_id.clone();
        tracing::debug!(%transfer_id, "sender: task starting");

        while !self.session.state().is_terminal() {
            // ---
            let want = self.session.wants_chunk();
            let offset = self.session.offset();
            let len = if want { self.session.next_chunk_len() } else { 0 };

            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv(), if self.cmd_open => match cmd {
                    Some(input) => self.apply(input),
                    None => {
                        tracing::debug!(%transfer_id, "sender: all handles dropped");
                        self.cmd_open = false;
                    }
                },

                msg = self.channel.rx.recv() => match msg {
                    Some(msg) => match Frame::decode(msg) {
                        Ok(frame) => self.apply(SenderInput::Frame(frame)),
                        Err(e) => tracing::warn!(%transfer_id, "sender: malformed frame ignored: {e}"),
                    },
                    None => self.apply(SenderInput::ChannelClosed),
                },

                pumped = pump(&*self.channel.tx, &mut self.source, &mut self.reader, offset, len), if want => {
                    match pumped {
                        Pumped::Chunk(bytes) => self.apply(SenderInput::ChunkRead(bytes)),
                        Pumped::Exhausted => self.apply(SenderInput::SourceExhausted),
                        Pumped::SourceError(reason) => self.apply(SenderInput::SourceFailed(reason)),
                        Pumped::ChannelClosed => self.apply(SenderInput::ChannelClosed),
                    }
                }
            }
        }

        tracing::info!(
            %transfer_id,
            state = ?self.session.state(),
            offset = self.session.offset(),
            "sender: task exit",
        );
    }

    // ---

    /// Feed `input` to the session and carry out every resulting effect.
    /// Follow-up inputs (`ChunkAccepted`, `ChannelClosed`) are queued behind
    /// the current batch.
    fn apply(&mut self, input: SenderInput) {
        // ---
        let mut queue = VecDeque::from([input]);

        while let Some(input) = queue.pop_front() {
            for effect in self.session.handle(input) {
                match effect {
                    SenderEffect::Send(frame) => {
                        if let Err(e) = self.channel.tx.send(frame.encode()) {
                            tracing::debug!(transfer_id = %self.transfer_id, header = ?frame.header, "sender: send failed: {e}");
                            queue.push_back(SenderInput::ChannelClosed);
                        }
                    }
                    SenderEffect::SendChunk(frame) => match self.channel.tx.send(frame.encode()) {
                        Ok(()) => queue.push_back(SenderInput::ChunkAccepted),
                        Err(e) => {
                            tracing::debug!(transfer_id = %self.transfer_id, "sender: chunk send failed: {e}");
                            queue.push_back(SenderInput::ChannelClosed);
                        }
                    },
                    SenderEffect::OpenSource(offset) => {
                        tracing::debug!(transfer_id = %self.transfer_id, offset, "sender: reopening source");
                        self.reader = None;
                    }
                    SenderEffect::ReleaseSource => self.reader = None,
                    SenderEffect::Emit(event) => {
                        // Nobody listening is fine; the transfer carries on.
                        let _ = self.event_tx.send(event);
                    }
                }
            }
        }

        self.state_tx.send_replace(self.session.state());
    }
}

// ---

/// Wait for channel capacity, then read exactly `len` bytes at `offset`.
///
/// The reader is taken out of `slot` for the duration of the read and only
/// put back once the read completes.
async fn pump(
    // ---
    tx: &dyn ChannelTx,
    source: &mut ByteSourcePtr,
    slot: &mut Option<ChunkReader>,
    offset: u64,
    len: u64,
) -> Pumped {
    // ---
    if tx.ready().await.is_err() {
        return Pumped::ChannelClosed;
    }

    let mut reader = match slot.take() {
        Some(reader) => reader,
        None => match source.open_at(offset).await {
            Ok(reader) => reader,
            Err(e) => return Pumped::SourceError(format!("open at {offset}: {e}")),
        },
    };

    let Ok(len) = usize::try_from(len) else {
        return Pumped::SourceError(format!("chunk length {len} too large"));
    };
    let mut buf = vec![0u8; len];
    match reader.read_exact(&mut buf).await {
        Ok(_) => {
            *slot = Some(reader);
            Pumped::Chunk(Bytes::from(buf))
        }
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Pumped::Exhausted,
        Err(e) => Pumped::SourceError(format!("read at {offset}: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
