//! [`ReceiverTask`] — async driver for one [`ReceiverSession`].
//!
//! Unlike the sender, a receiver task survives the loss of its channel.  When
//! `recv` returns `None` the session records the interruption and the task
//! idles until a replacement arrives through [`ReceiverHandle::attach`]
//! (normally called by the [`crate::TransferMux`]).  The replacement is
//! swapped in inside the task, so the chunk count in the returned
//! [`ResumeOffer`] can never race with a chunk still arriving on the old
//! channel.

use std::collections::VecDeque;

// ---

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

// ---

use peerfile_domain::{
    // ---
    ByteSinkPtr,
    Channel,
    Frame,
    PeerFileError,
    ReceiverEvent,
    Result,
    TransferId,
};

// ---

use super::{ReceiverConfig, ReceiverEffect, ReceiverInput, ReceiverSession, ReceiverState, ResumeOffer};

// ---------------------------------------------------------------------------
// ReceiverStatus
// ---------------------------------------------------------------------------

/// Snapshot published by the task after every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverStatus {
    // ---
    pub state: ReceiverState,
    pub bytes_received: u64,
    pub chunks_received: u64,

    /// `false` between a channel loss and the next attach.
    pub attached: bool,
}

// ---------------------------------------------------------------------------
// ChannelSwap
// ---------------------------------------------------------------------------

/// Channel management requests, answered with the offer computed after the
/// swap.
enum ChannelSwap {
    // ---
    Attach {
        channel: Channel,
        reply: oneshot::Sender<ResumeOffer>,
    },

    Detach {
        reply: oneshot::Sender<ResumeOffer>,
    },
}

// ---------------------------------------------------------------------------
// ReceiverHandle
// ---------------------------------------------------------------------------

/// Cheap-clone handle to a running [`ReceiverTask`].
#[derive(Clone)]
pub struct ReceiverHandle {
    // ---
    transfer_id: TransferId,
    cmd_tx: mpsc::UnboundedSender<ReceiverInput>,
    swap_tx: mpsc::UnboundedSender<ChannelSwap>,
    status_rx: watch::Receiver<ReceiverStatus>,
}

// ---

impl ReceiverHandle {
    // ---
    pub fn transfer_id(&self) -> &TransferId {
        &self.transfer_id
    }

    pub fn pause(&self) {
        self.command(ReceiverInput::Pause);
    }

    pub fn resume(&self) {
        self.command(ReceiverInput::Resume);
    }

    pub fn cancel(&self) {
        self.command(ReceiverInput::Cancel);
    }

    pub fn status(&self) -> ReceiverStatus {
        *self.status_rx.borrow()
    }

    /// `true` when both handles drive the same task.
    pub fn same_session(&self, other: &ReceiverHandle) -> bool {
        self.cmd_tx.same_channel(&other.cmd_tx)
    }

    // ---

    /// Wait until the session reaches `Done` or `Cancelled`, or the task
    /// gives up because no channel can ever be attached again.
    pub async fn finished(&self) -> ReceiverState {
        // ---
        let mut rx = self.status_rx.clone();
        let result = rx.wait_for(|s| s.state.is_terminal()).await.map(|s| s.state);
        match result {
            Ok(state) => state,
            Err(_) => rx.borrow().state,
        }
    }

    // ---

    /// Hand a replacement channel to the session.  Any channel still attached
    /// is destroyed first.
    ///
    /// Returns the offer the new sender must resume from.
    pub async fn attach(&self, channel: Channel) -> Result<ResumeOffer> {
        // ---
        let (reply, rx) = oneshot::channel();
        self.swap(ChannelSwap::Attach { channel, reply }, rx).await
    }

    /// Drop the current channel, if any, and report what the session holds.
    ///
    /// The count is frozen until the next [`attach`](Self::attach), which
    /// makes it safe to send the offer over the signaling path first.
    pub async fn detach(&self) -> Result<ResumeOffer> {
        // ---
        let (reply, rx) = oneshot::channel();
        self.swap(ChannelSwap::Detach { reply }, rx).await
    }

    // ---

    async fn swap(&self, msg: ChannelSwap, rx: oneshot::Receiver<ResumeOffer>) -> Result<ResumeOffer> {
        // ---
        let gone = || PeerFileError::TransferNotFound(self.transfer_id.to_string());
        self.swap_tx.send(msg).map_err(|_| gone())?;
        rx.await.map_err(|_| gone())
    }

    fn command(&self, input: ReceiverInput) {
        // ---
        if self.cmd_tx.send(input).is_err() {
            tracing::debug!(transfer_id = %self.transfer_id, "receiver: task exited, command dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// spawn_receiver
// ---------------------------------------------------------------------------

/// Spawn a receiver session on `channel`, writing into `sink`.
///
/// Returns the handle and the event stream for this transfer.
pub fn spawn_receiver(
    // ---
    transfer_id: TransferId,
    channel: Channel,
    sink: ByteSinkPtr,
    config: ReceiverConfig,
) -> (ReceiverHandle, mpsc::UnboundedReceiver<ReceiverEvent>) {
    // ---
    let (task, handle, events) = ReceiverTask::new(transfer_id, channel, sink, config);
    tokio::spawn(task.run());
    (handle, events)
}

// ---------------------------------------------------------------------------
// ReceiverTask
// ---------------------------------------------------------------------------

pub(crate) struct ReceiverTask {
    // ---
    transfer_id: TransferId,
    session: ReceiverSession,
    channel: Option<Channel>,
    sink: ByteSinkPtr,

    /// Set after a sink error; no further bytes are written.
    sink_broken: bool,

    cmd_rx: mpsc::UnboundedReceiver<ReceiverInput>,
    cmd_open: bool,

    swap_rx: mpsc::UnboundedReceiver<ChannelSwap>,
    swap_open: bool,

    event_tx: mpsc::UnboundedSender<ReceiverEvent>,
    status_tx: watch::Sender<ReceiverStatus>,
}

// ---

impl ReceiverTask {
    // ---
    pub(crate) fn new(
        transfer_id: TransferId,
        channel: Channel,
        sink: ByteSinkPtr,
        config: ReceiverConfig,
    ) -> (Self, ReceiverHandle, mpsc::UnboundedReceiver<ReceiverEvent>) {
        // ---
        let session = ReceiverSession::new(config);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (swap_tx, swap_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ReceiverStatus {
            state: session.state(),
            bytes_received: 0,
            chunks_received: 0,
            attached: true,
        });

        let task = Self {
            transfer_id: transfer_id.clone(),
            session,
            channel: Some(channel),
            sink,
            sink_broken: false,
            cmd_rx,
            cmd_open: true,
            swap_rx,
            swap_open: true,
            event_tx,
            status_tx,
        };

        let handle = ReceiverHandle {
            transfer_id,
            cmd_tx,
            swap_tx,
            status_rx,
        };

        (task, handle, event_rx)
    }

    // ---

    pub(crate) async fn run(mut self) -> ReceiverState {
        // ---
        let transfer_id = self.transfer_id.clone();
        tracing::debug!(%transfer_id, "receiver: task starting");

        while !self.session.state().is_terminal() {
            // ---
            if self.channel.is_none() && !self.swap_open {
                tracing::warn!(%transfer_id, "receiver: channel lost and nobody can reattach, giving up");
                break;
            }
            if !self.session.wants_frame() && !self.cmd_open {
                tracing::warn!(%transfer_id, "receiver: paused with a full park queue and no handle left, giving up");
                break;
            }

            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv(), if self.cmd_open => match cmd {
                    Some(input) => self.apply(input).await,
                    None => self.cmd_open = false,
                },

                swap = self.swap_rx.recv(), if self.swap_open => match swap {
                    Some(ChannelSwap::Attach { channel, reply }) => {
                        self.drop_channel().await;
                        self.channel = Some(channel);
                        self.apply(ReceiverInput::Reattached).await;
                        let _ = reply.send(self.offer());
                    }
                    Some(ChannelSwap::Detach { reply }) => {
                        self.drop_channel().await;
                        let _ = reply.send(self.offer());
                    }
                    None => self.swap_open = false,
                },

                msg = next_message(&mut self.channel, self.session.wants_frame()) => match msg {
                    Some(msg) => match Frame::decode(msg) {
                        Ok(frame) => self.apply(ReceiverInput::Frame(frame)).await,
                        Err(e) => tracing::warn!(%transfer_id, "receiver: malformed frame ignored: {e}"),
                    },
                    None => {
                        self.channel = None;
                        self.apply(ReceiverInput::ChannelClosed).await;
                    }
                },
            }
        }

        let state = self.session.state();
        tracing::info!(
            %transfer_id,
            ?state,
            bytes = self.session.bytes_received(),
            "receiver: task exit",
        );
        state
    }

    // ---

    /// Offer reflecting what the session holds right now.
    fn offer(&self) -> ResumeOffer {
        // ---
        ResumeOffer {
            transfer_id: self.transfer_id.clone(),
            chunks_received: self.session.chunks_received(),
            chunk_size: self.session.metadata().map(|m| m.chunk_size),
        }
    }

    /// Destroy the attached channel, if any, and tell the session.
    async fn drop_channel(&mut self) {
        // ---
        if let Some(old) = self.channel.take() {
            tracing::info!(transfer_id = %self.transfer_id, "receiver: dropping current channel");
            old.tx.destroy().await;
            self.apply(ReceiverInput::ChannelClosed).await;
        }
    }

    // ---

    async fn apply(&mut self, input: ReceiverInput) {
        // ---
        let mut queue = VecDeque::from([input]);

        while let Some(input) = queue.pop_front() {
            for effect in self.session.handle(input) {
                match effect {
                    ReceiverEffect::Send(frame) => self.send(frame),

                    ReceiverEffect::Append(bytes) => {
                        if self.sink_broken {
                            continue;
                        }
                        if let Err(e) = self.sink.append(bytes).await {
                            self.sink_error(e, &mut queue);
                        }
                    }

                    ReceiverEffect::Finalize(meta) => {
                        if self.sink_broken {
                            continue;
                        }
                        match self.sink.finalize(&meta).await {
                            Ok(file) => self.emit(ReceiverEvent::Done(file)),
                            Err(e) => {
                                tracing::error!(transfer_id = %self.transfer_id, "receiver: finalize failed: {e}");
                                self.emit(ReceiverEvent::Failed { reason: e.to_string() });
                            }
                        }
                    }

                    ReceiverEffect::Discard => {
                        if let Err(e) = self.sink.discard().await {
                            tracing::warn!(transfer_id = %self.transfer_id, "receiver: discard failed: {e}");
                        }
                        self.sink_broken = false;
                    }

                    ReceiverEffect::Emit(event) => self.emit(event),
                }
            }
        }

        self.status_tx.send_replace(ReceiverStatus {
            state: self.session.state(),
            bytes_received: self.session.bytes_received(),
            chunks_received: self.session.chunks_received(),
            attached: self.channel.is_some(),
        });
    }

    // ---

    fn send(&self, frame: Frame) {
        // ---
        let Some(channel) = self.channel.as_ref() else {
            tracing::debug!(transfer_id = %self.transfer_id, header = ?frame.header, "receiver: no channel, frame dropped");
            return;
        };
        if let Err(e) = channel.tx.send(frame.encode()) {
            tracing::debug!(transfer_id = %self.transfer_id, header = ?frame.header, "receiver: send failed: {e}");
        }
    }

    fn emit(&self, event: ReceiverEvent) {
        let _ = self.event_tx.send(event);
    }

    /// A sink that cannot store bytes ends the transfer: report it, then
    /// cancel so the sender stops.
    fn sink_error(&mut self, e: PeerFileError, queue: &mut VecDeque<ReceiverInput>) {
        // ---
        tracing::error!(transfer_id = %self.transfer_id, "receiver: sink write failed: {e}");
        self.sink_broken = true;
        self.emit(ReceiverEvent::Failed { reason: e.to_string() });
        queue.push_back(ReceiverInput::Cancel);
    }
}

// ---

/// Next message from the attached channel.  Pends forever while detached or
/// while the session is not taking frames.
async fn next_message(channel: &mut Option<Channel>, wanted: bool) -> Option<Bytes> {
    // ---
    match channel.as_mut() {
        Some(channel) if wanted => channel.rx.recv().await,
        _ => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use async_trait::async_trait;

    use peerfile_domain::{
        ByteSink, ControlHeader, FileContent, ReceivedFile, TransferMetadata,
    };
    use peerfile_link_sim::{LinkSimConfig, LinkSimTransport};

    use super::*;
    use crate::MemorySink;

    fn start_msg(size: u64, chunk: u32) -> Bytes {
        // ---
        let meta = TransferMetadata::new("f.bin", size, "", chunk).unwrap();
        Frame::new(ControlHeader::FileStart, meta.to_payload().unwrap()).encode()
    }

    fn chunk_msg(data: &'static [u8]) -> Bytes {
        Frame::new(ControlHeader::FileChunk, Bytes::from_static(data)).encode()
    }

    // ---

    #[tokio::test]
    async fn writes_sink_and_reports_done() {
        // ---
        let pair = LinkSimTransport::new(LinkSimConfig::perfect()).connected_pair();
        let (handle, mut events) =
            spawn_receiver("r".into(), pair.b, Box::new(MemorySink::new()), ReceiverConfig::default());

        pair.a.tx.send(start_msg(6, 4)).unwrap();
        pair.a.tx.send(chunk_msg(b"abcd")).unwrap();
        pair.a.tx.send(chunk_msg(b"ef")).unwrap();
        pair.a.tx.send(Frame::control(ControlHeader::FileEnd).encode()).unwrap();

        assert_eq!(handle.finished().await, ReceiverState::Done);

        let mut done = None;
        while let Some(ev) = events.recv().await {
            if let ReceiverEvent::Done(file) = ev {
                done = Some(file);
            }
        }
        let file = done.expect("done event");
        assert_eq!(file.content, FileContent::Memory(Bytes::from_static(b"abcdef")));
    }

    // ---

    #[tokio::test]
    async fn survives_channel_loss_and_offers_count_on_attach() {
        // ---
        let transport = LinkSimTransport::new(LinkSimConfig::perfect());
        let first = transport.connected_pair();
        let (handle, _events) =
            spawn_receiver("r".into(), first.b, Box::new(MemorySink::new()), ReceiverConfig::default());

        first.a.tx.send(start_msg(12, 4)).unwrap();
        first.a.tx.send(chunk_msg(b"abcd")).unwrap();

        let mut status = handle.status_rx.clone();
        status.wait_for(|s| s.chunks_received == 1).await.unwrap();
        first.control.disconnect();

        let s = *status.wait_for(|s| !s.attached).await.unwrap();
        assert_eq!(s.chunks_received, 1);
        assert_eq!(s.state, ReceiverState::Receiving);

        let second = transport.connected_pair();
        let offer = handle.attach(second.b).await.unwrap();
        assert_eq!(offer.chunks_received, 1);
        assert_eq!(offer.chunk_size, Some(4));
        assert!(handle.status().attached);
    }

    // ---

    #[tokio::test]
    async fn full_park_queue_leaves_chunks_in_channel() {
        // ---
        let pair = LinkSimTransport::new(LinkSimConfig::perfect()).connected_pair();
        let config = ReceiverConfig {
            max_parked_chunks: 1,
            ..Default::default()
        };
        let (handle, mut events) = spawn_receiver("r".into(), pair.b, Box::new(MemorySink::new()), config);

        pair.a.tx.send(start_msg(12, 4)).unwrap();
        let mut status = handle.status_rx.clone();
        status.wait_for(|s| s.state == ReceiverState::Receiving).await.unwrap();

        handle.pause();
        status.wait_for(|s| s.state == ReceiverState::Paused).await.unwrap();

        pair.a.tx.send(chunk_msg(b"abcd")).unwrap();
        pair.a.tx.send(chunk_msg(b"efgh")).unwrap();
        pair.a.tx.send(chunk_msg(b"ijkl")).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(handle.status().bytes_received, 0);

        handle.resume();
        assert_eq!(handle.finished().await, ReceiverState::Done);

        let mut done = None;
        while let Some(ev) = events.recv().await {
            if let ReceiverEvent::Done(file) = ev {
                done = Some(file);
            }
        }
        let file = done.expect("done event");
        assert_eq!(file.content, FileContent::Memory(Bytes::from_static(b"abcdefghijkl")));
    }

    // ---

    struct FullDisk;

    #[async_trait]
    impl ByteSink for FullDisk {
        async fn append(&mut self, _bytes: Bytes) -> Result<()> {
            Err(PeerFileError::Io(std::io::Error::other("disk full")))
        }
        async fn finalize(&mut self, _m: &TransferMetadata) -> Result<ReceivedFile> {
            Err(PeerFileError::Transport("unreachable".into()))
        }
        async fn discard(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn sink_failure_cancels_sender() {
        // ---
        let mut pair = LinkSimTransport::new(LinkSimConfig::perfect()).connected_pair();
        let (handle, _events) =
            spawn_receiver("r".into(), pair.b, Box::new(FullDisk), ReceiverConfig::default());

        pair.a.tx.send(start_msg(8, 4)).unwrap();
        pair.a.tx.send(chunk_msg(b"abcd")).unwrap();

        assert_eq!(handle.finished().await, ReceiverState::Cancelled);
        let frame = Frame::decode(pair.a.rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame.header, ControlHeader::TransferCancel);
    }
}
