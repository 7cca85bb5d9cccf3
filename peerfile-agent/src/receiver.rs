//! [`ReceiverSession`] — the receiver half of the transfer protocol as a pure
//! state machine.
//!
//! Like the sender, the session performs no I/O: the driver in
//! `receiver_task` feeds it frames and API commands and carries out the
//! returned [`ReceiverEffect`]s against the channel and the byte sink.
//!
//! A receiver session outlives its channel.  When the channel closes the
//! session keeps `chunks_received` and waits; the multiplexer attaches a
//! replacement and the new sender resumes from that count.

use std::collections::VecDeque;

// ---

use bytes::Bytes;

// ---

use peerfile_domain::{
    // ---
    ControlHeader,
    Frame,
    Initiator,
    ReceiverEvent,
    TransferMetadata,
    TransferProgress,
};

// ---

use super::ReceiverConfig;

// ---------------------------------------------------------------------------
// ReceiverState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    // ---
    /// No `FILE_START` accepted yet.
    WaitingStart,

    Receiving,

    /// Locally paused.  Incoming chunks are parked, not applied.
    Paused,

    Cancelled,

    /// Every declared byte arrived.
    Done,
}

// ---

impl ReceiverState {
    // ---
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Done)
    }
}

// ---------------------------------------------------------------------------
// ReceiverInput / ReceiverEffect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverInput {
    // --- API
    Pause,
    Resume,
    Cancel,

    // --- channel
    Frame(Frame),

    /// The current channel closed.
    ChannelClosed,

    /// A replacement channel was attached.
    Reattached,
}

// ---

#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEffect {
    // ---
    /// Encode and send a control frame.  Dropped if no channel is attached.
    Send(Frame),

    /// Append bytes to the sink.
    Append(Bytes),

    /// All bytes are in; finalize the sink and emit `Done`.
    Finalize(TransferMetadata),

    /// Throw away everything appended so far.
    Discard,

    Emit(ReceiverEvent),
}

// ---------------------------------------------------------------------------
// ReceiverSession
// ---------------------------------------------------------------------------

/// Receiver-side transfer state.
///
/// Invariants: `bytes_received` never decreases within one accumulation and
/// never exceeds `file_size`; completion fires once.
#[derive(Debug)]
pub struct ReceiverSession {
    // ---
    state: ReceiverState,
    config: ReceiverConfig,

    /// Set by the first accepted `FILE_START`.
    meta: Option<TransferMetadata>,

    bytes_received: u64,
    chunks_received: u64,

    /// Chunks that arrived while locally paused, in arrival order.
    parked: VecDeque<Bytes>,

    /// A second `FILE_START` restarts accumulation while this is set.
    allow_restart: bool,

    progress_mark: Option<f64>,
}

// ---

impl ReceiverSession {
    // ---
    pub fn new(config: ReceiverConfig) -> Self {
        // ---
        let allow_restart = config.allow_restart;
        Self {
            state: ReceiverState::WaitingStart,
            config,
            meta: None,
            bytes_received: 0,
            chunks_received: 0,
            parked: VecDeque::new(),
            allow_restart,
            progress_mark: None,
        }
    }

    // ---

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn metadata(&self) -> Option<&TransferMetadata> {
        self.meta.as_ref()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn chunks_received(&self) -> u64 {
        self.chunks_received
    }

    pub fn parked_chunks(&self) -> usize {
        self.parked.len()
    }

    /// `false` while paused with a full park queue.  The driver stops reading
    /// the channel until [`ReceiverInput::Resume`], which leaves further
    /// chunks queued in the channel instead of dropping them.
    pub fn wants_frame(&self) -> bool {
        self.state != ReceiverState::Paused || self.parked.len() < self.config.max_parked_chunks
    }

    // ---

    /// Apply one input and return the effects to perform, in order.
    pub fn handle(&mut self, input: ReceiverInput) -> Vec<ReceiverEffect> {
        // ---
        let mut fx = Vec::new();

        if self.state.is_terminal() {
            tracing::debug!(state = ?self.state, ?input, "receiver: input after terminal state ignored");
            return fx;
        }

        match input {
            ReceiverInput::Pause => self.on_local_pause(&mut fx),
            ReceiverInput::Resume => self.on_local_resume(&mut fx),
            ReceiverInput::Cancel => {
                fx.push(ReceiverEffect::Send(Frame::control(ControlHeader::TransferCancel)));
                self.finish_cancelled(Initiator::Local, &mut fx);
            }
            ReceiverInput::Frame(frame) => self.on_frame(frame, &mut fx),
            ReceiverInput::ChannelClosed => self.on_channel_closed(&mut fx),
            ReceiverInput::Reattached => self.on_reattached(&mut fx),
        }

        fx
    }

    // -----------------------------------------------------------------------
    // API commands
    // -----------------------------------------------------------------------

    fn on_local_pause(&mut self, fx: &mut Vec<ReceiverEffect>) {
        // ---
        if self.state == ReceiverState::Paused {
            return;
        }

        self.state = ReceiverState::Paused;
        fx.push(ReceiverEffect::Send(Frame::control(ControlHeader::TransferPause)));
        fx.push(ReceiverEffect::Emit(ReceiverEvent::Paused(Initiator::Local)));
        tracing::info!(chunks = self.chunks_received, "receiver: paused locally");
    }

    // ---

    fn on_local_resume(&mut self, fx: &mut Vec<ReceiverEffect>) {
        // ---
        if self.state != ReceiverState::Paused {
            tracing::debug!(state = ?self.state, "receiver: resume ignored, not paused");
            return;
        }

        self.state = match self.meta {
            Some(_) => ReceiverState::Receiving,
            None => ReceiverState::WaitingStart,
        };

        while let Some(chunk) = self.parked.pop_front() {
            self.accept_chunk(chunk, fx);
            if self.state == ReceiverState::Done {
                self.parked.clear();
                return;
            }
        }

        fx.push(ReceiverEffect::Send(Frame::count_payload(
            ControlHeader::TransferResume,
            self.chunks_received,
        )));
        fx.push(ReceiverEffect::Emit(ReceiverEvent::Resumed(Initiator::Local)));
        tracing::info!(chunks = self.chunks_received, "receiver: resumed locally");
    }

    // -----------------------------------------------------------------------
    // Channel lifecycle
    // -----------------------------------------------------------------------

    fn on_channel_closed(&mut self, fx: &mut Vec<ReceiverEffect>) {
        // ---
        // Parked chunks came from the old sender.  The next one resumes from
        // `chunks_received` and sends them again.
        self.parked.clear();

        fx.push(ReceiverEffect::Emit(ReceiverEvent::Interrupted {
            bytes_received: self.bytes_received,
            chunks_received: self.chunks_received,
        }));
        tracing::warn!(
            bytes = self.bytes_received,
            chunks = self.chunks_received,
            "receiver: channel closed before completion",
        );
    }

    // ---

    fn on_reattached(&mut self, fx: &mut Vec<ReceiverEffect>) {
        // ---
        self.allow_restart = true;
        fx.push(ReceiverEffect::Emit(ReceiverEvent::Reattached {
            chunks_received: self.chunks_received,
        }));

        if self.state == ReceiverState::Paused {
            fx.push(ReceiverEffect::Send(Frame::control(ControlHeader::TransferPause)));
        }
        tracing::info!(chunks = self.chunks_received, "receiver: channel reattached");
    }

    // -----------------------------------------------------------------------
    // Inbound frames
    // -----------------------------------------------------------------------

    fn on_frame(&mut self, frame: Frame, fx: &mut Vec<ReceiverEffect>) {
        // ---
        match frame.header {
            ControlHeader::FileStart => self.on_file_start(&frame.payload, fx),

            ControlHeader::FileChunk => {
                if self.meta.is_none() {
                    tracing::warn!(len = frame.payload.len(), "receiver: FILE_CHUNK before FILE_START ignored");
                } else if self.state == ReceiverState::Paused {
                    self.park(frame.payload);
                } else {
                    self.accept_chunk(frame.payload, fx);
                }
            }

            ControlHeader::FileEnd => self.on_file_end(fx),

            ControlHeader::TransferPause => {
                fx.push(ReceiverEffect::Emit(ReceiverEvent::Paused(Initiator::Peer)));
                tracing::info!("receiver: sender paused");
            }

            ControlHeader::TransferResume => {
                fx.push(ReceiverEffect::Emit(ReceiverEvent::Resumed(Initiator::Peer)));
                tracing::info!("receiver: sender resumed");
            }

            ControlHeader::TransferCancel => self.finish_cancelled(Initiator::Peer, fx),

            ControlHeader::FileChunkAck => {
                tracing::warn!("receiver: unexpected FILE_CHUNK_ACK from sender ignored");
            }
        }
    }

    // ---

    fn on_file_start(&mut self, payload: &[u8], fx: &mut Vec<ReceiverEffect>) {
        // ---
        let meta = match TransferMetadata::from_payload(payload) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("receiver: FILE_START rejected: {e}");
                return;
            }
        };

        if self.meta.is_some() {
            if !self.allow_restart {
                tracing::warn!(file = %meta.file_name, "receiver: second FILE_START ignored");
                return;
            }
            tracing::info!(
                discarded = self.bytes_received,
                "receiver: FILE_START on reattached channel, restarting",
            );
            fx.push(ReceiverEffect::Discard);
            self.parked.clear();
        }

        self.allow_restart = false;
        self.bytes_received = 0;
        self.chunks_received = 0;
        self.progress_mark = None;
        if self.state == ReceiverState::WaitingStart {
            self.state = ReceiverState::Receiving;
        }

        tracing::info!(
            file = %meta.file_name,
            size = meta.file_size,
            chunk_size = meta.chunk_size,
            chunks = meta.chunks_total,
            "receiver: FILE_START accepted",
        );

        let file_size = meta.file_size;
        self.meta = Some(meta.clone());
        fx.push(ReceiverEffect::Emit(ReceiverEvent::Started(meta)));

        if file_size == 0 {
            self.complete(fx);
            return;
        }
        self.push_progress(fx);
    }

    // ---

    fn on_file_end(&mut self, fx: &mut Vec<ReceiverEffect>) {
        // ---
        let Some(file_size) = self.meta.as_ref().map(|m| m.file_size) else {
            tracing::warn!("receiver: FILE_END before FILE_START ignored");
            return;
        };

        let pending: u64 = self.parked.iter().map(|c| c.len() as u64).sum();
        if self.bytes_received + pending >= file_size {
            tracing::debug!(pending, "receiver: FILE_END while paused, completes on resume");
            return;
        }

        tracing::warn!(
            bytes = self.bytes_received,
            file_size,
            "receiver: FILE_END before every byte arrived",
        );
        fx.push(ReceiverEffect::Emit(ReceiverEvent::Incomplete {
            bytes_received: self.bytes_received,
            file_size,
        }));
    }

    // -----------------------------------------------------------------------
    // Chunk handling
    // -----------------------------------------------------------------------

    fn park(&mut self, chunk: Bytes) {
        // ---
        self.parked.push_back(chunk);
        if self.parked.len() >= self.config.max_parked_chunks {
            tracing::debug!(parked = self.parked.len(), "receiver: park queue full, reading stops");
        }
    }

    fn accept_chunk(&mut self, chunk: Bytes, fx: &mut Vec<ReceiverEffect>) {
        // ---
        let Some(meta) = self.meta.as_ref() else {
            return;
        };

        let expected = meta.chunk_len(self.chunks_received);
        let len = chunk.len() as u64;
        if len != expected || self.bytes_received + len > meta.file_size {
            tracing::warn!(
                len,
                expected,
                bytes = self.bytes_received,
                file_size = meta.file_size,
                "receiver: malformed FILE_CHUNK ignored",
            );
            return;
        }

        self.bytes_received += len;
        self.chunks_received += 1;
        fx.push(ReceiverEffect::Append(chunk));
        tracing::debug!(chunks = self.chunks_received, bytes = self.bytes_received, "receiver: chunk");

        if let Some(every) = self.config.ack_interval_chunks.filter(|n| *n > 0) {
            if self.chunks_received % every == 0 {
                fx.push(ReceiverEffect::Send(Frame::count_payload(
                    ControlHeader::FileChunkAck,
                    self.chunks_received,
                )));
            }
        }

        if self.bytes_received == meta.file_size {
            self.complete(fx);
        } else {
            self.push_progress(fx);
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn push_progress(&mut self, fx: &mut Vec<ReceiverEffect>) {
        // ---
        let Some(file_size) = self.meta.as_ref().map(|m| m.file_size) else {
            return;
        };
        let fraction = if file_size == 0 {
            0.0
        } else {
            self.bytes_received as f64 / file_size as f64
        };

        if self.progress_mark.is_some_and(|mark| fraction <= mark) {
            return;
        }
        self.progress_mark = Some(fraction);

        fx.push(ReceiverEffect::Emit(ReceiverEvent::Progress(TransferProgress {
            bytes: self.bytes_received,
            file_size,
            fraction,
        })));
    }

    fn complete(&mut self, fx: &mut Vec<ReceiverEffect>) {
        // ---
        let Some(meta) = self.meta.clone() else {
            return;
        };

        self.state = ReceiverState::Done;
        self.progress_mark = Some(1.0);
        fx.push(ReceiverEffect::Emit(ReceiverEvent::Progress(TransferProgress {
            bytes: meta.file_size,
            file_size: meta.file_size,
            fraction: 1.0,
        })));
        tracing::info!(bytes = meta.file_size, chunks = self.chunks_received, "receiver: complete");
        fx.push(ReceiverEffect::Finalize(meta));
    }

    fn finish_cancelled(&mut self, by: Initiator, fx: &mut Vec<ReceiverEffect>) {
        // ---
        self.state = ReceiverState::Cancelled;
        self.parked.clear();
        fx.push(ReceiverEffect::Discard);
        fx.push(ReceiverEffect::Emit(ReceiverEvent::Cancelled(by)));
        tracing::info!(?by, bytes = self.bytes_received, "receiver: cancelled");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn start_frame(size: u64, chunk: u32) -> Frame {
        // ---
        let meta = TransferMetadata::new("cat.jpg", size, "image/jpeg", chunk).unwrap();
        Frame::new(ControlHeader::FileStart, meta.to_payload().unwrap())
    }

    fn chunk_frame(len: usize, fill: u8) -> ReceiverInput {
        ReceiverInput::Frame(Frame::new(ControlHeader::FileChunk, Bytes::from(vec![fill; len])))
    }

    fn end_frame() -> ReceiverInput {
        ReceiverInput::Frame(Frame::control(ControlHeader::FileEnd))
    }

    fn appended(fx: &[ReceiverEffect]) -> u64 {
        fx.iter()
            .map(|e| match e {
                ReceiverEffect::Append(b) => b.len() as u64,
                _ => 0,
            })
            .sum()
    }

    fn sent(fx: &[ReceiverEffect]) -> Vec<Frame> {
        fx.iter()
            .filter_map(|e| match e {
                ReceiverEffect::Send(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    fn finalized(fx: &[ReceiverEffect]) -> usize {
        fx.iter()
            .filter(|e| matches!(e, ReceiverEffect::Finalize(_)))
            .count()
    }

    // ---

    #[test]
    fn reassembles_90000_bytes_in_11_chunks() {
        // ---
        let mut r = ReceiverSession::new(ReceiverConfig::default());
        r.handle(ReceiverInput::Frame(start_frame(90_000, 8192)));
        assert_eq!(r.state(), ReceiverState::Receiving);

        let mut fx = Vec::new();
        for _ in 0..10 {
            fx.extend(r.handle(chunk_frame(8192, 1)));
        }
        fx.extend(r.handle(chunk_frame(8080, 2)));

        assert_eq!(appended(&fx), 90_000);
        assert_eq!(r.bytes_received(), 90_000);
        assert_eq!(r.chunks_received(), 11);
        assert_eq!(finalized(&fx), 1);
        assert_eq!(r.state(), ReceiverState::Done);

        // A trailing FILE_END is a no-op.
        assert!(r.handle(end_frame()).is_empty());
        assert!(r.handle(end_frame()).is_empty());
    }

    // ---

    #[test]
    fn progress_is_monotonic_and_full_only_at_completion() {
        // ---
        let mut r = ReceiverSession::new(ReceiverConfig::default());
        let mut fx = r.handle(ReceiverInput::Frame(start_frame(3000, 1000)));
        for _ in 0..3 {
            fx.extend(r.handle(chunk_frame(1000, 0)));
        }

        let fractions: Vec<f64> = fx
            .iter()
            .filter_map(|e| match e {
                ReceiverEffect::Emit(ReceiverEvent::Progress(p)) => Some(p.fraction),
                _ => None,
            })
            .collect();
        assert_eq!(fractions.len(), 4);
        assert!(fractions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(fractions[0], 0.0);
        assert_eq!(fractions[3], 1.0);
    }

    // ---

    #[test]
    fn file_end_before_all_bytes_is_incomplete() {
        // ---
        let mut r = ReceiverSession::new(ReceiverConfig::default());
        r.handle(ReceiverInput::Frame(start_frame(3000, 1000)));
        r.handle(chunk_frame(1000, 0));

        let fx = r.handle(end_frame());
        assert_eq!(
            fx,
            vec![ReceiverEffect::Emit(ReceiverEvent::Incomplete {
                bytes_received: 1000,
                file_size: 3000,
            })]
        );
        assert_eq!(r.state(), ReceiverState::Receiving);
    }

    // ---

    #[test]
    fn zero_byte_file_completes_on_start() {
        // ---
        let mut r = ReceiverSession::new(ReceiverConfig::default());
        let fx = r.handle(ReceiverInput::Frame(start_frame(0, 1000)));

        assert_eq!(finalized(&fx), 1);
        assert_eq!(r.state(), ReceiverState::Done);
    }

    // ---

    #[test]
    fn oversized_and_early_chunks_are_ignored() {
        // ---
        let mut r = ReceiverSession::new(ReceiverConfig::default());
        assert!(r.handle(chunk_frame(10, 0)).is_empty());

        r.handle(ReceiverInput::Frame(start_frame(1500, 1000)));
        r.handle(chunk_frame(1000, 0));
        assert!(r.handle(chunk_frame(1000, 0)).is_empty(), "would exceed file size");
        assert_eq!(r.bytes_received(), 1000);
    }

    // ---

    #[test]
    fn second_file_start_ignored_unless_reattached() {
        // ---
        let mut r = ReceiverSession::new(ReceiverConfig::default());
        r.handle(ReceiverInput::Frame(start_frame(3000, 1000)));
        r.handle(chunk_frame(1000, 0));

        assert!(r.handle(ReceiverInput::Frame(start_frame(3000, 1000))).is_empty());
        assert_eq!(r.bytes_received(), 1000);

        r.handle(ReceiverInput::ChannelClosed);
        r.handle(ReceiverInput::Reattached);
        let fx = r.handle(ReceiverInput::Frame(start_frame(3000, 1000)));
        assert_eq!(fx.first(), Some(&ReceiverEffect::Discard));
        assert_eq!(r.bytes_received(), 0);
    }

    // ---

    #[test]
    fn pause_parks_chunks_and_resume_reports_count() {
        // ---
        let mut r = ReceiverSession::new(ReceiverConfig::default());
        r.handle(ReceiverInput::Frame(start_frame(10_000, 1000)));
        r.handle(chunk_frame(1000, 0));

        let fx = r.handle(ReceiverInput::Pause);
        assert_eq!(sent(&fx), vec![Frame::control(ControlHeader::TransferPause)]);

        // In flight when the pause crossed the wire.
        assert!(r.handle(chunk_frame(1000, 0)).is_empty());
        assert_eq!(r.parked_chunks(), 1);
        assert_eq!(r.chunks_received(), 1);

        let fx = r.handle(ReceiverInput::Resume);
        assert_eq!(appended(&fx), 1000);
        assert_eq!(
            sent(&fx),
            vec![Frame::count_payload(ControlHeader::TransferResume, 2)]
        );
        assert_eq!(r.state(), ReceiverState::Receiving);
    }

    // ---

    #[test]
    fn full_park_queue_stops_reading() {
        // ---
        let config = ReceiverConfig {
            max_parked_chunks: 2,
            ..Default::default()
        };
        let mut r = ReceiverSession::new(config);
        r.handle(ReceiverInput::Frame(start_frame(10_000, 1000)));
        r.handle(ReceiverInput::Pause);
        assert!(r.wants_frame());

        r.handle(chunk_frame(1000, 0));
        assert!(r.wants_frame());
        r.handle(chunk_frame(1000, 0));
        assert_eq!(r.parked_chunks(), 2);
        assert!(!r.wants_frame());

        let fx = r.handle(ReceiverInput::Resume);
        assert_eq!(appended(&fx), 2000);
        assert_eq!(
            sent(&fx),
            vec![Frame::count_payload(ControlHeader::TransferResume, 2)]
        );
        assert!(r.wants_frame());
    }

    // ---

    #[test]
    fn close_drops_parked_chunks_and_reattach_repauses() {
        // ---
        let mut r = ReceiverSession::new(ReceiverConfig::default());
        r.handle(ReceiverInput::Frame(start_frame(10_000, 1000)));
        r.handle(chunk_frame(1000, 0));
        r.handle(ReceiverInput::Pause);
        r.handle(chunk_frame(1000, 0));

        let fx = r.handle(ReceiverInput::ChannelClosed);
        assert_eq!(
            fx,
            vec![ReceiverEffect::Emit(ReceiverEvent::Interrupted {
                bytes_received: 1000,
                chunks_received: 1,
            })]
        );
        assert_eq!(r.parked_chunks(), 0);

        let fx = r.handle(ReceiverInput::Reattached);
        assert_eq!(sent(&fx), vec![Frame::control(ControlHeader::TransferPause)]);
    }

    // ---

    #[test]
    fn cancel_discards_and_ignores_later_frames() {
        // ---
        let mut r = ReceiverSession::new(ReceiverConfig::default());
        r.handle(ReceiverInput::Frame(start_frame(10_000, 1000)));
        r.handle(chunk_frame(1000, 0));

        let fx = r.handle(ReceiverInput::Cancel);
        assert_eq!(sent(&fx), vec![Frame::control(ControlHeader::TransferCancel)]);
        assert!(fx.contains(&ReceiverEffect::Discard));
        assert_eq!(r.state(), ReceiverState::Cancelled);

        assert!(r.handle(chunk_frame(1000, 0)).is_empty());
    }

    // ---

    #[test]
    fn peer_cancel_is_not_answered() {
        // ---
        let mut r = ReceiverSession::new(ReceiverConfig::default());
        r.handle(ReceiverInput::Frame(start_frame(10_000, 1000)));

        let fx = r.handle(ReceiverInput::Frame(Frame::control(ControlHeader::TransferCancel)));
        assert!(sent(&fx).is_empty());
        assert!(fx.contains(&ReceiverEffect::Emit(ReceiverEvent::Cancelled(Initiator::Peer))));
    }

    // ---

    #[test]
    fn acks_every_n_chunks() {
        // ---
        let config = ReceiverConfig {
            ack_interval_chunks: Some(2),
            ..Default::default()
        };
        let mut r = ReceiverSession::new(config);
        r.handle(ReceiverInput::Frame(start_frame(10_000, 1000)));

        assert!(sent(&r.handle(chunk_frame(1000, 0))).is_empty());
        assert_eq!(
            sent(&r.handle(chunk_frame(1000, 0))),
            vec![Frame::count_payload(ControlHeader::FileChunkAck, 2)]
        );
    }

    // ---

    #[test]
    fn bad_metadata_leaves_session_waiting() {
        // ---
        let mut r = ReceiverSession::new(ReceiverConfig::default());
        let fx = r.handle(ReceiverInput::Frame(Frame::new(
            ControlHeader::FileStart,
            Bytes::from_static(b"{\"fileName\":\"x\"}"),
        )));
        assert!(fx.is_empty());
        assert_eq!(r.state(), ReceiverState::WaitingStart);
    }
}
