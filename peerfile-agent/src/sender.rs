//! [`SenderSession`] — the sender half of the transfer protocol as a pure
//! state machine.
//!
//! The session never touches a channel or a file.  [`SenderSession::handle`]
//! takes one [`SenderInput`] (an API command, an inbound frame, or a driver
//! completion) and returns the [`SenderEffect`]s the driver must perform, in
//! order.  The async driver lives in `sender_task`.
//!
//! # Chunk flow
//!
//! ```text
//!   driver                                  session
//!   ------                                  -------
//!   wants_chunk()? ──────────────────────▶  Starting | Sending, nothing in flight
//!   read next_chunk_len() bytes
//!   ChunkRead(bytes) ────────────────────▶  SendChunk(FILE_CHUNK)
//!   channel.send(..)
//!   ChunkAccepted ───────────────────────▶  offset += len, Progress
//! ```
//!
//! `offset` only moves on `ChunkAccepted`, so a chunk that was read but never
//! handed to the channel (pause, cancel) is simply read again after the
//! source is reopened at `offset`.  A peer `TRANSFER_RESUME` never moves
//! `offset` back: chunks the receiver has not counted yet are still on the
//! wire, not lost.

use bytes::Bytes;

// ---

use peerfile_domain::{
    // ---
    ControlHeader,
    Frame,
    Initiator,
    PeerFileError,
    SenderEvent,
    TransferMetadata,
    TransferProgress,
};

// ---------------------------------------------------------------------------
// SenderState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    // ---
    /// Created, `start` not yet called.
    Idle,

    /// Started; no chunk has been read yet.
    Starting,

    Sending,

    /// Emission halted.  Either flag keeps it halted; both must clear.
    Paused { local: bool, peer: bool },

    Cancelled,

    /// `FILE_END` sent.
    Done,

    /// Channel closed or source truncated before completion.
    Failed,
}

// ---

impl SenderState {
    // ---
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Done | Self::Failed)
    }
}

// ---------------------------------------------------------------------------
// SenderInput / SenderEffect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SenderInput {
    // --- API
    Start,
    Pause,
    Resume,
    Cancel,

    // --- channel
    /// A decoded inbound frame.
    Frame(Frame),

    /// The channel closed (`recv` returned `None` or `send` failed).
    ChannelClosed,

    // --- driver completions
    /// `next_chunk_len()` bytes were read from the source at `offset`.
    ChunkRead(Bytes),

    /// The chunk from the last `SendChunk` effect was handed to the channel.
    ChunkAccepted,

    /// The source hit EOF before `next_chunk_len()` bytes were read.
    SourceExhausted,

    /// Opening or reading the source failed.
    SourceFailed(String),
}

// ---

#[derive(Debug, Clone, PartialEq)]
pub enum SenderEffect {
    // ---
    /// Encode and send a control frame.
    Send(Frame),

    /// Encode and send a `FILE_CHUNK`, then feed back
    /// [`SenderInput::ChunkAccepted`] (or `ChannelClosed` on failure).
    SendChunk(Frame),

    /// Drop any open reader and reopen the source at this byte offset.
    /// A read in flight is stale and must be discarded.
    OpenSource(u64),

    /// Drop the reader; nothing more will be read.
    ReleaseSource,

    /// Deliver an event to the application.
    Emit(SenderEvent),
}

// ---------------------------------------------------------------------------
// SenderSession
// ---------------------------------------------------------------------------

/// Sender-side transfer state.
///
/// Invariant: `0 <= offset <= file_size`, and `offset` is always a chunk
/// boundary (`chunks_sent * chunk_size`, clamped to `file_size`).
#[derive(Debug)]
pub struct SenderSession {
    // ---
    state: SenderState,
    meta: TransferMetadata,

    /// Bytes confirmed handed to the channel.
    offset: u64,
    chunks_sent: u64,

    /// Length of the chunk between `SendChunk` and `ChunkAccepted`.
    in_flight: Option<u64>,

    /// Highest progress fraction reported so far.
    progress_mark: Option<f64>,

    /// Last count from the receiver's `FILE_CHUNK_ACK`.
    peer_acked_chunks: Option<u64>,

    /// `TRANSFER_PAUSE` seen before [`SenderInput::Start`].
    peer_paused_before_start: bool,
}

// ---

impl SenderSession {
    // ---
    /// Create a session that will start at `resume_offset` bytes.
    ///
    /// The offset is rounded down to a chunk boundary and clamped to the file
    /// size.  A non-zero offset means the receiver already holds the metadata
    /// and `FILE_START` is skipped.
    pub fn new(meta: TransferMetadata, resume_offset: u64) -> Self {
        // ---
        let mut session = Self {
            state: SenderState::Idle,
            meta,
            offset: 0,
            chunks_sent: 0,
            in_flight: None,
            progress_mark: None,
            peer_acked_chunks: None,
            peer_paused_before_start: false,
        };
        let chunks = resume_offset / session.chunk_size();
        session.seek_to_chunk(chunks);
        session
    }

    // ---

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn metadata(&self) -> &TransferMetadata {
        &self.meta
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent
    }

    pub fn peer_acked_chunks(&self) -> Option<u64> {
        self.peer_acked_chunks
    }

    // ---

    /// `true` when the driver should read the next chunk.
    pub fn wants_chunk(&self) -> bool {
        // ---
        matches!(self.state, SenderState::Starting | SenderState::Sending)
            && self.in_flight.is_none()
            && self.offset < self.meta.file_size
    }

    /// Bytes the driver must read for the next chunk.
    pub fn next_chunk_len(&self) -> u64 {
        (self.meta.file_size - self.offset).min(self.chunk_size())
    }

    // ---

    /// Apply one input and return the effects to perform, in order.
    pub fn handle(&mut self, input: SenderInput) -> Vec<SenderEffect> {
        // ---
        let mut fx = Vec::new();

        if self.state.is_terminal() {
            tracing::debug!(state = ?self.state, ?input, "sender: input after terminal state ignored");
            return fx;
        }

        match input {
            SenderInput::Start => self.on_start(&mut fx),
            SenderInput::Pause => self.on_local_pause(&mut fx),
            SenderInput::Resume => self.on_local_resume(&mut fx),
            SenderInput::Cancel => {
                fx.push(SenderEffect::Send(Frame::control(ControlHeader::TransferCancel)));
                self.finish_cancelled(Initiator::Local, &mut fx);
            }
            SenderInput::Frame(frame) => self.on_frame(frame, &mut fx),
            SenderInput::ChannelClosed => {
                self.fail(PeerFileError::ChannelClosed.to_string(), &mut fx);
            }
            SenderInput::ChunkRead(bytes) => self.on_chunk_read(bytes, &mut fx),
            SenderInput::ChunkAccepted => self.on_chunk_accepted(&mut fx),
            SenderInput::SourceExhausted => self.on_source_exhausted(&mut fx),
            SenderInput::SourceFailed(reason) => self.fail(reason, &mut fx),
        }

        fx
    }

    // -----------------------------------------------------------------------
    // API commands
    // -----------------------------------------------------------------------

    fn on_start(&mut self, fx: &mut Vec<SenderEffect>) {
        // ---
        if self.state != SenderState::Idle {
            tracing::debug!(state = ?self.state, "sender: start ignored, already started");
            return;
        }

        if self.offset == 0 {
            match self.meta.to_payload() {
                Ok(payload) => {
                    fx.push(SenderEffect::Send(Frame::new(ControlHeader::FileStart, payload)));
                }
                Err(e) => {
                    self.fail(e.to_string(), fx);
                    return;
                }
            }
            self.push_progress(0, fx);
        }

        tracing::info!(
            file = %self.meta.file_name,
            size = self.meta.file_size,
            offset = self.offset,
            "sender: starting",
        );

        if self.offset >= self.meta.file_size {
            self.complete(fx);
            return;
        }

        if self.peer_paused_before_start {
            self.state = SenderState::Paused { local: false, peer: true };
            tracing::info!(offset = self.offset, "sender: started, held by peer pause");
            return;
        }

        self.state = SenderState::Starting;
        fx.push(SenderEffect::OpenSource(self.offset));
    }

    // ---

    fn on_local_pause(&mut self, fx: &mut Vec<SenderEffect>) {
        // ---
        let peer = match self.state {
            SenderState::Starting | SenderState::Sending => false,
            SenderState::Paused { local: false, peer } => peer,
            _ => {
                tracing::debug!(state = ?self.state, "sender: pause ignored");
                return;
            }
        };

        self.state = SenderState::Paused { local: true, peer };
        self.in_flight = None;
        fx.push(SenderEffect::Send(Frame::control(ControlHeader::TransferPause)));
        fx.push(SenderEffect::Emit(SenderEvent::Paused(Initiator::Local)));
        tracing::info!(offset = self.offset, "sender: paused locally");
    }

    // ---

    fn on_local_resume(&mut self, fx: &mut Vec<SenderEffect>) {
        // ---
        let SenderState::Paused { local: true, peer } = self.state else {
            tracing::debug!(state = ?self.state, "sender: resume ignored, not locally paused");
            return;
        };

        fx.push(SenderEffect::Send(Frame::count_payload(
            ControlHeader::TransferResume,
            self.chunks_sent,
        )));
        fx.push(SenderEffect::Emit(SenderEvent::Resumed(Initiator::Local)));

        if peer {
            self.state = SenderState::Paused { local: false, peer: true };
            tracing::info!("sender: local pause cleared, peer still paused");
            return;
        }

        tracing::info!(offset = self.offset, "sender: resumed locally");
        self.restart_emission(fx);
    }

    // -----------------------------------------------------------------------
    // Inbound frames
    // -----------------------------------------------------------------------

    fn on_frame(&mut self, frame: Frame, fx: &mut Vec<SenderEffect>) {
        // ---
        match frame.header {
            ControlHeader::TransferPause => self.on_peer_pause(fx),

            ControlHeader::TransferResume => match frame.parse_count() {
                Ok(chunks) => self.on_peer_resume(chunks, fx),
                Err(e) => tracing::warn!("sender: bad TRANSFER_RESUME payload: {e}"),
            },

            ControlHeader::TransferCancel => self.finish_cancelled(Initiator::Peer, fx),

            ControlHeader::FileChunkAck => match frame.parse_count() {
                Ok(chunks) => {
                    tracing::debug!(chunks, "sender: receiver ack");
                    self.peer_acked_chunks = Some(chunks);
                }
                Err(e) => tracing::warn!("sender: bad FILE_CHUNK_ACK payload: {e}"),
            },

            ControlHeader::FileStart | ControlHeader::FileChunk | ControlHeader::FileEnd => {
                tracing::warn!(header = ?frame.header, "sender: unexpected frame from receiver ignored");
            }
        }
    }

    // ---

    fn on_peer_pause(&mut self, fx: &mut Vec<SenderEffect>) {
        // ---
        let local = match self.state {
            SenderState::Idle => {
                self.peer_paused_before_start = true;
                fx.push(SenderEffect::Emit(SenderEvent::Paused(Initiator::Peer)));
                tracing::info!("sender: paused by peer before start");
                return;
            }
            SenderState::Starting | SenderState::Sending => false,
            SenderState::Paused { local, peer: false } => local,
            _ => {
                tracing::debug!(state = ?self.state, "sender: peer pause ignored");
                return;
            }
        };

        self.state = SenderState::Paused { local, peer: true };
        self.in_flight = None;
        fx.push(SenderEffect::Emit(SenderEvent::Paused(Initiator::Peer)));
        tracing::info!(offset = self.offset, "sender: paused by peer");
    }

    // ---

    fn on_peer_resume(&mut self, chunks: u64, fx: &mut Vec<SenderEffect>) {
        // ---
        if self.state == SenderState::Idle {
            // Offer arrived before start: remembered, FILE_START skipped
            // when the offset is past zero.
            self.seek_to_chunk(chunks);
            if std::mem::take(&mut self.peer_paused_before_start) {
                fx.push(SenderEffect::Emit(SenderEvent::Resumed(Initiator::Peer)));
            }
            tracing::info!(chunks, offset = self.offset, "sender: peer resume before start");
            return;
        }

        // The receiver never drops a chunk on a live channel, so chunks
        // still on the wire are not counted yet.  Only move forward.
        if chunks > self.chunks_sent {
            self.seek_to_chunk(chunks);
        }
        self.in_flight = None;
        tracing::info!(chunks, offset = self.offset, "sender: peer resume");

        match self.state {
            SenderState::Paused { local: true, .. } => {
                self.state = SenderState::Paused { local: true, peer: false };
                fx.push(SenderEffect::Emit(SenderEvent::Resumed(Initiator::Peer)));
            }
            _ => {
                fx.push(SenderEffect::Emit(SenderEvent::Resumed(Initiator::Peer)));
                self.restart_emission(fx);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Driver completions
    // -----------------------------------------------------------------------

    fn on_chunk_read(&mut self, bytes: Bytes, fx: &mut Vec<SenderEffect>) {
        // ---
        if !self.wants_chunk() {
            tracing::debug!(state = ?self.state, len = bytes.len(), "sender: stale read discarded");
            return;
        }

        let expected = self.next_chunk_len();
        if bytes.len() as u64 != expected {
            self.fail(
                format!("source produced {} bytes at offset {}, expected {expected}", bytes.len(), self.offset),
                fx,
            );
            return;
        }

        self.state = SenderState::Sending;
        self.in_flight = Some(expected);
        fx.push(SenderEffect::SendChunk(Frame::new(ControlHeader::FileChunk, bytes)));
    }

    // ---

    fn on_chunk_accepted(&mut self, fx: &mut Vec<SenderEffect>) {
        // ---
        let Some(len) = self.in_flight.take() else {
            tracing::debug!("sender: accept with nothing in flight ignored");
            return;
        };

        self.offset += len;
        self.chunks_sent += 1;
        tracing::debug!(chunks = self.chunks_sent, offset = self.offset, "sender: chunk sent");

        if self.offset >= self.meta.file_size {
            self.complete(fx);
            return;
        }

        let sent = (self.chunks_sent * self.chunk_size()).min(self.meta.file_size);
        self.push_progress(sent, fx);
    }

    // ---

    fn on_source_exhausted(&mut self, fx: &mut Vec<SenderEffect>) {
        // ---
        if !matches!(self.state, SenderState::Starting | SenderState::Sending) {
            return;
        }

        if self.offset >= self.meta.file_size {
            self.complete(fx);
            return;
        }

        let err = PeerFileError::SourceTruncated {
            offset: self.offset,
            file_size: self.meta.file_size,
        };
        self.fail(err.to_string(), fx);
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn chunk_size(&self) -> u64 {
        self.meta.chunk_size as u64
    }

    /// Move to chunk boundary `chunks`, clamped to the file.
    fn seek_to_chunk(&mut self, chunks: u64) {
        // ---
        let chunks = chunks.min(self.meta.chunks_total);
        self.chunks_sent = chunks;
        self.offset = chunks.saturating_mul(self.chunk_size()).min(self.meta.file_size);
        self.in_flight = None;
    }

    fn restart_emission(&mut self, fx: &mut Vec<SenderEffect>) {
        // ---
        if self.offset >= self.meta.file_size {
            self.complete(fx);
            return;
        }
        self.state = SenderState::Sending;
        fx.push(SenderEffect::OpenSource(self.offset));
    }

    fn push_progress(&mut self, bytes: u64, fx: &mut Vec<SenderEffect>) {
        // ---
        let size = self.meta.file_size;
        let fraction = if size == 0 { 0.0 } else { bytes as f64 / size as f64 };

        if self.progress_mark.is_some_and(|mark| fraction <= mark) {
            return;
        }
        self.progress_mark = Some(fraction);

        fx.push(SenderEffect::Emit(SenderEvent::Progress(TransferProgress {
            bytes,
            file_size: size,
            fraction,
        })));
    }

    fn complete(&mut self, fx: &mut Vec<SenderEffect>) {
        // ---
        let size = self.meta.file_size;
        self.state = SenderState::Done;
        self.progress_mark = Some(1.0);

        fx.push(SenderEffect::Send(Frame::control(ControlHeader::FileEnd)));
        fx.push(SenderEffect::Emit(SenderEvent::Progress(TransferProgress {
            bytes: size,
            file_size: size,
            fraction: 1.0,
        })));
        fx.push(SenderEffect::ReleaseSource);
        fx.push(SenderEffect::Emit(SenderEvent::Done { bytes_sent: size }));
        tracing::info!(bytes = size, chunks = self.chunks_sent, "sender: done");
    }

    fn finish_cancelled(&mut self, by: Initiator, fx: &mut Vec<SenderEffect>) {
        // ---
        self.state = SenderState::Cancelled;
        self.in_flight = None;
        fx.push(SenderEffect::ReleaseSource);
        fx.push(SenderEffect::Emit(SenderEvent::Cancelled(by)));
        tracing::info!(?by, offset = self.offset, "sender: cancelled");
    }

    fn fail(&mut self, reason: String, fx: &mut Vec<SenderEffect>) {
        // ---
        tracing::warn!(offset = self.offset, %reason, "sender: failed");
        self.state = SenderState::Failed;
        self.in_flight = None;
        fx.push(SenderEffect::ReleaseSource);
        fx.push(SenderEffect::Emit(SenderEvent::Failed {
            offset: self.offset,
            reason,
        }));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn meta(size: u64, chunk: u32) -> TransferMetadata {
        TransferMetadata::new("cat.jpg", size, "image/jpeg", chunk).unwrap()
    }

    // ---

    /// Drive the happy path one chunk at a time, returning what was sent.
    fn pump_one(s: &mut SenderSession) -> Vec<SenderEffect> {
        // ---
        assert!(s.wants_chunk());
        let len = s.next_chunk_len() as usize;
        let fx = s.handle(SenderInput::ChunkRead(Bytes::from(vec![0xAB; len])));
        assert!(matches!(fx.as_slice(), [SenderEffect::SendChunk(_)]));
        s.handle(SenderInput::ChunkAccepted)
    }

    fn sent_frames(fx: &[SenderEffect]) -> Vec<ControlHeader> {
        fx.iter()
            .filter_map(|e| match e {
                SenderEffect::Send(f) | SenderEffect::SendChunk(f) => Some(f.header),
                _ => None,
            })
            .collect()
    }

    fn progress(fx: &[SenderEffect]) -> Vec<f64> {
        fx.iter()
            .filter_map(|e| match e {
                SenderEffect::Emit(SenderEvent::Progress(p)) => Some(p.fraction),
                _ => None,
            })
            .collect()
    }

    // ---

    #[test]
    fn start_from_zero_sends_metadata_then_opens_source() {
        // ---
        let mut s = SenderSession::new(meta(90_000, 8192), 0);
        let fx = s.handle(SenderInput::Start);

        assert_eq!(sent_frames(&fx), vec![ControlHeader::FileStart]);
        assert_eq!(progress(&fx), vec![0.0]);
        assert!(fx.contains(&SenderEffect::OpenSource(0)));
        assert_eq!(s.state(), SenderState::Starting);
    }

    // ---

    #[test]
    fn resumed_start_skips_metadata() {
        // ---
        let mut s = SenderSession::new(meta(90_000, 8192), 3 * 8192);
        let fx = s.handle(SenderInput::Start);

        assert!(sent_frames(&fx).is_empty());
        assert_eq!(fx, vec![SenderEffect::OpenSource(24_576)]);
        assert_eq!(s.chunks_sent(), 3);
    }

    // ---

    #[test]
    fn full_transfer_ends_with_file_end_and_full_progress() {
        // ---
        let mut s = SenderSession::new(meta(90_000, 8192), 0);
        s.handle(SenderInput::Start);

        let mut all = Vec::new();
        while s.wants_chunk() {
            all.extend(pump_one(&mut s));
        }

        assert_eq!(s.state(), SenderState::Done);
        assert_eq!(s.chunks_sent(), 11);
        assert_eq!(s.offset(), 90_000);
        assert_eq!(sent_frames(&all), vec![ControlHeader::FileEnd]);

        let p = progress(&all);
        assert!(p.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {p:?}");
        assert_eq!(p.last(), Some(&1.0));
        assert_eq!(p.iter().filter(|f| **f == 1.0).count(), 1);
        assert!(all.contains(&SenderEffect::Emit(SenderEvent::Done { bytes_sent: 90_000 })));
    }

    // ---

    #[test]
    fn pause_after_three_chunks_resumes_at_chunk_boundary() {
        // ---
        let mut s = SenderSession::new(meta(90_000, 8192), 0);
        s.handle(SenderInput::Start);
        for _ in 0..3 {
            pump_one(&mut s);
        }

        let fx = s.handle(SenderInput::Pause);
        assert_eq!(sent_frames(&fx), vec![ControlHeader::TransferPause]);
        assert!(!s.wants_chunk());

        // A read that completes after the pause is discarded.
        let fx = s.handle(SenderInput::ChunkRead(Bytes::from(vec![0; 8192])));
        assert!(fx.is_empty());
        assert_eq!(s.offset(), 24_576);

        let fx = s.handle(SenderInput::Resume);
        assert!(fx.contains(&SenderEffect::OpenSource(24_576)));
        assert_eq!(s.next_chunk_len(), 8192);
        assert_eq!(s.offset(), 24_576);
    }

    // ---

    #[test]
    fn local_and_peer_pause_must_both_clear() {
        // ---
        let mut s = SenderSession::new(meta(50_000, 1000), 0);
        s.handle(SenderInput::Start);
        pump_one(&mut s);

        s.handle(SenderInput::Pause);
        s.handle(SenderInput::Frame(Frame::control(ControlHeader::TransferPause)));
        assert_eq!(s.state(), SenderState::Paused { local: true, peer: true });

        s.handle(SenderInput::Resume);
        assert!(!s.wants_chunk(), "peer pause still holds");

        let fx = s.handle(SenderInput::Frame(Frame::count_payload(
            ControlHeader::TransferResume,
            1,
        )));
        assert!(fx.contains(&SenderEffect::OpenSource(1000)));
        assert!(s.wants_chunk());
    }

    // ---

    #[test]
    fn peer_resume_behind_sender_does_not_rewind() {
        // ---
        let mut s = SenderSession::new(meta(10_000, 1000), 0);
        s.handle(SenderInput::Start);
        for _ in 0..5 {
            pump_one(&mut s);
        }
        s.handle(SenderInput::Frame(Frame::control(ControlHeader::TransferPause)));

        // Chunks 3 and 4 were still on the wire when the receiver counted.
        let fx = s.handle(SenderInput::Frame(Frame::count_payload(
            ControlHeader::TransferResume,
            3,
        )));
        assert!(fx.contains(&SenderEffect::OpenSource(5000)));
        assert_eq!(s.chunks_sent(), 5);
        assert_eq!(s.offset(), 5000);
    }

    // ---

    #[test]
    fn peer_pause_before_start_holds_emission() {
        // ---
        let mut s = SenderSession::new(meta(10_000, 1000), 2000);
        let fx = s.handle(SenderInput::Frame(Frame::control(ControlHeader::TransferPause)));
        assert_eq!(fx, vec![SenderEffect::Emit(SenderEvent::Paused(Initiator::Peer))]);

        let fx = s.handle(SenderInput::Start);
        assert!(fx.is_empty());
        assert_eq!(s.state(), SenderState::Paused { local: false, peer: true });
        assert!(!s.wants_chunk());

        let fx = s.handle(SenderInput::Frame(Frame::count_payload(
            ControlHeader::TransferResume,
            2,
        )));
        assert!(fx.contains(&SenderEffect::OpenSource(2000)));
        assert!(s.wants_chunk());
    }

    // ---

    #[test]
    fn peer_resume_before_start_clears_early_pause() {
        // ---
        let mut s = SenderSession::new(meta(10_000, 1000), 0);
        s.handle(SenderInput::Frame(Frame::control(ControlHeader::TransferPause)));
        s.handle(SenderInput::Frame(Frame::count_payload(ControlHeader::TransferResume, 0)));

        s.handle(SenderInput::Start);
        assert_eq!(s.state(), SenderState::Starting);
        assert!(s.wants_chunk());
    }

    // ---

    #[test]
    fn resume_count_past_end_completes() {
        // ---
        let mut s = SenderSession::new(meta(2500, 1000), 0);
        s.handle(SenderInput::Start);
        s.handle(SenderInput::Frame(Frame::control(ControlHeader::TransferPause)));

        let fx = s.handle(SenderInput::Frame(Frame::count_payload(
            ControlHeader::TransferResume,
            99,
        )));
        assert_eq!(s.offset(), 2500);
        assert_eq!(s.state(), SenderState::Done);
        assert_eq!(sent_frames(&fx), vec![ControlHeader::FileEnd]);
    }

    // ---

    #[test]
    fn cancel_sends_cancel_and_stops() {
        // ---
        let mut s = SenderSession::new(meta(10_000, 1000), 0);
        s.handle(SenderInput::Start);
        pump_one(&mut s);

        let fx = s.handle(SenderInput::Cancel);
        assert_eq!(sent_frames(&fx), vec![ControlHeader::TransferCancel]);
        assert!(fx.contains(&SenderEffect::ReleaseSource));
        assert_eq!(s.state(), SenderState::Cancelled);

        assert!(!s.wants_chunk());
        assert!(s.handle(SenderInput::Resume).is_empty());
    }

    // ---

    #[test]
    fn peer_cancel_is_not_answered() {
        // ---
        let mut s = SenderSession::new(meta(10_000, 1000), 0);
        s.handle(SenderInput::Start);

        let fx = s.handle(SenderInput::Frame(Frame::control(ControlHeader::TransferCancel)));
        assert!(sent_frames(&fx).is_empty());
        assert!(fx.contains(&SenderEffect::Emit(SenderEvent::Cancelled(Initiator::Peer))));
    }

    // ---

    #[test]
    fn zero_byte_file_completes_on_start() {
        // ---
        let mut s = SenderSession::new(meta(0, 1000), 0);
        let fx = s.handle(SenderInput::Start);

        assert_eq!(
            sent_frames(&fx),
            vec![ControlHeader::FileStart, ControlHeader::FileEnd]
        );
        assert_eq!(progress(&fx), vec![0.0, 1.0]);
        assert_eq!(s.state(), SenderState::Done);
    }

    // ---

    #[test]
    fn truncated_source_fails() {
        // ---
        let mut s = SenderSession::new(meta(5000, 1000), 0);
        s.handle(SenderInput::Start);
        pump_one(&mut s);

        let fx = s.handle(SenderInput::SourceExhausted);
        assert_eq!(s.state(), SenderState::Failed);
        assert!(matches!(
            fx.last(),
            Some(SenderEffect::Emit(SenderEvent::Failed { offset: 1000, .. }))
        ));
    }

    // ---

    #[test]
    fn channel_close_fails_and_ack_is_recorded() {
        // ---
        let mut s = SenderSession::new(meta(5000, 1000), 0);
        s.handle(SenderInput::Start);
        s.handle(SenderInput::Frame(Frame::count_payload(ControlHeader::FileChunkAck, 2)));
        assert_eq!(s.peer_acked_chunks(), Some(2));

        s.handle(SenderInput::ChannelClosed);
        assert_eq!(s.state(), SenderState::Failed);
    }

    // ---

    #[test]
    fn malformed_resume_payload_is_ignored() {
        // ---
        let mut s = SenderSession::new(meta(5000, 1000), 0);
        s.handle(SenderInput::Start);
        s.handle(SenderInput::Frame(Frame::control(ControlHeader::TransferPause)));

        let fx = s.handle(SenderInput::Frame(Frame::new(
            ControlHeader::TransferResume,
            Bytes::from_static(b"lots"),
        )));
        assert!(fx.is_empty());
        assert_eq!(s.state(), SenderState::Paused { local: false, peer: true });
    }
}
