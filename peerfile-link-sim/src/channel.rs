use std::sync::Arc;
use std::time::{Duration, Instant};

// ---

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

// ---

use peerfile_domain::{ChannelRx, ChannelTx, FlowGate, PeerFileError, Result};

// ---

use super::link::Link;

// ---------------------------------------------------------------------------
// TokenBucket
// ---------------------------------------------------------------------------

/// Simple token bucket for bandwidth capping in [`LinkSimRx`].
///
/// Tokens represent bytes. On each [`TokenBucket::try_consume`] call the
/// bucket refills based on elapsed wall time at the configured rate, then
/// consumes up to `n` tokens. Capacity is capped at one second's worth so
/// long idle periods cannot accumulate an unbounded burst allowance.
pub(crate) struct TokenBucket {
    // ---
    /// Bytes per second limit.
    rate_bps: u64,

    /// Available tokens (bytes).
    tokens: f64,

    /// Last refill timestamp.
    last_refill: Instant,
}

// ---

impl TokenBucket {
    // ---
    pub(crate) fn new(rate_bps: u64) -> Self {
        // ---
        Self {
            rate_bps,
            tokens: 0.0,
            last_refill: Instant::now(),
        }
    }

    // ---

    /// Refill from elapsed time, then consume up to `n` bytes.
    ///
    /// Returns bytes actually consumed; 0 means the bucket is empty.
    pub(crate) fn try_consume(&mut self, n: usize) -> usize {
        // ---
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        let cap = self.rate_bps as f64;
        self.tokens = (self.tokens + elapsed * cap).min(cap);

        let consumed = (self.tokens as usize).min(n);
        self.tokens -= consumed as f64;
        consumed
    }
}

// ---------------------------------------------------------------------------
// LinkSimTx
// ---------------------------------------------------------------------------

/// Sending half of a simulated channel.
///
/// Messages go onto an unbounded queue; the [`FlowGate`] tracks how many
/// bytes the far side has not read yet, and [`ChannelTx::ready`] pends while
/// that exceeds the configured high-water mark.
pub(crate) struct LinkSimTx {
    // ---
    tx: mpsc::UnboundedSender<Bytes>,
    gate: Arc<FlowGate>,
    link: Arc<Link>,
}

// ---

impl LinkSimTx {
    // ---
    pub(crate) fn new(tx: mpsc::UnboundedSender<Bytes>, gate: Arc<FlowGate>, link: Arc<Link>) -> Self {
        Self { tx, gate, link }
    }
}

// ---

#[async_trait]
impl ChannelTx for LinkSimTx {
    // ---
    fn send(&self, msg: Bytes) -> Result<()> {
        // ---
        if !self.link.is_up() {
            return Err(PeerFileError::ChannelClosed);
        }

        let len = msg.len();
        self.tx.send(msg).map_err(|_| PeerFileError::ChannelClosed)?;
        self.gate.enqueued(len);
        self.link.count_message();
        Ok(())
    }

    async fn ready(&self) -> Result<()> {
        self.gate.drained().await
    }

    fn is_connected(&self) -> bool {
        self.link.is_up()
    }

    async fn destroy(&self) {
        self.link.cut();
    }
}

// ---------------------------------------------------------------------------
// LinkSimRx
// ---------------------------------------------------------------------------

/// Receiving half of a simulated channel.
///
/// Reading a message releases its bytes from the sender's [`FlowGate`].
/// When `bucket` is `Some`, delivery is throttled so throughput stays at or
/// below the configured rate.
pub(crate) struct LinkSimRx {
    // ---
    rx: mpsc::UnboundedReceiver<Bytes>,
    gate: Arc<FlowGate>,
    up_rx: watch::Receiver<bool>,
    /// Keeps the link's watch sender alive as long as this half exists.
    _link: Arc<Link>,
    bucket: Option<TokenBucket>,

    /// Message taken off the queue but not yet paid for by the bucket.
    /// Kept here so a cancelled `recv` loses nothing.
    held: Option<(Bytes, usize)>,
}

// ---

impl LinkSimRx {
    // ---
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Bytes>,
        gate: Arc<FlowGate>,
        link: Arc<Link>,
        bw_cap_bps: Option<u64>,
    ) -> Self {
        // ---
        Self {
            rx,
            gate,
            up_rx: link.subscribe(),
            _link: link,
            bucket: bw_cap_bps.map(TokenBucket::new),
            held: None,
        }
    }

    // ---

    /// Next message off the queue, or `None` once the link is down.
    async fn next_message(&mut self) -> Option<Bytes> {
        // ---
        if !*self.up_rx.borrow() {
            return None;
        }

        tokio::select! {
            biased;
            _ = self.up_rx.wait_for(|up| !*up) => None,
            msg = self.rx.recv() => msg,
        }
    }
}

// ---

#[async_trait]
impl ChannelRx for LinkSimRx {
    // ---
    async fn recv(&mut self) -> Option<Bytes> {
        // ---
        let (msg, mut paid) = match self.held.take() {
            Some(held) => held,
            None => (self.next_message().await?, 0),
        };

        if let Some(bucket) = self.bucket.as_mut() {
            while paid < msg.len() {
                paid += bucket.try_consume(msg.len() - paid);
                if paid < msg.len() {
                    self.held = Some((msg.clone(), paid));
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    self.held = None;
                }
            }
        }

        self.gate.dequeued(msg.len());
        Some(msg)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
