//! [`FlowGate`] — outbound buffer accounting shared by channel implementations.
//!
//! A channel's writer side calls [`FlowGate::enqueued`] for every message it
//! buffers and the draining side calls [`FlowGate::dequeued`] once the
//! message has left the buffer.  Producers await [`FlowGate::drained`] before
//! handing over more bulk data:
//!
//! ```text
//! buffered >= high_water   → backpressure (drained() pends)
//! buffered <  high_water   → drain       (drained() resolves)
//! ```
//!
//! Control frames are enqueued regardless of the watermark; only bulk
//! producers wait on the gate.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

// ---

use tokio::sync::Notify;

// ---

use super::error::{PeerFileError, Result};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default high-water mark: 256 KiB of unsent bytes.
pub const DEFAULT_HIGH_WATER_BYTES: usize = 256 * 1024;

// ---------------------------------------------------------------------------
// FlowGate
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FlowGate {
    // ---
    /// Bytes handed to the channel but not yet drained by the far side.
    buffered: AtomicUsize,

    high_water: usize,

    /// Woken on every dequeue that crosses below `high_water`, and on close.
    drain: Notify,

    closed: AtomicBool,
}

// ---

impl FlowGate {
    // ---
    pub fn new(high_water: usize) -> Self {
        // ---
        Self {
            buffered: AtomicUsize::new(0),
            high_water: high_water.max(1),
            drain: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    // ---

    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    pub fn is_backpressured(&self) -> bool {
        self.buffered() >= self.high_water
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ---

    pub fn enqueued(&self, n: usize) {
        self.buffered.fetch_add(n, Ordering::AcqRel);
    }

    // ---

    pub fn dequeued(&self, n: usize) {
        // ---
        let before = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| Some(b.saturating_sub(n)))
            .unwrap_or(0);
        let after = before.saturating_sub(n);

        if after < self.high_water {
            self.drain.notify_waiters();
        }
    }

    // ---

    /// Mark the gate closed and release every waiter.
    pub fn close(&self) {
        // ---
        self.closed.store(true, Ordering::Release);
        self.drain.notify_waiters();
    }

    // ---

    /// Resolve once `buffered < high_water`.
    ///
    /// Returns [`PeerFileError::ChannelClosed`] if the gate is closed before
    /// or while waiting.
    pub async fn drained(&self) -> Result<()> {
        // ---
        loop {
            let notified = self.drain.notified();
            tokio::pin!(notified);
            // Register before checking so a dequeue between the check and the
            // await is not lost.
            notified.as_mut().enable();

            if self.is_closed() {
                return Err(PeerFileError::ChannelClosed);
            }
            if !self.is_backpressured() {
                return Ok(());
            }

            notified.await;
        }
    }
}

// ---

impl Default for FlowGate {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_WATER_BYTES)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn drained_resolves_immediately_below_high_water() {
        // ---
        let gate = FlowGate::new(100);
        gate.enqueued(99);
        gate.drained().await.unwrap();
    }

    // ---

    #[tokio::test]
    async fn drained_waits_for_dequeue() {
        // ---
        let gate = Arc::new(FlowGate::new(100));
        gate.enqueued(150);
        assert!(gate.is_backpressured());

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.drained().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "must pend while over high water");

        gate.dequeued(60);
        waiter.await.unwrap().unwrap();
        assert_eq!(gate.buffered(), 90);
    }

    // ---

    #[tokio::test]
    async fn close_releases_waiters_with_error() {
        // ---
        let gate = Arc::new(FlowGate::new(10));
        gate.enqueued(10);

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.drained().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.close();

        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(PeerFileError::ChannelClosed)));
    }

    // ---

    #[test]
    fn dequeue_never_underflows() {
        // ---
        let gate = FlowGate::new(10);
        gate.enqueued(3);
        gate.dequeued(5);
        assert_eq!(gate.buffered(), 0);
    }
}
