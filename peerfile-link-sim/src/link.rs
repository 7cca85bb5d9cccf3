use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ---

use tokio::sync::{mpsc, watch};

// ---

use peerfile_domain::{Channel, FlowGate};

// ---

use super::{LinkSimConfig, LinkSimRx, LinkSimTx};

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// State shared by both ends of one simulated link.
pub(crate) struct Link {
    // ---
    /// `true` while the link is up.  Flipped to `false` exactly once.
    up_tx: watch::Sender<bool>,

    /// One gate per direction: `[a → b, b → a]`.
    gates: [Arc<FlowGate>; 2],

    /// Messages sent in either direction so far.
    sent: AtomicU64,

    disconnect_after: Option<u64>,
}

// ---

impl Link {
    // ---
    pub(crate) fn is_up(&self) -> bool {
        *self.up_tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.up_tx.subscribe()
    }

    // ---

    /// Take the link down: close both gates and wake every reader.
    pub(crate) fn cut(&self) {
        // ---
        let was_up = self.up_tx.send_replace(false);
        if was_up {
            tracing::debug!("link-sim: link cut");
        }
        for gate in &self.gates {
            gate.close();
        }
    }

    // ---

    /// Count one sent message; cut the link if the scripted limit is reached.
    pub(crate) fn count_message(&self) {
        // ---
        let n = self.sent.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(limit) = self.disconnect_after {
            if n >= limit {
                self.cut();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LinkSimControl
// ---------------------------------------------------------------------------

/// Test-side handle for impairing a running link.
#[derive(Clone)]
pub struct LinkSimControl {
    // ---
    link: Arc<Link>,
}

// ---

impl LinkSimControl {
    // ---
    /// Drop the link.  Both ends see `recv() == None` and `ready()` errors.
    pub fn disconnect(&self) {
        self.link.cut();
    }

    pub fn is_up(&self) -> bool {
        self.link.is_up()
    }

    /// Messages sent in either direction so far.
    pub fn messages_sent(&self) -> u64 {
        self.link.sent.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// LinkSimPair
// ---------------------------------------------------------------------------

/// Two connected [`Channel`]s plus the control handle for their link.
pub struct LinkSimPair {
    // ---
    pub a: Channel,
    pub b: Channel,
    pub control: LinkSimControl,
}

// ---

impl LinkSimPair {
    // ---
    pub(crate) fn new(config: &LinkSimConfig) -> Self {
        // ---
        let (up_tx, _) = watch::channel(true);
        let gate_ab = Arc::new(FlowGate::new(config.high_water_bytes));
        let gate_ba = Arc::new(FlowGate::new(config.high_water_bytes));

        let link = Arc::new(Link {
            up_tx,
            gates: [Arc::clone(&gate_ab), Arc::clone(&gate_ba)],
            sent: AtomicU64::new(0),
            disconnect_after: config.disconnect_after_messages,
        });

        let (ab_tx, ab_rx) = mpsc::unbounded_channel();
        let (ba_tx, ba_rx) = mpsc::unbounded_channel();

        let a = Channel::new(
            Box::new(LinkSimTx::new(ab_tx, Arc::clone(&gate_ab), Arc::clone(&link))),
            Box::new(LinkSimRx::new(ba_rx, Arc::clone(&gate_ba), Arc::clone(&link), config.bw_cap_bps)),
        );
        let b = Channel::new(
            Box::new(LinkSimTx::new(ba_tx, gate_ba, Arc::clone(&link))),
            Box::new(LinkSimRx::new(ab_rx, gate_ab, Arc::clone(&link), config.bw_cap_bps)),
        );

        Self {
            a,
            b,
            control: LinkSimControl { link },
        }
    }
}
