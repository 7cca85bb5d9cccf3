//! [`TransferMux`] — maps transfer identifiers to live receiver sessions.
//!
//! A channel may die halfway through a transfer.  The signaling layer tags
//! every channel with the [`TransferId`] it carries, and the mux uses that tag
//! to decide between two cases:
//!
//! - unknown id: spawn a fresh receiver session with its own sink
//! - known id: hand the channel to the existing session, which keeps its sink
//!   and `chunks_received`, and return the [`ResumeOffer`] the new sender
//!   starts from
//!
//! Sessions remove themselves from the map when their task ends (done,
//! cancelled).  The map sits behind one async mutex and is the only state
//! shared between sessions.  The lock is never held across a call into a
//! session.

use std::collections::HashMap;
use std::sync::Arc;

// ---

use tokio::sync::{mpsc, Mutex};

// ---

use peerfile_domain::{ByteSinkPtr, Channel, ReceiverEvent, Result, TransferId};

// ---

use super::{ReceiverConfig, ReceiverHandle, ReceiverTask, ResumeOffer};

// ---------------------------------------------------------------------------
// Attachment
// ---------------------------------------------------------------------------

/// Result of [`TransferMux::receive`].
pub struct Attachment {
    // ---
    pub handle: ReceiverHandle,

    /// What the sender on this channel must resume from.
    pub offer: ResumeOffer,

    /// Event stream of a newly created session.  `None` on reattach; the
    /// stream went to whoever received the first channel.
    pub events: Option<mpsc::UnboundedReceiver<ReceiverEvent>>,
}

// ---

impl Attachment {
    // ---
    pub fn is_new(&self) -> bool {
        self.events.is_some()
    }
}

// ---------------------------------------------------------------------------
// TransferMux
// ---------------------------------------------------------------------------

/// Cheap-clone registry of receiver sessions keyed by [`TransferId`].
#[derive(Clone)]
pub struct TransferMux {
    // ---
    sessions: Arc<Mutex<HashMap<TransferId, ReceiverHandle>>>,

    /// Applied to every session this mux creates.
    config: ReceiverConfig,
}

// ---

impl TransferMux {
    // ---
    pub fn new(config: ReceiverConfig) -> Self {
        // ---
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    // ---

    /// Route an inbound channel tagged `transfer_id`.
    ///
    /// `make_sink` is only called when a new session is created.
    pub async fn receive<F>(&self, transfer_id: TransferId, channel: Channel, make_sink: F) -> Result<Attachment>
    where
        F: FnOnce() -> ByteSinkPtr,
    {
        // ---
        let mut sessions = self.sessions.lock().await;

        let existing = sessions.get(&transfer_id).cloned();
        if let Some(handle) = existing {
            // Unlocked across the attach; the session may be busy in its sink.
            drop(sessions);
            let offer = handle.attach(channel).await?;
            tracing::info!(
                %transfer_id,
                chunks = offer.chunks_received,
                "mux: channel reattached to existing session",
            );
            return Ok(Attachment {
                handle,
                offer,
                events: None,
            });
        }

        let (task, handle, events) =
            ReceiverTask::new(transfer_id.clone(), channel, make_sink(), self.config.clone());
        sessions.insert(transfer_id.clone(), handle.clone());
        tracing::info!(%transfer_id, sessions = sessions.len(), "mux: new receiver session");

        let map = Arc::clone(&self.sessions);
        let registered = handle.clone();
        let id = transfer_id.clone();
        tokio::spawn(async move {
            // ---
            let state = task.run().await;
            let mut sessions = map.lock().await;
            if sessions.get(&id).is_some_and(|h| h.same_session(&registered)) {
                sessions.remove(&id);
            }
            tracing::debug!(transfer_id = %id, ?state, remaining = sessions.len(), "mux: session removed");
        });

        Ok(Attachment {
            handle,
            offer: ResumeOffer::fresh(transfer_id),
            events: Some(events),
        })
    }

    // ---

    /// Offer for `transfer_id` before its next channel is attached.
    ///
    /// For a known session the current channel is dropped so the count
    /// cannot move until [`receive`](Self::receive) attaches the next one.
    /// Unknown ids get a fresh offer.
    pub async fn resume_offer(&self, transfer_id: &TransferId) -> ResumeOffer {
        // ---
        let handle = self.sessions.lock().await.get(transfer_id).cloned();
        match handle {
            Some(handle) => match handle.detach().await {
                Ok(offer) => offer,
                Err(e) => {
                    tracing::warn!(%transfer_id, "mux: detach failed, offering fresh start: {e}");
                    ResumeOffer::fresh(transfer_id.clone())
                }
            },
            None => ResumeOffer::fresh(transfer_id.clone()),
        }
    }

    // ---

    pub async fn get(&self, transfer_id: &TransferId) -> Option<ReceiverHandle> {
        self.sessions.lock().await.get(transfer_id).cloned()
    }

    pub async fn transfer_ids(&self) -> Vec<TransferId> {
        // ---
        let mut ids: Vec<_> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
