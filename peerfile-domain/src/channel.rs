use async_trait::async_trait;
use bytes::Bytes;

// ---

use super::error::Result;

// ---------------------------------------------------------------------------
// ChannelTx
// ---------------------------------------------------------------------------

/// Outbound half of an ordered, reliable, message-oriented channel.
///
/// One `send` is one message on the far side's [`ChannelRx::recv`]; message
/// boundaries are preserved and delivery is in order.
///
/// `#[async_trait]` keeps the trait dyn-compatible so drivers can hold a
/// [`ChannelTxPtr`] without knowing the transport.
#[async_trait]
pub trait ChannelTx: Send + Sync {
    // ---
    /// Hand one message to the channel.
    ///
    /// Never blocks: the message is buffered if the transport is busy.  Bulk
    /// producers call [`ready`](Self::ready) first so the buffer stays
    /// bounded.  Returns [`crate::PeerFileError::ChannelClosed`] once the
    /// channel is gone.
    fn send(&self, msg: Bytes) -> Result<()>;

    /// Resolve when the channel can take another message without growing its
    /// buffer past the high-water mark.
    ///
    /// This is the backpressure / drain signal.  Errors if the channel closes
    /// while waiting.
    async fn ready(&self) -> Result<()>;

    /// `false` once either side has destroyed the channel.
    fn is_connected(&self) -> bool;

    /// Tear the channel down.  Buffered messages may be lost.
    async fn destroy(&self);
}

// ---------------------------------------------------------------------------
// ChannelRx
// ---------------------------------------------------------------------------

/// Inbound half of a channel.
#[async_trait]
pub trait ChannelRx: Send {
    // ---
    /// Next inbound message, or `None` when the channel has closed.
    ///
    /// Must be cancel-safe: dropping the future before it resolves loses no
    /// message.
    async fn recv(&mut self) -> Option<Bytes>;
}

// ---

/// Convenience type alias for a heap-allocated [`ChannelTx`].
pub type ChannelTxPtr = Box<dyn ChannelTx>;

/// Convenience type alias for a heap-allocated [`ChannelRx`].
pub type ChannelRxPtr = Box<dyn ChannelRx>;

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A connected channel, already split into its two halves.
///
/// Delivered to the transfer core by the signaling layer; the core never
/// establishes channels itself.
pub struct Channel {
    // ---
    pub tx: ChannelTxPtr,
    pub rx: ChannelRxPtr,
}

// ---

impl Channel {
    // ---
    pub fn new(tx: ChannelTxPtr, rx: ChannelRxPtr) -> Self {
        Self { tx, rx }
    }
}

// ---

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        f.debug_struct("Channel")
            .field("connected", &self.tx.is_connected())
            .finish()
    }
}
