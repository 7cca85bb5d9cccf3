use super::config::LinkSimConfig;
use super::link::LinkSimPair;

// ---------------------------------------------------------------------------
// LinkSimTransport
// ---------------------------------------------------------------------------

/// In-process channel factory. Does not use real sockets.
///
/// Every call to [`LinkSimTransport::connected_pair`] creates an independent
/// link, so a test can simulate a dropped channel being replaced by a fresh
/// one simply by asking for another pair.
pub struct LinkSimTransport {
    // ---
    config: LinkSimConfig,
}

// ---

impl LinkSimTransport {
    // ---
    pub fn new(config: LinkSimConfig) -> Self {
        Self { config }
    }

    // ---

    /// Create a directly-connected channel pair.
    pub fn connected_pair(&self) -> LinkSimPair {
        LinkSimPair::new(&self.config)
    }
}
