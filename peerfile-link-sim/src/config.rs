use peerfile_domain::DEFAULT_HIGH_WATER_BYTES;

// ---------------------------------------------------------------------------
// LinkSimConfig
// ---------------------------------------------------------------------------

/// Configuration for the in-process channel simulator.
///
/// All fields default to a perfect link: no cap, no scripted disconnect,
/// and the same high-water mark real channels use.
#[derive(Debug, Clone)]
pub struct LinkSimConfig {
    // ---
    /// Unread bytes per direction at which the sending half reports
    /// backpressure.
    pub high_water_bytes: usize,

    /// Caps delivery throughput using a token bucket. `None` = unlimited.
    pub bw_cap_bps: Option<u64>,

    /// If `Some(n)`, the link drops after `n` messages have been sent in
    /// either direction.  Tests premature-close and reattach behaviour.
    pub disconnect_after_messages: Option<u64>,
}

// ---

impl Default for LinkSimConfig {
    fn default() -> Self {
        // ---
        Self {
            high_water_bytes: DEFAULT_HIGH_WATER_BYTES,
            bw_cap_bps: None,
            disconnect_after_messages: None,
        }
    }
}

// ---

impl LinkSimConfig {
    // ---
    /// Perfect link with no impairments. Useful as a baseline.
    pub fn perfect() -> Self {
        Self::default()
    }

    // ---

    /// Slow link with a tight buffer so senders hit backpressure quickly:
    /// 2 MB/s and a 16 KiB high-water mark.
    pub fn congested() -> Self {
        // ---
        Self {
            high_water_bytes: 16 * 1024,
            bw_cap_bps: Some(2_000_000),
            ..Default::default()
        }
    }

    // ---

    /// Link that drops after `messages` messages.
    pub fn drop_after(messages: u64) -> Self {
        // ---
        Self {
            disconnect_after_messages: Some(messages),
            ..Default::default()
        }
    }
}
