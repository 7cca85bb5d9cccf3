//! Session tuning and CLI configuration for `peerfile-agent`.
//!
//! Run modes:
//!   peerfile-agent receive [--bind 0.0.0.0:5100] [--out-dir ./received]
//!   peerfile-agent send --peer 192.168.1.2:5100 --file ./photo.jpg [--transfer-id cat1]
//!   peerfile-agent demo [--size 1000000] [--chunk-size 8192]

use std::net::SocketAddr;
use std::path::PathBuf;

// ---

use clap::{Parser, Subcommand};

// ---

use peerfile_domain::DEFAULT_CHUNK_SIZE;

// ---------------------------------------------------------------------------
// SenderConfig
// ---------------------------------------------------------------------------

/// Tuning for one sender session.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    // ---
    /// Bytes per `FILE_CHUNK`.  Only used when the session starts from
    /// offset 0; a resumed session must reuse the size the receiver already
    /// recorded.
    pub chunk_size: u32,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

// ---------------------------------------------------------------------------
// ReceiverConfig
// ---------------------------------------------------------------------------

/// Tuning for one receiver session.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    // ---
    /// Chunks held while locally paused.  Once full, the channel is not read
    /// again until resume, so the sender sees backpressure.
    pub max_parked_chunks: usize,

    /// Send `FILE_CHUNK_ACK` every `n` accepted chunks.  `None` disables acks.
    pub ack_interval_chunks: Option<u64>,

    /// Accept a second `FILE_START` and restart accumulation.  The
    /// multiplexer turns this on for the next start after a reattach.
    pub allow_restart: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        // ---
        Self {
            max_parked_chunks: 32,
            ack_interval_chunks: None,
            allow_restart: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "peerfile-agent", about = "Resumable peer-to-peer file transfer")]
pub struct Config {
    // ---
    #[command(subcommand)]
    pub mode: Mode,
}

// ---

#[derive(Debug, Subcommand)]
pub enum Mode {
    // ---
    /// Accept transfers over TCP and write completed files to a directory.
    Receive {
        // ---
        /// TCP address to listen on.
        #[arg(long, default_value = "0.0.0.0:5100")]
        bind: SocketAddr,

        /// Directory completed files are written to.  Created if missing.
        #[arg(long, default_value = "./received")]
        out_dir: PathBuf,

        /// Send `FILE_CHUNK_ACK` every N chunks.
        #[arg(long)]
        ack_every: Option<u64>,
    },

    /// Send one file to a receiving agent, reconnecting and resuming until
    /// the transfer completes.
    Send {
        // ---
        /// TCP address of the receiving agent.
        #[arg(long)]
        peer: SocketAddr,

        /// File to send.
        #[arg(long)]
        file: PathBuf,

        /// Identifier the receiver uses to find a partial transfer on
        /// reconnect.  Defaults to a random UUID.
        #[arg(long)]
        transfer_id: Option<String>,

        /// Bytes per chunk.
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u32,
    },

    /// Run a sender and a receiver in-process over a simulated link, with a
    /// pause/resume cycle and a dropped channel along the way.
    Demo {
        // ---
        /// Size of the generated payload in bytes.
        #[arg(long, default_value_t = 1_000_000)]
        size: u64,

        /// Bytes per chunk.
        #[arg(long, default_value_t = 8192)]
        chunk_size: u32,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use clap::Parser;

    use super::{Config, Mode};

    #[test]
    fn send_defaults_to_64k_chunks() {
        // ---
        let cfg = Config::parse_from([
            "peerfile-agent",
            "send",
            "--peer",
            "127.0.0.1:5100",
            "--file",
            "/tmp/x",
        ]);
        match cfg.mode {
            Mode::Send {
                chunk_size,
                transfer_id,
                ..
            } => {
                assert_eq!(chunk_size, 64 * 1024);
                assert!(transfer_id.is_none());
            }
            other => panic!("unexpected mode {other:?}"),
        }
    }

    // ---

    #[test]
    fn receive_parses_ack_interval() {
        // ---
        let cfg = Config::parse_from(["peerfile-agent", "receive", "--ack-every", "4"]);
        match cfg.mode {
            Mode::Receive { ack_every, .. } => assert_eq!(ack_every, Some(4)),
            other => panic!("unexpected mode {other:?}"),
        }
    }
}
