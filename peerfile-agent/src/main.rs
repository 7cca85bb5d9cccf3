//! Peerfile agent.
//!
//! Sends files to, or receives files from, another agent over TCP.  A
//! dropped connection is retried and the transfer resumes from the last
//! chunk the receiver stored.
//!
//! Usage:
//!   peerfile-agent receive --bind 0.0.0.0:5100 --out-dir ./received
//!   peerfile-agent send --peer 192.168.1.2:5100 --file ./photo.jpg
//!   peerfile-agent demo --size 1000000

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

// ---

use peerfile_agent::{
    // ---
    read_message,
    spawn_sender,
    write_message,
    AttachRequest,
    Config,
    FileSink,
    FileSource,
    MemorySink,
    MemorySource,
    Mode,
    ReceiverConfig,
    ReceiverHandle,
    ResumeOffer,
    SenderConfig,
    SenderState,
    TcpChannel,
    TransferMux,
};
use peerfile_domain::{
    // ---
    ByteSource,
    FileContent,
    ReceivedFile,
    ReceiverEvent,
    SenderEvent,
    TransferId,
    DEFAULT_HIGH_WATER_BYTES,
};
use peerfile_link_sim::{LinkSimConfig, LinkSimTransport};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Time allowed for the attach request / resume offer exchange.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for queued frames to reach the socket once a sender is done.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---

    let cfg = Config::parse();

    let no_color = std::env::var("EMACS").is_ok()
        || std::env::var("NO_COLOR").is_ok()
        || std::env::var("CARGO_TERM_COLOR").as_deref() == Ok("never")
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_ansi(!no_color)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "peerfile-agent starting");

    match cfg.mode {
        Mode::Receive {
            bind,
            out_dir,
            ack_every,
        } => run_receive(bind, out_dir, ack_every).await,

        Mode::Send {
            peer,
            file,
            transfer_id,
            chunk_size,
        } => run_send(peer, file, transfer_id, chunk_size).await,

        Mode::Demo { size, chunk_size } => run_demo(size, chunk_size).await,
    }
}

// ---------------------------------------------------------------------------
// receive
// ---------------------------------------------------------------------------

async fn run_receive(bind: SocketAddr, out_dir: PathBuf, ack_every: Option<u64>) -> anyhow::Result<()> {
    // ---
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("create {}", out_dir.display()))?;

    let mux = TransferMux::new(ReceiverConfig {
        ack_interval_chunks: ack_every,
        ..ReceiverConfig::default()
    });

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(%bind, out_dir = %out_dir.display(), "receiver listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                let mux = mux.clone();
                let out_dir = out_dir.clone();
                tokio::spawn(async move {
                    if let Err(e) = accept_channel(stream, peer, mux, out_dir).await {
                        warn!(%peer, "inbound channel rejected: {e:#}");
                    }
                });
            }

            _ = tokio::signal::ctrl_c() => {
                info!(active = mux.len().await, "shutting down");
                return Ok(());
            }
        }
    }
}

// ---

/// Run the signaling handshake on a fresh connection and hand the channel to
/// the mux.
async fn accept_channel(
    mut stream: TcpStream,
    peer: SocketAddr,
    mux: TransferMux,
    out_dir: PathBuf,
) -> anyhow::Result<()> {
    // ---
    let msg = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_message(&mut stream))
        .await
        .context("attach request timed out")??
        .ok_or_else(|| anyhow!("peer closed before attach request"))?;
    let transfer_id = AttachRequest::from_message(&msg)?.transfer_id;

    let offer = mux.resume_offer(&transfer_id).await;
    write_message(&mut stream, &offer.to_message()?).await?;

    let tcp = TcpChannel::open(stream, DEFAULT_HIGH_WATER_BYTES);
    let sink_id = transfer_id.clone();
    let attachment = mux
        .receive(transfer_id.clone(), tcp.channel, move || {
            Box::new(FileSink::new(out_dir, &sink_id))
        })
        .await?;

    if attachment.offer.chunks_received != offer.chunks_received {
        warn!(
            %transfer_id,
            offered = offer.chunks_received,
            attached = attachment.offer.chunks_received,
            "session changed during handshake",
        );
    }

    info!(
        %transfer_id,
        %peer,
        new = attachment.is_new(),
        chunks = attachment.offer.chunks_received,
        "channel attached",
    );

    if let Some(events) = attachment.events {
        tokio::spawn(log_receiver_events(transfer_id, events));
    }
    Ok(())
}

// ---

async fn log_receiver_events(transfer_id: TransferId, mut events: mpsc::UnboundedReceiver<ReceiverEvent>) {
    // ---
    while let Some(event) = events.recv().await {
        match event {
            ReceiverEvent::Started(meta) => info!(
                %transfer_id,
                file = %meta.file_name,
                size = meta.file_size,
                chunk_size = meta.chunk_size,
                "transfer started",
            ),
            ReceiverEvent::Progress(p) => {
                tracing::debug!(%transfer_id, bytes = p.bytes, percent = p.percent(), "progress")
            }
            ReceiverEvent::Done(file) => match digest_received(&file).await {
                Ok(sha256) => info!(%transfer_id, file = ?file.content, %sha256, "transfer complete"),
                Err(e) => warn!(%transfer_id, "transfer complete, digest failed: {e:#}"),
            },
            ReceiverEvent::Interrupted {
                bytes_received,
                chunks_received,
            } => warn!(%transfer_id, bytes_received, chunks_received, "channel lost, waiting for sender"),
            ReceiverEvent::Failed { reason } => warn!(%transfer_id, %reason, "transfer failed"),
            other => info!(%transfer_id, event = ?other, "transfer event"),
        }
    }
}

// ---------------------------------------------------------------------------
// send
// ---------------------------------------------------------------------------

async fn run_send(
    peer: SocketAddr,
    file: PathBuf,
    transfer_id: Option<String>,
    chunk_size: u32,
) -> anyhow::Result<()> {
    // ---
    let transfer_id = TransferId::new(transfer_id.unwrap_or_else(|| Uuid::new_v4().to_string()));
    let sha256 = sha256_file(&file).await?;
    info!(%transfer_id, file = %file.display(), %sha256, %peer, "sending");

    let mut backoff = INITIAL_BACKOFF;

    loop {
        match send_once(peer, &file, &transfer_id, chunk_size).await {
            Ok(SenderState::Done) => {
                info!(%transfer_id, "transfer complete");
                return Ok(());
            }
            Ok(SenderState::Cancelled) => bail!("transfer {transfer_id} cancelled"),
            Ok(state) => {
                backoff = INITIAL_BACKOFF;
                warn!(%transfer_id, ?state, "channel lost, reconnecting in {backoff:?}");
            }
            Err(e) => warn!(%transfer_id, "attempt failed: {e:#}; retrying in {backoff:?}"),
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

// ---

/// One connection: handshake, resume from the offer, run until the sender
/// session ends.
async fn send_once(
    peer: SocketAddr,
    file: &Path,
    transfer_id: &TransferId,
    chunk_size: u32,
) -> anyhow::Result<SenderState> {
    // ---
    let mut stream = TcpStream::connect(peer)
        .await
        .with_context(|| format!("connect {peer}"))?;

    write_message(&mut stream, &AttachRequest::new(transfer_id.clone()).to_message()?).await?;
    let msg = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_message(&mut stream))
        .await
        .context("resume offer timed out")??
        .ok_or_else(|| anyhow!("peer closed before resume offer"))?;
    let offer = ResumeOffer::from_message(&msg)?;
    if offer.transfer_id != *transfer_id {
        bail!("offer is for {}, expected {transfer_id}", offer.transfer_id);
    }

    let source = FileSource::open(file)
        .await
        .with_context(|| format!("open {}", file.display()))?;
    let offset = offer.offset_bytes(chunk_size, source.file_size());
    let config = SenderConfig {
        chunk_size: offer.effective_chunk_size(chunk_size),
    };

    let tcp = TcpChannel::open(stream, DEFAULT_HIGH_WATER_BYTES);
    let (handle, events) = spawn_sender(transfer_id.clone(), tcp.channel, Box::new(source), &config, offset)?;
    let logger = tokio::spawn(log_sender_events(transfer_id.clone(), events));

    info!(%transfer_id, offset, chunks = offer.chunks_received, "channel open");
    handle.start();

    let state = tokio::select! {
        state = handle.finished() => state,
        _ = tokio::signal::ctrl_c() => {
            handle.cancel();
            handle.finished().await
        }
    };

    if tokio::time::timeout(FLUSH_TIMEOUT, tcp.writer).await.is_err() {
        warn!(%transfer_id, "socket writer did not finish in {FLUSH_TIMEOUT:?}");
    }
    let _ = logger.await;

    Ok(state)
}

// ---

async fn log_sender_events(transfer_id: TransferId, mut events: mpsc::UnboundedReceiver<SenderEvent>) {
    // ---
    while let Some(event) = events.recv().await {
        match event {
            SenderEvent::Progress(p) => {
                tracing::debug!(%transfer_id, bytes = p.bytes, percent = p.percent(), "progress")
            }
            SenderEvent::Failed { offset, reason } => warn!(%transfer_id, offset, %reason, "sender failed"),
            other => info!(%transfer_id, event = ?other, "sender event"),
        }
    }
}

// ---------------------------------------------------------------------------
// demo
// ---------------------------------------------------------------------------

/// Sender and receiver in one process over a congested simulated link.  The
/// receiver pauses at a quarter, the link drops at half, and a second
/// channel resumes the transfer through the mux.
async fn run_demo(size: u64, chunk_size: u32) -> anyhow::Result<()> {
    // ---
    let data = demo_payload(size);
    let expected = hex_digest(&data);
    let transfer_id = TransferId::from("demo");
    let source = || Box::new(MemorySource::new("demo.bin", "application/octet-stream", data.clone()));

    let transport = LinkSimTransport::new(LinkSimConfig::congested());
    let mux = TransferMux::new(ReceiverConfig::default());

    // --- first channel
    let first = transport.connected_pair();
    let attachment = mux
        .receive(transfer_id.clone(), first.b, || Box::new(MemorySink::new()))
        .await?;
    let receiver = attachment.handle.clone();
    let events = attachment
        .events
        .ok_or_else(|| anyhow!("demo session already existed"))?;
    let collector = tokio::spawn(collect_received(events));

    let config = SenderConfig { chunk_size };
    let (sender, sender_events) = spawn_sender(transfer_id.clone(), first.a, source(), &config, 0)?;
    tokio::spawn(log_sender_events(transfer_id.clone(), sender_events));
    sender.start();

    // --- pause and resume from the receiving side
    if wait_for_bytes(&receiver, size / 4).await {
        receiver.pause();
        info!("demo: receiver paused");
        tokio::time::sleep(Duration::from_millis(200)).await;
        receiver.resume();
        info!("demo: receiver resumed");
    }

    // --- drop the link and resume on a new channel
    if wait_for_bytes(&receiver, size / 2).await {
        first.control.disconnect();
        let state = sender.finished().await;
        info!(?state, "demo: link dropped");

        let offer = mux.resume_offer(&transfer_id).await;
        let second = transport.connected_pair();
        let attachment = mux
            .receive(transfer_id.clone(), second.b, || Box::new(MemorySink::new()))
            .await?;
        info!(offered = offer.chunks_received, attached = attachment.offer.chunks_received, "demo: reattached");

        let offset = attachment.offer.offset_bytes(chunk_size, size);
        let config = SenderConfig {
            chunk_size: attachment.offer.effective_chunk_size(chunk_size),
        };
        let (sender, sender_events) = spawn_sender(transfer_id.clone(), second.a, source(), &config, offset)?;
        tokio::spawn(log_sender_events(transfer_id.clone(), sender_events));
        sender.start();
    }

    let state = receiver.finished().await;
    info!(?state, "demo: receiver finished");

    let file = collector
        .await?
        .ok_or_else(|| anyhow!("demo transfer did not complete"))?;
    let FileContent::Memory(bytes) = &file.content else {
        bail!("demo sink produced {:?}", file.content);
    };
    let actual = hex_digest(bytes);
    info!(%expected, %actual, bytes = bytes.len(), "demo: digests");
    if actual != expected {
        bail!("demo digest mismatch");
    }
    info!("demo: ok");
    Ok(())
}

// ---

/// Poll until the receiver holds `bytes`.  `false` if it finished first.
async fn wait_for_bytes(receiver: &ReceiverHandle, bytes: u64) -> bool {
    // ---
    loop {
        let status = receiver.status();
        if status.state.is_terminal() {
            return false;
        }
        if status.bytes_received >= bytes {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn collect_received(mut events: mpsc::UnboundedReceiver<ReceiverEvent>) -> Option<ReceivedFile> {
    // ---
    let mut done = None;
    while let Some(event) = events.recv().await {
        match event {
            ReceiverEvent::Progress(_) => {}
            ReceiverEvent::Done(file) => done = Some(file),
            other => info!(event = ?other, "demo: receiver event"),
        }
    }
    done
}

fn demo_payload(size: u64) -> Vec<u8> {
    // ---
    (0..size)
        .map(|i| ((i as u32).wrapping_mul(2_654_435_761) >> 24) as u8)
        .collect()
}

// ---------------------------------------------------------------------------
// Digests
// ---------------------------------------------------------------------------

fn hex_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

async fn sha256_file(path: &Path) -> anyhow::Result<String> {
    // ---
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn digest_received(file: &ReceivedFile) -> anyhow::Result<String> {
    // ---
    match &file.content {
        FileContent::Memory(bytes) => Ok(hex_digest(bytes)),
        FileContent::Disk(path) => sha256_file(path).await,
    }
}

// ---------------------------------------------------------------------------
