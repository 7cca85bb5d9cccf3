//! Message channel over a TCP stream.
//!
//! TCP is a byte stream, so every channel message is wrapped in a small
//! fixed header that restores the boundaries:
//!
//! ```text
//! +-------+-------+-------------------+-----------------------------+
//! | magic | ver   | payload_len (u32) | payload (payload_len bytes) |
//! | 0x50  | 0x01  | big-endian        | one channel message         |
//! +-------+-------+-------------------+-----------------------------+
//!   1 byte  1 byte      4 bytes          variable
//!                  ← fixed 6 bytes →
//! ```
//!
//! [`write_message`] / [`read_message`] work on any async stream and are
//! also used for the signaling handshake before a [`TcpChannel`] takes the
//! socket over.  [`TcpChannel::open`] splits the socket between a writer
//! task, which drains an outbound queue accounted by a [`FlowGate`], and a
//! reader task feeding a bounded inbound queue.

use std::net::SocketAddr;
use std::sync::Arc;

// ---

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ---

use peerfile_domain::{
    // ---
    Channel,
    ChannelRx,
    ChannelTx,
    FlowGate,
    PeerFileError,
    Result,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic byte, 'P' for peerfile.  Lets the reader detect misaligned reads.
pub const MAGIC: u8 = 0x50;

/// Wire format version.  Bump when the fixed header layout changes.
pub const VERSION: u8 = 0x01;

/// Fixed header size in bytes: magic(1) + ver(1) + payload_len(4).
pub const FIXED_HEADER_LEN: usize = 6;

/// Largest message accepted from the wire.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Messages buffered between the socket reader and [`ChannelRx::recv`].
const INBOUND_QUEUE: usize = 64;

// ---------------------------------------------------------------------------
// write_message / read_message
// ---------------------------------------------------------------------------

/// Write one framed message to `stream`.
pub async fn write_message<W>(stream: &mut W, msg: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload_len = u32::try_from(msg.len())
        .ok()
        .filter(|n| *n as usize <= MAX_MESSAGE_LEN)
        .ok_or_else(|| PeerFileError::Transport(format!("message of {} bytes too large", msg.len())))?;

    let mut fixed = [0u8; FIXED_HEADER_LEN];
    fixed[0] = MAGIC;
    fixed[1] = VERSION;
    fixed[2..6].copy_from_slice(&payload_len.to_be_bytes());

    stream
        .write_all(&fixed)
        .await
        .map_err(|e| PeerFileError::Transport(format!("tcp write fixed header: {e}")))?;

    stream
        .write_all(msg)
        .await
        .map_err(|e| PeerFileError::Transport(format!("tcp write payload: {e}")))?;

    Ok(())
}

// ---

/// Read one framed message from `stream`.
///
/// Returns `None` on clean EOF (zero-length read of the header).
pub async fn read_message<R>(stream: &mut R) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut fixed = [0u8; FIXED_HEADER_LEN];

    // Peek at the first byte to distinguish clean EOF from a real header.
    match stream.read(&mut fixed[..1]).await {
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(e) => return Err(PeerFileError::Transport(format!("tcp read header[0]: {e}"))),
    }

    stream
        .read_exact(&mut fixed[1..])
        .await
        .map_err(|e| PeerFileError::Transport(format!("tcp read header[1..]: {e}")))?;

    if fixed[0] != MAGIC {
        return Err(PeerFileError::Transport(format!(
            "tcp bad magic: expected 0x{MAGIC:02X}, got 0x{:02X}",
            fixed[0]
        )));
    }

    if fixed[1] != VERSION {
        return Err(PeerFileError::Transport(format!(
            "tcp unsupported version: expected {VERSION}, got {}",
            fixed[1]
        )));
    }

    let payload_len = u32::from_be_bytes([fixed[2], fixed[3], fixed[4], fixed[5]]) as usize;
    if payload_len > MAX_MESSAGE_LEN {
        return Err(PeerFileError::Transport(format!(
            "tcp message of {payload_len} bytes exceeds limit"
        )));
    }

    let mut payload = vec![0u8; payload_len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| PeerFileError::Transport(format!("tcp read payload: {e}")))?;

    Ok(Some(Bytes::from(payload)))
}

// ---------------------------------------------------------------------------
// TcpChannel
// ---------------------------------------------------------------------------

/// A [`Channel`] running over a TCP socket, plus the writer task handle.
///
/// Await `writer` after the session ends to make sure queued messages (a
/// final `FILE_END`, for example) reached the socket before the process
/// exits.
pub struct TcpChannel {
    // ---
    pub channel: Channel,
    pub writer: JoinHandle<()>,
    pub peer: Option<SocketAddr>,
}

// ---

impl TcpChannel {
    // ---
    /// Take over `stream`.  Anything already exchanged on it (the signaling
    /// handshake) must have been read in full.
    pub fn open(stream: TcpStream, high_water_bytes: usize) -> Self {
        // ---
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("tcp: set_nodelay failed: {e}");
        }
        let peer = stream.peer_addr().ok();
        let (rd, wr) = stream.into_split();

        let gate = Arc::new(FlowGate::new(high_water_bytes));
        let (destroy_tx, destroy_rx) = watch::channel(false);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);

        let writer = tokio::spawn(run_writer(wr, out_rx, Arc::clone(&gate), destroy_rx.clone()));
        tokio::spawn(run_reader(rd, in_tx, Arc::clone(&gate), destroy_rx));

        let tx = TcpTx {
            out_tx,
            gate,
            destroy_tx,
        };
        let rx = TcpRx { in_rx };

        Self {
            channel: Channel::new(Box::new(tx), Box::new(rx)),
            writer,
            peer,
        }
    }
}

// ---------------------------------------------------------------------------
// TcpTx / TcpRx
// ---------------------------------------------------------------------------

struct TcpTx {
    // ---
    out_tx: mpsc::UnboundedSender<Bytes>,
    gate: Arc<FlowGate>,
    destroy_tx: watch::Sender<bool>,
}

// ---

#[async_trait]
impl ChannelTx for TcpTx {
    // ---
    fn send(&self, msg: Bytes) -> Result<()> {
        // ---
        if self.gate.is_closed() {
            return Err(PeerFileError::ChannelClosed);
        }
        let len = msg.len();
        self.out_tx.send(msg).map_err(|_| PeerFileError::ChannelClosed)?;
        self.gate.enqueued(len);
        Ok(())
    }

    async fn ready(&self) -> Result<()> {
        self.gate.drained().await
    }

    fn is_connected(&self) -> bool {
        !self.gate.is_closed()
    }

    async fn destroy(&self) {
        // ---
        self.destroy_tx.send_replace(true);
        self.gate.close();
    }
}

// ---

struct TcpRx {
    // ---
    in_rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl ChannelRx for TcpRx {
    // ---
    async fn recv(&mut self) -> Option<Bytes> {
        self.in_rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// Socket tasks
// ---------------------------------------------------------------------------

/// Resolve once `destroy` has been called.  Pends forever if the sending
/// half is dropped without destroying.
async fn destroyed(rx: &mut watch::Receiver<bool>) {
    // ---
    let sender_gone = rx.wait_for(|d| *d).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

// ---

async fn run_writer(
    mut wr: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<Bytes>,
    gate: Arc<FlowGate>,
    mut destroy_rx: watch::Receiver<bool>,
) {
    // ---
    loop {
        tokio::select! {
            biased;

            _ = destroyed(&mut destroy_rx) => {
                tracing::debug!("tcp: writer destroyed");
                break;
            }

            msg = out_rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = write_message(&mut wr, &msg).await {
                        tracing::warn!("tcp: writer failed: {e}");
                        break;
                    }
                    gate.dequeued(msg.len());
                }
                None => break,
            },
        }
    }

    gate.close();
    let _ = wr.shutdown().await;
}

// ---

async fn run_reader(
    rd: OwnedReadHalf,
    in_tx: mpsc::Sender<Bytes>,
    gate: Arc<FlowGate>,
    mut destroy_rx: watch::Receiver<bool>,
) {
    // ---
    let mut rd = BufReader::new(rd);

    loop {
        let msg = tokio::select! {
            biased;

            _ = destroyed(&mut destroy_rx) => break,

            res = read_message(&mut rd) => match res {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    tracing::debug!("tcp: peer closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!("tcp: reader failed: {e}");
                    break;
                }
            },
        };

        if in_tx.send(msg).await.is_err() {
            break;
        }
    }

    gate.close();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::io::Cursor;

    use tokio::net::TcpListener;

    use super::*;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        // ---
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    // ---

    #[tokio::test]
    async fn bad_magic_rejected() {
        // ---
        let mut reader = Cursor::new(vec![0xFFu8, VERSION, 0, 0, 0, 1, 0]);
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    // ---

    #[tokio::test]
    async fn clean_eof_is_none() {
        // ---
        let mut buf = Vec::new();
        write_message(&mut buf, b"\x03").await.unwrap();
        assert_eq!(buf.len(), FIXED_HEADER_LEN + 1);

        let mut reader = Cursor::new(buf);
        assert_eq!(read_message(&mut reader).await.unwrap(), Some(Bytes::from_static(b"\x03")));
        assert_eq!(read_message(&mut reader).await.unwrap(), None);
    }

    // ---

    #[tokio::test]
    async fn channel_preserves_boundaries_both_ways() {
        // ---
        let (a, b) = socket_pair().await;
        let mut a = TcpChannel::open(a, 1 << 20);
        let mut b = TcpChannel::open(b, 1 << 20);

        let big = Bytes::from(vec![9u8; 200_000]);
        a.channel.tx.send(Bytes::from_static(b"\x00{}")).unwrap();
        a.channel.tx.send(Bytes::from_static(b"\x03")).unwrap();
        a.channel.tx.send(big.clone()).unwrap();
        b.channel.tx.send(Bytes::from_static(b"\x04")).unwrap();

        assert_eq!(b.channel.rx.recv().await.unwrap(), Bytes::from_static(b"\x00{}"));
        assert_eq!(b.channel.rx.recv().await.unwrap(), Bytes::from_static(b"\x03"));
        assert_eq!(b.channel.rx.recv().await.unwrap(), big);
        assert_eq!(a.channel.rx.recv().await.unwrap(), Bytes::from_static(b"\x04"));
    }

    // ---

    #[tokio::test]
    async fn dropping_one_side_closes_the_other() {
        // ---
        let (a, b) = socket_pair().await;
        let a = TcpChannel::open(a, 1 << 20);
        let mut b = TcpChannel::open(b, 1 << 20);

        a.channel.tx.send(Bytes::from_static(b"\x03")).unwrap();
        drop(a.channel);
        a.writer.await.unwrap();

        assert_eq!(b.channel.rx.recv().await.unwrap(), Bytes::from_static(b"\x03"));
        assert!(b.channel.rx.recv().await.is_none());
    }

    // ---

    #[tokio::test]
    async fn destroy_marks_disconnected() {
        // ---
        let (a, _b) = socket_pair().await;
        let a = TcpChannel::open(a, 1 << 20);

        a.channel.tx.destroy().await;
        assert!(!a.channel.tx.is_connected());
        assert!(a.channel.tx.send(Bytes::from_static(b"\x04")).is_err());
        assert!(a.channel.tx.ready().await.is_err());
    }
}
