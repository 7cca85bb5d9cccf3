//! Concrete [`ByteSource`] and [`ByteSink`] implementations.
//!
//! - [`MemorySource`] / [`MemorySink`] — in-memory, for tests and the demo
//! - [`FileSource`] / [`FileSink`] — tokio filesystem I/O for the CLI
//!
//! [`FileSink`] writes into `<dir>/<transfer-id>.part` and renames the file
//! to its declared name on finalize, so a partial transfer never shows up
//! under its final name.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

// ---

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

// ---

use peerfile_domain::{
    // ---
    ByteSink,
    ByteSource,
    ChunkReader,
    FileContent,
    PeerFileError,
    ReceivedFile,
    Result,
    TransferId,
    TransferMetadata,
};

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// Serves a byte buffer already in memory.
pub struct MemorySource {
    // ---
    name: String,
    file_type: String,
    data: Bytes,
}

// ---

impl MemorySource {
    // ---
    pub fn new(name: impl Into<String>, file_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        // ---
        Self {
            name: name.into(),
            file_type: file_type.into(),
            data: data.into(),
        }
    }
}

// ---

#[async_trait]
impl ByteSource for MemorySource {
    // ---
    fn file_name(&self) -> &str {
        &self.name
    }

    fn file_size(&self) -> u64 {
        self.data.len() as u64
    }

    fn file_type(&self) -> &str {
        &self.file_type
    }

    async fn open_at(&mut self, offset: u64) -> Result<ChunkReader> {
        // ---
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.data.len());
        Ok(Box::new(std::io::Cursor::new(self.data.slice(start..))))
    }
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// Streams a file from disk.  Size is taken once, at construction.
pub struct FileSource {
    // ---
    path: PathBuf,
    name: String,
    file_type: String,
    size: u64,
}

// ---

impl FileSource {
    // ---
    /// Stat `path` and build a source for it.  The file name sent to the
    /// receiver is the last path component.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        // ---
        let path = path.as_ref().to_path_buf();
        let size = fs::metadata(&path).await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PeerFileError::Metadata(format!("no file name in {}", path.display())))?;
        let file_type = guess_file_type(&name).to_string();

        Ok(Self {
            path,
            name,
            file_type,
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ---

#[async_trait]
impl ByteSource for FileSource {
    // ---
    fn file_name(&self) -> &str {
        &self.name
    }

    fn file_size(&self) -> u64 {
        self.size
    }

    fn file_type(&self) -> &str {
        &self.file_type
    }

    async fn open_at(&mut self, offset: u64) -> Result<ChunkReader> {
        // ---
        let mut file = File::open(&self.path).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(file))
    }
}

// ---

/// MIME type from the file extension; empty when unknown.
fn guess_file_type(name: &str) -> &'static str {
    // ---
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        _ => "",
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// Accumulates received bytes in memory.
#[derive(Default)]
pub struct MemorySink {
    // ---
    buf: BytesMut,
}

// ---

impl MemorySink {
    // ---
    pub fn new() -> Self {
        Self::default()
    }
}

// ---

#[async_trait]
impl ByteSink for MemorySink {
    // ---
    async fn append(&mut self, bytes: Bytes) -> Result<()> {
        self.buf.extend_from_slice(&bytes);
        Ok(())
    }

    async fn finalize(&mut self, metadata: &TransferMetadata) -> Result<ReceivedFile> {
        // ---
        check_len(self.buf.len() as u64, metadata)?;
        Ok(ReceivedFile {
            metadata: metadata.clone(),
            content: FileContent::Memory(self.buf.split().freeze()),
        })
    }

    async fn discard(&mut self) -> Result<()> {
        self.buf.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileSink
// ---------------------------------------------------------------------------

/// Writes received bytes to a partial file under `dir`.
pub struct FileSink {
    // ---
    dir: PathBuf,
    part_path: PathBuf,
    file: Option<File>,
    written: u64,
}

// ---

impl FileSink {
    // ---
    pub fn new(dir: impl Into<PathBuf>, transfer_id: &TransferId) -> Self {
        // ---
        let dir = dir.into();
        let part_path = dir.join(format!("{}.part", sanitize(transfer_id.as_str())));
        Self {
            dir,
            part_path,
            file: None,
            written: 0,
        }
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    // ---

    async fn file(&mut self) -> Result<&mut File> {
        // ---
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.part_path)
                .await?;
            self.file = Some(file);
            self.written = 0;
        }
        self.file
            .as_mut()
            .ok_or_else(|| PeerFileError::Transport("sink file unavailable".into()))
    }
}

// ---

#[async_trait]
impl ByteSink for FileSink {
    // ---
    async fn append(&mut self, bytes: Bytes) -> Result<()> {
        // ---
        self.file().await?.write_all(&bytes).await?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    async fn finalize(&mut self, metadata: &TransferMetadata) -> Result<ReceivedFile> {
        // ---
        // Zero-byte transfers never call append.
        let file = self.file().await?;
        file.flush().await?;
        file.sync_all().await?;
        self.file = None;

        check_len(self.written, metadata)?;

        let final_path = self.dir.join(sanitize(&metadata.file_name));
        fs::rename(&self.part_path, &final_path).await?;
        tracing::info!(path = %final_path.display(), bytes = self.written, "sink: file written");

        Ok(ReceivedFile {
            metadata: metadata.clone(),
            content: FileContent::Disk(final_path),
        })
    }

    async fn discard(&mut self) -> Result<()> {
        // ---
        self.file = None;
        self.written = 0;
        match fs::remove_file(&self.part_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---

fn check_len(held: u64, metadata: &TransferMetadata) -> Result<()> {
    // ---
    if held != metadata.file_size {
        return Err(PeerFileError::Metadata(format!(
            "sink holds {held} bytes, expected {}",
            metadata.file_size
        )));
    }
    Ok(())
}

/// Keep only the last path component and replace anything that could escape
/// the output directory.
fn sanitize(name: &str) -> String {
    // ---
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() || c == '/' || c == '\\' { '_' } else { c })
        .collect();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
