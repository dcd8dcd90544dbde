mod local;
mod remote;

use std::io;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::progress::{ProgressEvent, ProgressSink};

pub use local::LocalBackend;
pub use remote::{RemoteBackend, RemoteSession, SessionFactory, SessionPool};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: String },
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("empty file: {0}")]
    EmptyFile(String),
    #[error("remote session to {host} failed: {message}")]
    Session { host: String, message: String },
    #[error("unsupported storage scheme: {0}")]
    UnsupportedScheme(String),
    #[error("copy of {0} was cancelled")]
    Cancelled(String),
}

impl StorageError {
    pub fn io(path: impl Into<String>, source: io::Error) -> Self {
        StorageError::Io {
            source,
            path: path.into(),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One entry of a destination tree listing.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Path relative to the listed base.
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

/// A single-destination store addressed by relative paths.
///
/// `read`/`write` are stream-oriented; a backend whose streams cannot seek
/// reports `is_streaming() == true` and the transcode pipeline stages through
/// a local temporary file when the encoder rejects the pipe.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Root of the backend, used for display and for local absolute paths.
    fn root(&self) -> &str;

    /// True when reads/writes are non-seekable pipes (network backends).
    fn is_streaming(&self) -> bool;

    fn absolute(&self, rel: &str) -> String;

    async fn read(&self, rel: &str) -> StorageResult<ByteReader>;

    async fn write(&self, rel: &str) -> StorageResult<ByteWriter>;

    async fn size(&self, rel: &str) -> StorageResult<u64>;

    async fn exists(&self, rel: &str) -> bool;

    async fn remove(&self, rel: &str) -> StorageResult<()>;

    async fn remove_all(&self, rel: &str) -> StorageResult<()>;

    async fn mkdir(&self, rel: &str) -> StorageResult<()>;

    /// Live free space of the volume holding `base`.
    async fn free_space(&self, base: &str) -> StorageResult<u64>;

    /// Recursive listing under `base`; file paths are relative to `base`.
    async fn list_tree(&self, base: &str) -> StorageResult<Vec<TreeEntry>>;

    async fn is_empty_dir(&self, rel: &str) -> bool;
}

/// Constructs a backend for a configured path. Plain paths map to the local
/// backend; `smb://` paths require a remote session pool.
pub fn backend_for(
    path: &str,
    pool: Option<std::sync::Arc<SessionPool>>,
) -> StorageResult<std::sync::Arc<dyn StorageBackend>> {
    if let Some(rest) = path
        .strip_prefix("smb://")
        .or_else(|| path.strip_prefix("//"))
    {
        let pool = pool.ok_or_else(|| StorageError::UnsupportedScheme(path.to_string()))?;
        Ok(std::sync::Arc::new(RemoteBackend::parse(rest, pool)?))
    } else {
        Ok(std::sync::Arc::new(LocalBackend::new(path)))
    }
}

const COPY_CHUNK: usize = 4 * 1024 * 1024;

/// Chunked copy between two backends with cancellation observed per chunk.
///
/// Short-circuits when the destination file already exists (its current size
/// is returned, no bytes move). The partial destination file is removed on
/// cancellation or error.
pub async fn transfer(
    src: &dyn StorageBackend,
    src_rel: &str,
    dest: &dyn StorageBackend,
    dest_rel: &str,
    cancel: &CancellationToken,
    events: &ProgressSink,
    label: &str,
) -> StorageResult<u64> {
    if dest.exists(dest_rel).await {
        let size = dest.size(dest_rel).await?;
        debug!(path = dest_rel, size, "destination already present, skipping copy");
        return Ok(size);
    }

    let expected = src.size(src_rel).await?;
    if expected == 0 {
        return Err(StorageError::EmptyFile(src.absolute(src_rel)));
    }

    dest.mkdir(parent_of(dest_rel)).await?;
    let mut reader = src.read(src_rel).await?;
    let mut writer = dest.write(dest_rel).await?;

    let result = copy_chunks(
        &mut reader,
        &mut writer,
        expected,
        cancel,
        events,
        label,
        src_rel,
    )
    .await;
    match result {
        Ok(written) => {
            writer
                .shutdown()
                .await
                .map_err(|source| StorageError::io(dest.absolute(dest_rel), source))?;
            Ok(written)
        }
        Err(err) => {
            drop(writer);
            let _ = dest.remove(dest_rel).await;
            Err(err)
        }
    }
}

async fn copy_chunks(
    reader: &mut ByteReader,
    writer: &mut ByteWriter,
    expected: u64,
    cancel: &CancellationToken,
    events: &ProgressSink,
    label: &str,
    path: &str,
) -> StorageResult<u64> {
    let start = Instant::now();
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut written: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled(path.to_string()));
        }
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|source| StorageError::io(path, source))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|source| StorageError::io(path, source))?;
        written += n as u64;
        let fraction = written as f64 / expected as f64;
        let eta = if written > 0 {
            start.elapsed().mul_f64(expected.saturating_sub(written) as f64 / written as f64)
        } else {
            std::time::Duration::ZERO
        };
        events.emit(ProgressEvent::Copy {
            label: label.to_string(),
            path: path.to_string(),
            fraction: fraction.min(1.0),
            bytes: written,
            eta,
        });
    }
    Ok(written)
}

pub(crate) fn parent_of(rel: &str) -> &str {
    match rel.rfind('/') {
        Some(idx) => &rel[..idx],
        None => "",
    }
}
