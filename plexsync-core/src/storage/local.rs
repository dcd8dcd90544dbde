use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;
use walkdir::WalkDir;

use super::{ByteReader, ByteWriter, StorageBackend, StorageError, StorageResult, TreeEntry};

/// Storage backend over a local directory tree. Reads and writes are real
/// files, so the encoder can seek and no staging is ever needed.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: String,
}

impl LocalBackend {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    fn abs(&self, rel: &str) -> PathBuf {
        Path::new(&self.root).join(rel.trim_start_matches('/'))
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn root(&self) -> &str {
        &self.root
    }

    fn is_streaming(&self) -> bool {
        false
    }

    fn absolute(&self, rel: &str) -> String {
        self.abs(rel).to_string_lossy().to_string()
    }

    async fn read(&self, rel: &str) -> StorageResult<ByteReader> {
        let path = self.abs(rel);
        debug!(path = %path.display(), "opening file for read");
        let file = fs::File::open(&path)
            .await
            .map_err(|source| StorageError::io(path.to_string_lossy(), source))?;
        Ok(Box::new(file))
    }

    async fn write(&self, rel: &str) -> StorageResult<ByteWriter> {
        let path = self.abs(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::io(parent.to_string_lossy(), source))?;
        }
        debug!(path = %path.display(), "creating file for write");
        let file = fs::File::create(&path)
            .await
            .map_err(|source| StorageError::io(path.to_string_lossy(), source))?;
        Ok(Box::new(file))
    }

    async fn size(&self, rel: &str) -> StorageResult<u64> {
        let path = self.abs(rel);
        let meta = fs::metadata(&path)
            .await
            .map_err(|_| StorageError::NotFound(path.to_string_lossy().to_string()))?;
        Ok(meta.len())
    }

    async fn exists(&self, rel: &str) -> bool {
        fs::metadata(self.abs(rel)).await.is_ok()
    }

    async fn remove(&self, rel: &str) -> StorageResult<()> {
        let path = self.abs(rel);
        debug!(path = %path.display(), "removing");
        let meta = fs::metadata(&path)
            .await
            .map_err(|_| StorageError::NotFound(path.to_string_lossy().to_string()))?;
        if meta.is_dir() {
            fs::remove_dir(&path)
                .await
                .map_err(|source| StorageError::io(path.to_string_lossy(), source))
        } else {
            fs::remove_file(&path)
                .await
                .map_err(|source| StorageError::io(path.to_string_lossy(), source))
        }
    }

    async fn remove_all(&self, rel: &str) -> StorageResult<()> {
        let path = self.abs(rel);
        fs::remove_dir_all(&path)
            .await
            .map_err(|source| StorageError::io(path.to_string_lossy(), source))
    }

    async fn mkdir(&self, rel: &str) -> StorageResult<()> {
        let path = self.abs(rel);
        fs::create_dir_all(&path)
            .await
            .map_err(|source| StorageError::io(path.to_string_lossy(), source))
    }

    async fn free_space(&self, base: &str) -> StorageResult<u64> {
        let path = self.abs(base);
        free_space_of(&path)
    }

    async fn list_tree(&self, base: &str) -> StorageResult<Vec<TreeEntry>> {
        let root = self.abs(base);
        let walk_root = root.clone();
        let entries = tokio::task::spawn_blocking(move || -> StorageResult<Vec<TreeEntry>> {
            let mut entries = Vec::new();
            for entry in WalkDir::new(&walk_root).min_depth(1) {
                let entry = entry.map_err(|err| StorageError::Io {
                    source: err
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("walk error")),
                    path: walk_root.to_string_lossy().to_string(),
                })?;
                let rel = entry
                    .path()
                    .strip_prefix(&walk_root)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                let meta = entry.metadata().map_err(|err| StorageError::Io {
                    source: err
                        .into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("metadata error")),
                    path: rel.clone(),
                })?;
                entries.push(TreeEntry {
                    path: rel,
                    size: meta.len(),
                    is_dir: meta.is_dir(),
                });
            }
            Ok(entries)
        })
        .await
        .map_err(|err| StorageError::io(root.to_string_lossy(), std::io::Error::other(err)))??;
        Ok(entries)
    }

    async fn is_empty_dir(&self, rel: &str) -> bool {
        let path = self.abs(rel);
        match fs::read_dir(&path).await {
            Ok(mut dir) => matches!(dir.next_entry().await, Ok(None)),
            Err(_) => false,
        }
    }
}

#[cfg(unix)]
fn free_space_of(path: &Path) -> StorageResult<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| StorageError::NotFound(path.to_string_lossy().to_string()))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(StorageError::io(
            path.to_string_lossy(),
            std::io::Error::last_os_error(),
        ));
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn free_space_of(_path: &Path) -> StorageResult<u64> {
    Ok(u64::MAX)
}
