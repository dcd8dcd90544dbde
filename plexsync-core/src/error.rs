use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::pipeline::PipelineError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("invalid config value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Run-level error. Collaborator failures inside a single playlist never
/// surface here; they are logged and the playlist is skipped.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ConfigError>;
pub type SyncResult<T> = std::result::Result<T, SyncError>;
