pub mod budget;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod encoder;
pub mod error;
pub mod ordered_map;
pub mod orchestrator;
pub mod pipeline;
pub mod playlist;
pub mod progress;
pub mod scan;
pub mod storage;

pub use budget::{CapacityController, Decision, StopReason, MIB};
pub use catalog::{Catalog, CatalogError, PlexCatalog, PlexServer};
pub use checkpoint::CheckpointStore;
pub use config::{
    load_sync_config, parse_bytes, CliOverrides, LimitsSection, MediaFormat, PlaylistSpec,
    SyncConfig,
};
pub use encoder::{Encoder, FfmpegEncoder, FfprobeProber, MediaProbe, MediaProber};
pub use error::{ConfigError, Result, SyncError, SyncResult};
pub use ordered_map::{NodeId, OrderedMap};
pub use orchestrator::{CleanReport, PlaylistReport, SyncEngine, SyncReport};
pub use pipeline::{PipelineError, TranscodePipeline};
pub use playlist::{media_key, MaterializedSet, Playlist, PlaylistItem};
pub use progress::{ProgressEvent, ProgressSink};
pub use storage::{
    backend_for, LocalBackend, RemoteBackend, SessionPool, StorageBackend, StorageError,
};
