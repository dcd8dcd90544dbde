use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::budget::{CapacityController, Decision, StopReason};
use crate::catalog::Catalog;
use crate::checkpoint::{spawn_writer, CheckpointStore};
use crate::config::SyncConfig;
use crate::encoder::{Encoder, MediaProber};
use crate::error::{SyncError, SyncResult};
use crate::ordered_map::OrderedMap;
use crate::pipeline::{PipelineError, TranscodePipeline};
use crate::playlist::{interleave_groups, media_key, Playlist, PlaylistItem};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::scan::scan_destination;
use crate::storage::StorageBackend;

/// Outcome of one playlist's run.
#[derive(Debug, Clone)]
pub struct PlaylistReport {
    pub name: String,
    /// Items newly materialized this run.
    pub completed: usize,
    /// Items already on the destination when reached.
    pub skipped: usize,
    /// Items that failed and remain queued for the next run.
    pub failed: usize,
    pub bytes_written: u64,
    pub remaining: u64,
    /// Why iteration stopped early, when it did.
    pub stopped: Option<StopReason>,
    /// Set when the playlist never ran (catalog fetch failed, task panicked).
    pub error: Option<String>,
}

impl PlaylistReport {
    fn broken(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            completed: 0,
            skipped: 0,
            failed: 0,
            bytes_written: 0,
            remaining: 0,
            stopped: None,
            error: Some(message),
        }
    }

    /// A playlist is settled when nothing is left for a future run to retry.
    pub fn settled(&self) -> bool {
        self.failed == 0 && self.error.is_none()
    }
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub playlists: Vec<PlaylistReport>,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn success(&self) -> bool {
        !self.cancelled && self.playlists.iter().all(PlaylistReport::settled)
    }
}

/// Per-playlist result of a standalone clean pass.
#[derive(Debug, Clone)]
pub struct CleanReport {
    pub name: String,
    pub kept_bytes: u64,
}

/// Drives a whole run: builds priority queues from the catalog, runs up to
/// `limits.threads` playlists concurrently, and funnels every queue change
/// through the single checkpoint writer.
pub struct SyncEngine {
    config: SyncConfig,
    catalog: Arc<dyn Catalog>,
    encoder: Arc<dyn Encoder>,
    prober: Arc<dyn MediaProber>,
    source: Arc<dyn StorageBackend>,
    dest: Arc<dyn StorageBackend>,
    checkpoint_path: PathBuf,
    events: ProgressSink,
    cancel: CancellationToken,
}

struct PreparedPlaylist {
    playlist: Playlist,
    fetch_error: Option<String>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncConfig,
        catalog: Arc<dyn Catalog>,
        encoder: Arc<dyn Encoder>,
        prober: Arc<dyn MediaProber>,
        source: Arc<dyn StorageBackend>,
        dest: Arc<dyn StorageBackend>,
        checkpoint_path: impl Into<PathBuf>,
        events: ProgressSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            catalog,
            encoder,
            prober,
            source,
            dest,
            checkpoint_path: checkpoint_path.into(),
            events,
            cancel,
        }
    }

    /// Clones every configured playlist to the destination. `reset` discards
    /// any checkpoint from an interrupted run and rebuilds queues from the
    /// catalog.
    pub async fn run_clone(&self, reset: bool) -> SyncResult<SyncReport> {
        let store = CheckpointStore::new(&self.checkpoint_path);
        let prepared = self.prepare_playlists(reset, &store).await?;
        let keep = Arc::new(keep_union(&prepared));

        let initial: Vec<Playlist> = prepared.iter().map(|p| p.playlist.clone()).collect();
        let (snapshots, writer) = spawn_writer(store, initial);

        let semaphore = Arc::new(Semaphore::new(self.config.limits.threads));
        let mut tasks = JoinSet::new();
        let mut report = SyncReport::default();

        for prep in prepared {
            let name = prep.playlist.name.clone();
            if let Some(message) = prep.fetch_error {
                error!(playlist = %name, %message, "playlist skipped");
                report.playlists.push(PlaylistReport::broken(&name, message));
                continue;
            }
            let worker = PlaylistWorker {
                source: Arc::clone(&self.source),
                dest: Arc::clone(&self.dest),
                prober: Arc::clone(&self.prober),
                pipeline: TranscodePipeline::new(
                    Arc::clone(&self.encoder),
                    Arc::clone(&self.prober),
                    self.config.media_format.clone(),
                    self.config.fast_convert,
                    self.cancel.clone(),
                    self.events.clone(),
                ),
                controller: CapacityController::new(
                    &self.config.limits,
                    self.config.media_format.container.clone(),
                ),
                fast: self.config.fast_convert,
                container: self.config.media_format.container.clone(),
                keep: Arc::clone(&keep),
                snapshots: snapshots.clone(),
                events: self.events.clone(),
                cancel: self.cancel.clone(),
            };
            let semaphore = Arc::clone(&semaphore);
            let playlist = prep.playlist;
            tasks.spawn(async move {
                let _permit = tokio::select! {
                    _ = worker.cancel.cancelled() => {
                        return PlaylistReport::broken(&playlist.name, "run cancelled".into());
                    }
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            return PlaylistReport::broken(&playlist.name, "run shut down".into());
                        }
                    },
                };
                worker.run(playlist).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(playlist_report) => report.playlists.push(playlist_report),
                Err(err) => {
                    error!(%err, "playlist task aborted");
                    report
                        .playlists
                        .push(PlaylistReport::broken("<unknown>", err.to_string()));
                }
            }
        }
        report.cancelled = self.cancel.is_cancelled();

        drop(snapshots);
        let store = writer
            .await
            .map_err(|err| SyncError::Checkpoint(err.to_string()))?;
        if report.success() {
            store.clear();
        }

        if self.config.destination_server.is_some() && !report.cancelled {
            if let Err(err) = self.sync_watched().await {
                warn!(%err, "watched-state propagation failed");
            }
        }
        Ok(report)
    }

    /// Refreshes every destination library and pushes its watch state back to
    /// the source server as each refresh completes.
    pub async fn sync_watched(&self) -> SyncResult<()> {
        let mut refreshed = self.catalog.refresh_libraries(&self.cancel).await?;
        while let Some(library) = refreshed.recv().await {
            info!(library, "library refreshed, syncing watch state");
            if let Err(err) = self.catalog.sync_watched(&library).await {
                warn!(library, %err, "watch-state sync failed");
            }
        }
        Ok(())
    }

    /// Standalone clean pass: removes destination files no configured playlist
    /// references, without materializing anything. Playlists whose clean flag
    /// is off are only consulted for their membership, never touched.
    pub async fn run_clean(&self) -> SyncResult<Vec<CleanReport>> {
        let mut prepared = Vec::with_capacity(self.config.playlists.len());
        for spec in &self.config.playlists {
            let mut playlist = Playlist::new(&spec.name, spec.size.clone(), spec.clean);
            match self.fetch_queue(&spec.name).await {
                Ok(queue) => {
                    playlist.items = queue;
                    prepared.push(PreparedPlaylist {
                        playlist,
                        fetch_error: None,
                    });
                }
                Err(err) => warn!(playlist = %spec.name, %err, "skipping unfetchable playlist"),
            }
        }
        let keep = keep_union(&prepared);

        let mut reports = Vec::new();
        for prep in &prepared {
            let playlist = &prep.playlist;
            if !playlist.clean {
                continue;
            }
            let Some(base) = playlist.base_dir() else {
                continue;
            };
            let keep_keys = keep.get(&base);
            let outcome = scan_destination(
                self.dest.as_ref(),
                &base,
                &playlist.items,
                keep_keys,
                self.prober.as_ref(),
                &self.config.media_format.container,
                self.config.fast_convert,
            )
            .await?;
            reports.push(CleanReport {
                name: playlist.name.clone(),
                kept_bytes: outcome.existing_bytes,
            });
        }
        Ok(reports)
    }

    /// Builds the run's playlist list: checkpointed queues resume as-is,
    /// everything else is fetched fresh, shuffled, and interleaved so no
    /// show dominates the front of the queue.
    async fn prepare_playlists(
        &self,
        reset: bool,
        store: &CheckpointStore,
    ) -> SyncResult<Vec<PreparedPlaylist>> {
        let resumed: HashMap<String, Playlist> = if reset {
            store.clear();
            HashMap::new()
        } else {
            store
                .load()?
                .unwrap_or_default()
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect()
        };

        let mut prepared = Vec::with_capacity(self.config.playlists.len());
        for spec in &self.config.playlists {
            if let Some(saved) = resumed.get(&spec.name) {
                if !saved.items.is_empty() {
                    info!(playlist = %spec.name, queued = saved.items.len(), "resuming from checkpoint");
                    let mut playlist = saved.clone();
                    // config stays authoritative for budget and clean policy
                    playlist.raw_size = spec.size.clone();
                    playlist.clean = spec.clean;
                    prepared.push(PreparedPlaylist {
                        playlist,
                        fetch_error: None,
                    });
                    continue;
                }
            }
            let mut playlist = Playlist::new(&spec.name, spec.size.clone(), spec.clean);
            match self.fetch_queue(&spec.name).await {
                Ok(mut queue) => {
                    queue.shuffle(&mut rand::thread_rng());
                    interleave_groups(&mut queue);
                    playlist.items = queue;
                    prepared.push(PreparedPlaylist {
                        playlist,
                        fetch_error: None,
                    });
                }
                Err(err) => prepared.push(PreparedPlaylist {
                    playlist,
                    fetch_error: Some(err.to_string()),
                }),
            }
        }
        Ok(prepared)
    }

    async fn fetch_queue(&self, name: &str) -> SyncResult<OrderedMap<PlaylistItem>> {
        let items = self.catalog.playlist_items(name).await?;
        let mut queue = OrderedMap::new();
        for item in items {
            queue.insert(item.lookup_keys(), item);
        }
        Ok(queue)
    }
}

/// Union of media keys per library base directory, across all configured
/// playlists. A clean pass must not delete artifacts a sibling playlist
/// sharing the directory still wants.
fn keep_union(prepared: &[PreparedPlaylist]) -> HashMap<String, HashSet<String>> {
    let mut union: HashMap<String, HashSet<String>> = HashMap::new();
    for prep in prepared {
        let Some(base) = prep.playlist.base_dir() else {
            continue;
        };
        let keys = union.entry(base).or_default();
        for (_, item) in prep.playlist.items.iter() {
            for path in &item.paths {
                if let Some(key) = media_key(path) {
                    keys.insert(key);
                }
            }
        }
    }
    union
}

struct PlaylistWorker {
    source: Arc<dyn StorageBackend>,
    dest: Arc<dyn StorageBackend>,
    prober: Arc<dyn MediaProber>,
    pipeline: TranscodePipeline,
    controller: CapacityController,
    fast: bool,
    container: String,
    keep: Arc<HashMap<String, HashSet<String>>>,
    snapshots: mpsc::UnboundedSender<Playlist>,
    events: ProgressSink,
    cancel: CancellationToken,
}

impl PlaylistWorker {
    async fn run(&self, mut playlist: Playlist) -> PlaylistReport {
        let name = playlist.name.clone();
        let mut report = PlaylistReport {
            name: name.clone(),
            completed: 0,
            skipped: 0,
            failed: 0,
            bytes_written: 0,
            remaining: 0,
            stopped: None,
            error: None,
        };
        let Some(base) = playlist.base_dir() else {
            info!(playlist = %name, "playlist is empty, nothing to do");
            self.snapshot(&playlist);
            return report;
        };

        let keep = playlist.clean.then(|| self.keep.get(&base)).flatten();
        let scanned = match scan_destination(
            self.dest.as_ref(),
            &base,
            &playlist.items,
            keep,
            self.prober.as_ref(),
            &self.container,
            self.fast,
        )
        .await
        {
            Ok(scanned) => scanned,
            Err(err) => {
                error!(playlist = %name, %err, "destination scan failed");
                report.error = Some(err.to_string());
                return report;
            }
        };
        let mut materialized = scanned.materialized;

        let free = match self.dest.free_space(&base).await {
            Ok(free) => free,
            // base may not exist yet on a fresh destination
            Err(_) => self.dest.free_space("").await.unwrap_or(0),
        };
        let mut total =
            playlist.total_size(free, self.controller.padding(), scanned.existing_bytes);
        let mut remaining = total.saturating_sub(scanned.existing_bytes);
        playlist.remaining = remaining;

        info!(
            playlist = %name,
            items = playlist.items.len(),
            total,
            existing = scanned.existing_bytes,
            remaining,
            "playlist run starting"
        );
        self.events.emit(ProgressEvent::PlaylistStarted {
            playlist: name.clone(),
            items: playlist.items.len(),
            budget: remaining,
        });

        // primary paths of items that already failed once this run; when one
        // reaches the front again, only failed items are left behind it
        let mut failed_paths: HashSet<String> = HashSet::new();

        loop {
            if self.cancel.is_cancelled() {
                report.error = Some("run cancelled".into());
                break;
            }
            let Some(head) = playlist.items.front() else {
                break;
            };
            let head_path = playlist.items.value(head).paths[0].clone();
            if failed_paths.contains(&head_path) {
                break;
            }

            let decision = self
                .controller
                .decide(
                    &name,
                    &mut playlist.items,
                    &mut materialized,
                    &mut remaining,
                    self.source.as_ref(),
                    self.dest.as_ref(),
                    &self.events,
                )
                .await;
            playlist.remaining = remaining;

            match decision {
                Decision::AlreadyMaterialized => {
                    report.skipped += 1;
                    self.events.emit(ProgressEvent::ItemSkipped {
                        playlist: name.clone(),
                        path: head_path,
                    });
                    playlist.items.remove_entry(head);
                    self.snapshot(&playlist);
                }
                Decision::Stop(reason) => {
                    info!(playlist = %name, ?reason, "stopping playlist");
                    report.stopped = Some(reason);
                    playlist.items = OrderedMap::new();
                    self.snapshot(&playlist);
                    break;
                }
                Decision::Proceed { .. } => {
                    let item = playlist.items.value(head).clone();
                    self.events.emit(ProgressEvent::ItemStarted {
                        playlist: name.clone(),
                        path: head_path.clone(),
                    });
                    match self
                        .pipeline
                        .materialize(self.source.as_ref(), self.dest.as_ref(), &item, &name)
                        .await
                    {
                        Ok((artifact, bytes)) => {
                            if bytes > remaining {
                                // encode overshot the budget; drop the
                                // artifact rather than overflow the device
                                warn!(
                                    playlist = %name,
                                    path = %artifact,
                                    bytes,
                                    remaining,
                                    "artifact exceeds remaining budget"
                                );
                                let _ = self.dest.remove(&artifact).await;
                                report.stopped = Some(StopReason::BudgetExhausted);
                                playlist.items = OrderedMap::new();
                                self.snapshot(&playlist);
                                break;
                            }
                            remaining -= bytes;
                            playlist.remaining = remaining;
                            report.completed += 1;
                            report.bytes_written += bytes;
                            materialized.insert(&item.lookup_keys(), bytes);
                            playlist.items.remove_entry(head);
                            self.events.emit(ProgressEvent::ItemFinished {
                                playlist: name.clone(),
                                path: head_path,
                                bytes,
                            });
                            self.snapshot(&playlist);
                            self.controller
                                .refresh_budget(
                                    self.dest.as_ref(),
                                    &base,
                                    &mut remaining,
                                    &mut total,
                                )
                                .await;
                            playlist.remaining = remaining;
                        }
                        Err(PipelineError::Cancelled) => {
                            report.error = Some("run cancelled".into());
                            break;
                        }
                        Err(err) => {
                            warn!(playlist = %name, path = %head_path, %err, "item failed");
                            report.failed += 1;
                            self.events.emit(ProgressEvent::ItemFailed {
                                playlist: name.clone(),
                                path: head_path.clone(),
                                message: err.to_string(),
                            });
                            // demote to the tail so the rest of the queue
                            // still runs; the checkpoint keeps the item for
                            // the next attempt
                            failed_paths.insert(head_path);
                            playlist.items.insert(item.lookup_keys(), item);
                            self.snapshot(&playlist);
                        }
                    }
                }
            }
        }

        report.remaining = remaining;
        self.snapshot(&playlist);
        self.events.emit(ProgressEvent::PlaylistFinished {
            playlist: name,
            remaining,
        });
        report
    }

    fn snapshot(&self, playlist: &Playlist) {
        let _ = self.snapshots.send(playlist.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::catalog::CatalogError;
    use crate::config::{LimitsSection, MediaFormat, PlaylistSpec};
    use crate::encoder::{
        EncodeProgress, EncodeRequest, EncoderError, MediaProbe,
    };
    use crate::storage::LocalBackend;

    struct FixedCatalog {
        playlists: HashMap<String, Vec<PlaylistItem>>,
        fetches: AtomicUsize,
    }

    impl FixedCatalog {
        fn new(playlists: Vec<(&str, Vec<PlaylistItem>)>) -> Self {
            Self {
                playlists: playlists
                    .into_iter()
                    .map(|(name, items)| (name.to_string(), items))
                    .collect(),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Catalog for FixedCatalog {
        async fn playlist_items(&self, name: &str) -> Result<Vec<PlaylistItem>, CatalogError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.playlists
                .get(name)
                .cloned()
                .ok_or_else(|| CatalogError::PlaylistNotFound(name.to_string()))
        }

        async fn refresh_libraries(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<mpsc::Receiver<String>, CatalogError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn sync_watched(&self, _library_key: &str) -> Result<(), CatalogError> {
            Ok(())
        }
    }

    /// Sources in tests always conform, so materialization is a plain copy
    /// and this encoder must never run.
    struct UnreachableEncoder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Encoder for UnreachableEncoder {
        async fn encode(
            &self,
            _request: EncodeRequest,
            _progress: mpsc::UnboundedSender<EncodeProgress>,
            _cancel: &CancellationToken,
        ) -> Result<u64, EncoderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(EncoderError::Failed("encoder must not run".into()))
        }
    }

    struct ConformingProber;

    #[async_trait]
    impl MediaProber for ConformingProber {
        async fn probe(
            &self,
            backend: &dyn StorageBackend,
            rel: &str,
        ) -> Result<MediaProbe, EncoderError> {
            let size = backend.size(rel).await.unwrap_or(0);
            Ok(MediaProbe {
                duration: Duration::from_secs(60),
                bitrate: 1_000_000,
                height: 480,
                conforming_audio: vec![0],
                size,
                container: "mp4".into(),
            })
        }

        async fn actual_duration(
            &self,
            _backend: &dyn StorageBackend,
            _rel: &str,
        ) -> Result<Duration, EncoderError> {
            Ok(Duration::from_secs(60))
        }
    }

    fn item(path: &str, parent: Option<&str>) -> PlaylistItem {
        PlaylistItem {
            paths: vec![path.to_string()],
            parent: parent.map(str::to_string),
            duration: Duration::from_secs(60),
        }
    }

    fn config(specs: Vec<PlaylistSpec>) -> SyncConfig {
        SyncConfig {
            server: "http://plex:32400".into(),
            destination_server: None,
            token: "t".into(),
            source: "/src".into(),
            destination: "/dst".into(),
            playlists: specs,
            media_format: MediaFormat::default(),
            limits: LimitsSection {
                threads: 2,
                safety_margin_mib: 0,
                worth_floor_mib: 0,
            },
            fast_convert: false,
        }
    }

    fn spec(name: &str, size: Option<&str>) -> PlaylistSpec {
        PlaylistSpec {
            name: name.to_string(),
            size: size.map(str::to_string),
            clean: false,
        }
    }

    struct Fixture {
        _src_dir: TempDir,
        _dst_dir: TempDir,
        state_dir: TempDir,
        engine: SyncEngine,
        encoder_calls: Arc<UnreachableEncoder>,
        catalog: Arc<FixedCatalog>,
        dst_path: std::path::PathBuf,
    }

    fn fixture(
        sources: &[(&str, usize)],
        catalog: FixedCatalog,
        config: SyncConfig,
    ) -> Fixture {
        let src_dir = TempDir::new().unwrap();
        for (path, size) in sources {
            let full = src_dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, vec![0u8; *size]).unwrap();
        }
        let dst_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();

        let source = Arc::new(LocalBackend::new(src_dir.path().to_string_lossy()));
        let dest = Arc::new(LocalBackend::new(dst_dir.path().to_string_lossy()));
        let encoder = Arc::new(UnreachableEncoder {
            calls: AtomicUsize::new(0),
        });
        let catalog = Arc::new(catalog);
        let dst_path = dst_dir.path().to_path_buf();
        let checkpoint = state_dir.path().join("progress.json");

        let engine = SyncEngine::new(
            config,
            Arc::clone(&catalog) as Arc<dyn Catalog>,
            Arc::clone(&encoder) as Arc<dyn Encoder>,
            Arc::new(ConformingProber),
            source,
            dest,
            checkpoint,
            ProgressSink::disabled(),
            CancellationToken::new(),
        );
        Fixture {
            _src_dir: src_dir,
            _dst_dir: dst_dir,
            state_dir,
            engine,
            encoder_calls: encoder,
            catalog,
            dst_path,
        }
    }

    #[tokio::test]
    async fn clones_conforming_sources_by_copy() {
        let catalog = FixedCatalog::new(vec![(
            "Trip",
            vec![
                item("/tv/Show/e1.mp4", Some("Show")),
                item("/tv/Show/e2.mp4", Some("Show")),
            ],
        )]);
        let f = fixture(
            &[("tv/Show/e1.mp4", 100), ("tv/Show/e2.mp4", 200)],
            catalog,
            config(vec![spec("Trip", Some("1 GiB"))]),
        );

        let report = f.engine.run_clone(false).await.unwrap();
        assert!(report.success());
        assert_eq!(report.playlists.len(), 1);
        assert_eq!(report.playlists[0].completed, 2);
        assert_eq!(report.playlists[0].bytes_written, 300);
        assert!(f.dst_path.join("tv/Show/e1.mp4").exists());
        assert!(f.dst_path.join("tv/Show/e2.mp4").exists());
        assert_eq!(f.encoder_calls.calls.load(Ordering::SeqCst), 0);
        // fully settled run clears the checkpoint
        assert!(!f.state_dir.path().join("progress.json").exists());
    }

    #[tokio::test]
    async fn second_run_skips_everything_already_on_destination() {
        let catalog = FixedCatalog::new(vec![(
            "Trip",
            vec![item("/tv/Show/e1.mp4", None)],
        )]);
        let f = fixture(
            &[("tv/Show/e1.mp4", 100)],
            catalog,
            config(vec![spec("Trip", Some("1 GiB"))]),
        );

        let first = f.engine.run_clone(false).await.unwrap();
        assert_eq!(first.playlists[0].completed, 1);

        let second = f.engine.run_clone(false).await.unwrap();
        assert_eq!(second.playlists[0].completed, 0);
        assert_eq!(second.playlists[0].skipped, 1);
        assert_eq!(second.playlists[0].bytes_written, 0);
    }

    #[tokio::test]
    async fn unfetchable_playlist_does_not_block_the_rest() {
        let catalog = FixedCatalog::new(vec![(
            "Good",
            vec![item("/tv/Show/e1.mp4", None)],
        )]);
        let f = fixture(
            &[("tv/Show/e1.mp4", 100)],
            catalog,
            config(vec![spec("Missing", None), spec("Good", Some("1 GiB"))]),
        );

        let report = f.engine.run_clone(false).await.unwrap();
        assert!(!report.success());
        let good = report
            .playlists
            .iter()
            .find(|p| p.name == "Good")
            .unwrap();
        assert_eq!(good.completed, 1);
        let missing = report
            .playlists
            .iter()
            .find(|p| p.name == "Missing")
            .unwrap();
        assert!(missing.error.is_some());
        // failed run keeps the checkpoint for a retry
        assert!(f.state_dir.path().join("progress.json").exists());
    }

    #[tokio::test]
    async fn declared_budget_stops_the_queue() {
        let catalog = FixedCatalog::new(vec![(
            "Tiny",
            vec![
                item("/tv/Show/e1.mp4", None),
                item("/tv/Show/e2.mp4", None),
            ],
        )]);
        // budget fits exactly one item; ordering is shuffled so either file
        // may land first
        let f = fixture(
            &[("tv/Show/e1.mp4", 600), ("tv/Show/e2.mp4", 600)],
            catalog,
            config(vec![spec("Tiny", Some("1000"))]),
        );

        let report = f.engine.run_clone(false).await.unwrap();
        let tiny = &report.playlists[0];
        assert_eq!(tiny.completed, 1);
        assert_eq!(tiny.stopped, Some(StopReason::BudgetExhausted));
        assert_eq!(tiny.bytes_written, 600);
    }

    #[tokio::test]
    async fn resume_reuses_checkpointed_queue_without_refetching() {
        let catalog = FixedCatalog::new(vec![(
            "Trip",
            vec![item("/tv/Show/e1.mp4", None)],
        )]);
        let f = fixture(
            &[("tv/Show/e1.mp4", 100)],
            catalog,
            config(vec![spec("Trip", Some("1 GiB"))]),
        );

        // seed a checkpoint as an interrupted run would have left it
        let mut saved = Playlist::new("Trip", Some("1 GiB".to_string()), false);
        let pending = item("/tv/Show/e1.mp4", None);
        saved.items.insert(pending.lookup_keys(), pending);
        CheckpointStore::new(f.state_dir.path().join("progress.json"))
            .write(std::slice::from_ref(&saved))
            .unwrap();

        let report = f.engine.run_clone(false).await.unwrap();
        assert!(report.success());
        assert_eq!(report.playlists[0].completed, 1);
        assert_eq!(f.catalog.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reset_discards_the_checkpoint_and_refetches() {
        let catalog = FixedCatalog::new(vec![(
            "Trip",
            vec![item("/tv/Show/e1.mp4", None)],
        )]);
        let f = fixture(
            &[("tv/Show/e1.mp4", 100)],
            catalog,
            config(vec![spec("Trip", Some("1 GiB"))]),
        );
        let store = CheckpointStore::new(f.state_dir.path().join("progress.json"));
        let mut saved = Playlist::new("Trip", None, false);
        let stale = item("/tv/Gone/old.mp4", None);
        saved.items.insert(stale.lookup_keys(), stale);
        store.write(std::slice::from_ref(&saved)).unwrap();

        let report = f.engine.run_clone(true).await.unwrap();
        assert!(report.success());
        assert_eq!(report.playlists[0].completed, 1);
        assert_eq!(f.catalog.fetches.load(Ordering::SeqCst), 1);
        assert!(f.dst_path.join("tv/Show/e1.mp4").exists());
    }

    #[tokio::test]
    async fn clean_pass_protects_sibling_playlist_artifacts() {
        let catalog = FixedCatalog::new(vec![
            ("Mine", vec![item("/tv/Show/e1.mp4", None)]),
            ("Theirs", vec![item("/tv/Other/e1.mp4", None)]),
        ]);
        let mut cfg = config(vec![spec("Mine", None), spec("Theirs", None)]);
        cfg.playlists[0].clean = true;
        let f = fixture(&[], catalog, cfg);

        // destination holds an artifact of each playlist plus a stray
        for path in ["tv/Show/e1.mp4", "tv/Other/e1.mp4", "tv/Stray/x.mp4"] {
            let full = f.dst_path.join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, b"x").unwrap();
        }

        let reports = f.engine.run_clean().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(f.dst_path.join("tv/Show/e1.mp4").exists());
        assert!(f.dst_path.join("tv/Other/e1.mp4").exists());
        assert!(!f.dst_path.join("tv/Stray/x.mp4").exists());
    }

    #[test]
    fn keep_union_merges_playlists_sharing_a_base() {
        let mut a = Playlist::new("a", None, true);
        let ia = item("/tv/Show/e1.mp4", None);
        a.items.insert(ia.lookup_keys(), ia);
        let mut b = Playlist::new("b", None, false);
        let ib = item("/tv/Other/e9.mp4", None);
        b.items.insert(ib.lookup_keys(), ib);

        let union = keep_union(&[
            PreparedPlaylist {
                playlist: a,
                fetch_error: None,
            },
            PreparedPlaylist {
                playlist: b,
                fetch_error: None,
            },
        ]);
        let keys = union.get("tv").unwrap();
        assert!(keys.contains("Show/e1"));
        assert!(keys.contains("Other/e9"));
    }
}
