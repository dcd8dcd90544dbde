use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::playlist::Playlist;

/// Durable run state: the full list of playlists with their remaining budgets
/// and queues. Every write replaces the whole file atomically, so a crash can
/// never leave a half-written checkpoint behind.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the last checkpoint; `None` when no prior run left one.
    pub fn load(&self) -> SyncResult<Option<Vec<Playlist>>> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(SyncError::Checkpoint(format!(
                    "failed to read {}: {err}",
                    self.path.display()
                )))
            }
        };
        let playlists = serde_json::from_slice(&content).map_err(|err| {
            SyncError::Checkpoint(format!("failed to parse {}: {err}", self.path.display()))
        })?;
        Ok(Some(playlists))
    }

    pub fn write(&self, playlists: &[Playlist]) -> SyncResult<()> {
        let body = serde_json::to_vec_pretty(playlists)
            .map_err(|err| SyncError::Checkpoint(err.to_string()))?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|err| SyncError::Checkpoint(err.to_string()))?;
        std::io::Write::write_all(&mut tmp, &body)
            .map_err(|err| SyncError::Checkpoint(err.to_string()))?;
        tmp.persist(&self.path)
            .map_err(|err| SyncError::Checkpoint(err.to_string()))?;
        debug!(path = %self.path.display(), playlists = playlists.len(), "checkpoint written");
        Ok(())
    }

    /// Removes the checkpoint after a fully successful run.
    pub fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "checkpoint cleared"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), %err, "failed to clear checkpoint"),
        }
    }
}

/// The single consumer that serializes all checkpoint writes. Pipelines send
/// full playlist snapshots; each one received triggers one atomic rewrite of
/// the complete checkpoint. The store is handed back when the channel closes.
pub fn spawn_writer(
    store: CheckpointStore,
    initial: Vec<Playlist>,
) -> (mpsc::UnboundedSender<Playlist>, JoinHandle<CheckpointStore>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Playlist>();
    let handle = tokio::spawn(async move {
        let mut playlists = initial;
        while let Some(snapshot) = rx.recv().await {
            match playlists.iter_mut().find(|p| p.name == snapshot.name) {
                Some(slot) => *slot = snapshot,
                None => playlists.push(snapshot),
            }
            if let Err(err) = store.write(&playlists) {
                warn!(%err, "checkpoint write failed");
            }
        }
        store
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::playlist::PlaylistItem;

    fn playlist_with_items(name: &str, paths: &[&str]) -> Playlist {
        let mut playlist = Playlist::new(name, Some("10 GB".to_string()), false);
        playlist.remaining = 1234;
        for path in paths {
            let item = PlaylistItem {
                paths: vec![path.to_string()],
                parent: Some("Show".to_string()),
                duration: Duration::from_secs(60),
            };
            playlist.items.insert(item.lookup_keys(), item);
        }
        playlist
    }

    #[test]
    fn round_trips_queue_order_and_budget() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("progress.json"));
        let playlist = playlist_with_items("p", &["/tv/Show/e2.mp4", "/tv/Show/e1.mp4"]);
        store.write(std::slice::from_ref(&playlist)).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "p");
        assert_eq!(loaded[0].remaining, 1234);
        assert_eq!(loaded[0].raw_size.as_deref(), Some("10 GB"));
        let order: Vec<String> = loaded[0]
            .items
            .iter()
            .map(|(_, item)| item.paths[0].clone())
            .collect();
        assert_eq!(order, vec!["/tv/Show/e2.mp4", "/tv/Show/e1.mp4"]);
    }

    #[test]
    fn missing_checkpoint_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("progress.json"));
        assert!(store.load().unwrap().is_none());
        store.clear();
    }

    #[test]
    fn corrupt_checkpoint_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let store = CheckpointStore::new(path);
        assert!(matches!(store.load(), Err(SyncError::Checkpoint(_))));
    }

    #[tokio::test]
    async fn writer_serializes_snapshots_into_one_file() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("progress.json"));
        let a = playlist_with_items("a", &["/tv/A/e1.mp4"]);
        let b = playlist_with_items("b", &["/tv/B/e1.mp4"]);
        let (tx, handle) = spawn_writer(store, vec![a.clone(), b.clone()]);

        let mut updated = a.clone();
        updated.remaining = 99;
        updated.items = crate::ordered_map::OrderedMap::new();
        tx.send(updated).unwrap();
        drop(tx);
        let store = handle.await.unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "a");
        assert_eq!(loaded[0].remaining, 99);
        assert!(loaded[0].items.is_empty());
        assert_eq!(loaded[1].name, "b");
        assert_eq!(loaded[1].items.len(), 1);
    }
}
