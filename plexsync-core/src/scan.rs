use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::encoder::MediaProber;
use crate::ordered_map::OrderedMap;
use crate::playlist::{MaterializedSet, PlaylistItem};
use crate::storage::{StorageBackend, StorageResult};

/// An artifact whose measured duration differs from the catalog's by more
/// than this is treated as truncated and removed.
const DURATION_TOLERANCE: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Verified artifacts, recorded under every key of the matching queue
    /// entry.
    pub materialized: MaterializedSet,
    /// Total bytes the surviving artifacts occupy; counts against the
    /// playlist budget.
    pub existing_bytes: u64,
}

/// Scans the destination's library directory before a run: stale or broken
/// artifacts are removed, intact ones become the Materialized Set.
///
/// `keep` is the union of keys across all configured playlists; when present
/// (clean mode), files matching none of them are deleted. Duration
/// verification runs unless `fast` is set, since probing every artifact on a
/// slow destination is expensive.
pub async fn scan_destination(
    dest: &dyn StorageBackend,
    base: &str,
    queue: &OrderedMap<PlaylistItem>,
    keep: Option<&HashSet<String>>,
    prober: &dyn MediaProber,
    container: &str,
    fast: bool,
) -> StorageResult<ScanOutcome> {
    let suffix = format!(".{container}");
    if !dest.exists(base).await {
        return Ok(ScanOutcome::default());
    }
    let entries = dest.list_tree(base).await?;
    let mut outcome = ScanOutcome::default();
    let mut dirs = Vec::new();

    for entry in &entries {
        if entry.is_dir {
            dirs.push(entry.path.clone());
            continue;
        }
        let full_rel = format!("{base}/{}", entry.path);

        let Some(key) = entry.path.strip_suffix(&suffix) else {
            info!(path = %full_rel, "removing artifact with wrong container");
            remove_quietly(dest, &full_rel).await;
            continue;
        };

        if let Some(keep) = keep {
            if !keep.contains(key) {
                info!(path = %full_rel, "removing artifact no playlist references");
                remove_quietly(dest, &full_rel).await;
                continue;
            }
        }

        match queue.get_node(key) {
            Some(node) => {
                let item = queue.value(node);
                if !fast && !duration_matches(dest, &full_rel, item, prober).await {
                    info!(path = %full_rel, "removing truncated artifact");
                    remove_quietly(dest, &full_rel).await;
                    continue;
                }
                outcome
                    .materialized
                    .insert(queue.keys_of(node), entry.size);
                outcome.existing_bytes += entry.size;
            }
            None => {
                // belongs to another playlist sharing this directory
                debug!(path = %full_rel, "keeping artifact outside this queue");
                outcome
                    .materialized
                    .insert(std::slice::from_ref(&key.to_string()), entry.size);
                outcome.existing_bytes += entry.size;
            }
        }
    }

    // prune emptied directories, deepest first
    dirs.sort_by_key(|d| std::cmp::Reverse(d.matches('/').count()));
    for dir in dirs {
        let full_rel = format!("{base}/{dir}");
        if dest.is_empty_dir(&full_rel).await {
            debug!(path = %full_rel, "removing empty directory");
            remove_quietly(dest, &full_rel).await;
        }
    }

    info!(
        base,
        existing = outcome.existing_bytes,
        "destination scan complete"
    );
    Ok(outcome)
}

async fn duration_matches(
    dest: &dyn StorageBackend,
    rel: &str,
    item: &PlaylistItem,
    prober: &dyn MediaProber,
) -> bool {
    if item.duration.is_zero() {
        return true;
    }
    let actual = match prober.actual_duration(dest, rel).await {
        Ok(actual) => actual,
        Err(err) => {
            warn!(path = rel, %err, "artifact probe failed");
            return false;
        }
    };
    let diff = if actual > item.duration {
        actual - item.duration
    } else {
        item.duration - actual
    };
    diff <= DURATION_TOLERANCE
}

async fn remove_quietly(dest: &dyn StorageBackend, rel: &str) {
    if let Err(err) = dest.remove(rel).await {
        warn!(path = rel, %err, "failed to remove");
    }
}
