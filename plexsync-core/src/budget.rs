use tracing::{info, warn};

use crate::config::LimitsSection;
use crate::ordered_map::OrderedMap;
use crate::playlist::{artifact_rel, MaterializedSet, PlaylistItem};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::storage::StorageBackend;

pub const MIB: u64 = 1 << 20;

/// Why a playlist stopped consuming its queue. Neither variant is an error;
/// both clear the queue and mark the playlist complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Remaining budget fell under the worth-copying floor.
    BelowFloor,
    /// The head item cannot fit even after evicting every evictable tail
    /// entry (or there was no tail left to evict).
    BudgetExhausted,
}

/// Verdict for the head item of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Every key of the head item is already on the destination; dequeue
    /// without touching storage.
    AlreadyMaterialized,
    Proceed { expected: u64 },
    Stop(StopReason),
}

/// Decides, per head item, whether to skip, make space and proceed, or stop.
///
/// Priority order is absolute: eviction only ever removes entries *after* the
/// head, walking from the tail, and the head is never evicted to make room
/// for itself.
pub struct CapacityController {
    floor: u64,
    padding: u64,
    container: String,
}

impl CapacityController {
    pub fn new(limits: &LimitsSection, container: impl Into<String>) -> Self {
        Self {
            floor: limits.worth_floor_mib * MIB,
            padding: limits.safety_margin_mib * MIB,
            container: container.into(),
        }
    }

    pub fn padding(&self) -> u64 {
        self.padding
    }

    /// Expected on-destination cost of an item: the source size of its first
    /// resolvable candidate variant. An unresolvable item reports zero and is
    /// left for the pipeline to fail properly.
    pub async fn expected_size(
        &self,
        source: &dyn StorageBackend,
        item: &PlaylistItem,
    ) -> u64 {
        for path in &item.paths {
            if let Ok(size) = source.size(path.trim_start_matches('/')).await {
                return size;
            }
        }
        0
    }

    pub async fn decide(
        &self,
        playlist: &str,
        queue: &mut OrderedMap<PlaylistItem>,
        materialized: &mut MaterializedSet,
        remaining: &mut u64,
        source: &dyn StorageBackend,
        dest: &dyn StorageBackend,
        events: &ProgressSink,
    ) -> Decision {
        let head = match queue.front() {
            Some(head) => head,
            None => return Decision::Stop(StopReason::BudgetExhausted),
        };
        let keys = queue.value(head).lookup_keys();
        if materialized.contains_all(&keys) {
            return Decision::AlreadyMaterialized;
        }
        if *remaining < self.floor {
            info!(playlist, remaining = *remaining, "budget below worth-copying floor");
            return Decision::Stop(StopReason::BelowFloor);
        }

        let expected = self.expected_size(source, queue.value(head)).await;
        if expected <= *remaining {
            return Decision::Proceed { expected };
        }
        if queue.next(head).is_none() {
            // last entry, nothing behind it to evict
            return Decision::Stop(StopReason::BudgetExhausted);
        }

        info!(
            playlist,
            needed = expected - *remaining,
            "making space for head item"
        );
        let mut cursor = queue.back();
        while let Some(node) = cursor {
            if node == head || *remaining >= expected {
                break;
            }
            let node_keys = queue.value(node).lookup_keys();
            if materialized.contains_any(&node_keys) {
                // credit only bytes the destination actually gave back; a
                // failed removal leaves the entry accounted for
                if let Some(freed) = self.evict(playlist, queue.value(node), dest, events).await {
                    materialized.remove_entry(&node_keys);
                    *remaining += freed;
                }
            }
            cursor = queue.prev(node);
        }

        if expected <= *remaining {
            Decision::Proceed { expected }
        } else {
            Decision::Stop(StopReason::BudgetExhausted)
        }
    }

    /// Removes an evicted entry's artifact from the destination and returns
    /// the bytes freed, or `None` when no artifact could be removed.
    /// Candidate variants may live under different library roots, so every
    /// derived artifact path is tried.
    async fn evict(
        &self,
        playlist: &str,
        item: &PlaylistItem,
        dest: &dyn StorageBackend,
        events: &ProgressSink,
    ) -> Option<u64> {
        for path in &item.paths {
            let rel = artifact_rel(path, &self.container);
            if !dest.exists(&rel).await {
                continue;
            }
            let reclaimed = dest.size(&rel).await.unwrap_or(0);
            match dest.remove(&rel).await {
                Ok(()) => {
                    info!(playlist, path = %rel, reclaimed, "evicted lower-priority artifact");
                    events.emit(ProgressEvent::Evicted {
                        playlist: playlist.to_string(),
                        path: rel,
                        reclaimed,
                    });
                    return Some(reclaimed);
                }
                Err(err) => warn!(playlist, path = %rel, %err, "failed to remove artifact"),
            }
        }
        None
    }

    /// Re-queries live free space and shrinks both counters when the disk
    /// holds less room than the budget assumes.
    pub async fn refresh_budget(
        &self,
        dest: &dyn StorageBackend,
        base: &str,
        remaining: &mut u64,
        total: &mut u64,
    ) {
        let free = match dest.free_space(base).await {
            Ok(free) => free,
            Err(_) => return,
        };
        if free < *remaining {
            let corrected = free.saturating_sub(self.padding);
            warn!(
                free,
                remaining = *remaining,
                corrected,
                "free space below remaining budget, shrinking"
            );
            *total = total.saturating_sub(*remaining - corrected);
            *remaining = corrected;
        }
    }
}
