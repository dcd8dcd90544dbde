use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::parse_bytes;
use crate::ordered_map::OrderedMap;

/// One logical media entry of a playlist queue.
///
/// `paths` holds candidate source locations, preferred variant first. All
/// variants describe the same content, so every derived lookup key resolves
/// to the same queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub paths: Vec<String>,
    /// Grouping identifier (series title) used by the fairness rotation.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub duration: Duration,
}

impl PlaylistItem {
    /// Lookup keys of every candidate path, deduplicated, preferred-first.
    pub fn lookup_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            if let Some(key) = media_key(path) {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }
}

/// Derives the lookup key of a media path: the path without its library base
/// directory, leading slash and file extension. Variants of the same content
/// that differ only in quality or container share a key.
pub fn media_key(path: &str) -> Option<String> {
    let trimmed = path.trim_start_matches('/');
    let (_, rest) = trimmed.split_once('/')?;
    if rest.is_empty() {
        return None;
    }
    let dot = match rest.rfind('.') {
        Some(idx) if idx > rest.rfind('/').map_or(0, |s| s + 1) => idx,
        _ => rest.len(),
    };
    Some(rest[..dot].to_string())
}

/// Destination-relative path of the artifact a source path materializes to:
/// the source path with its extension swapped for the target container.
pub fn artifact_rel(source_path: &str, container: &str) -> String {
    let rel = source_path.trim_start_matches('/');
    let stem = match rel.rfind('.') {
        Some(idx) if idx > rel.rfind('/').map_or(0, |s| s + 1) => &rel[..idx],
        _ => rel,
    };
    format!("{stem}.{container}")
}

/// A playlist's work queue plus its byte budget, exactly the shape persisted
/// in the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playlist {
    pub name: String,
    /// Declared budget as configured ("50 GB"); empty means derive the budget
    /// from destination free space at scan time.
    #[serde(default)]
    pub raw_size: Option<String>,
    #[serde(default)]
    pub clean: bool,
    /// Remaining byte budget for this run.
    #[serde(default)]
    pub remaining: u64,
    #[serde(default)]
    pub items: OrderedMap<PlaylistItem>,
}

impl Playlist {
    pub fn new(name: impl Into<String>, raw_size: Option<String>, clean: bool) -> Self {
        Self {
            name: name.into(),
            raw_size,
            clean,
            remaining: 0,
            items: OrderedMap::new(),
        }
    }

    pub fn declared_size(&self) -> Option<u64> {
        self.raw_size.as_deref().and_then(parse_bytes)
    }

    /// Library base directory, taken from the least-preferred variant of the
    /// head item (the variant paths share one library root).
    pub fn base_dir(&self) -> Option<String> {
        let head = self.items.front()?;
        let paths = &self.items.value(head).paths;
        let last = paths.last()?;
        let trimmed = last.trim_start_matches('/');
        let base = trimmed.split_once('/').map(|(b, _)| b).unwrap_or(trimmed);
        Some(base.to_string())
    }

    /// Total budget for a run: the declared size always wins; otherwise it is
    /// live free space minus the safety margin, plus what already sits on the
    /// destination (existing artifacts count against the same budget).
    pub fn total_size(&self, free: u64, padding: u64, existing: u64) -> u64 {
        match self.declared_size() {
            Some(declared) => declared,
            None => free.saturating_sub(padding) + existing,
        }
    }
}

/// Artifacts already present and verified on the destination, recorded under
/// every lookup key of the matching queue entry so the "already materialized"
/// check can require all keys.
#[derive(Debug, Clone, Default)]
pub struct MaterializedSet {
    sizes: HashMap<String, u64>,
}

impl MaterializedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, keys: &[String], size: u64) {
        for key in keys {
            self.sizes.insert(key.clone(), size);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sizes.contains_key(key)
    }

    pub fn contains_all(&self, keys: &[String]) -> bool {
        !keys.is_empty() && keys.iter().all(|k| self.sizes.contains_key(k))
    }

    pub fn contains_any(&self, keys: &[String]) -> bool {
        keys.iter().any(|k| self.sizes.contains_key(k))
    }

    /// Removes every key of an entry, returning its recorded size once.
    pub fn remove_entry(&mut self, keys: &[String]) -> u64 {
        let mut reclaimed = 0;
        for key in keys {
            if let Some(size) = self.sizes.remove(key) {
                reclaimed = reclaimed.max(size);
            }
        }
        reclaimed
    }

    pub fn size_of(&self, key: &str) -> Option<u64> {
        self.sizes.get(key).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

/// Round-robin reordering so no parent group occupies two consecutive queue
/// positions while another group still has pending entries. Runs once after
/// the construction shuffle; queues containing standalone items (no parent)
/// are left alone.
pub fn interleave_groups(queue: &mut OrderedMap<PlaylistItem>) {
    let mut groups: Vec<String> = Vec::new();
    for (_, item) in queue.iter() {
        match item.parent.as_deref() {
            Some(parent) if !parent.is_empty() => {
                if !groups.iter().any(|g| g == parent) {
                    groups.push(parent.to_string());
                }
            }
            _ => return,
        }
    }
    if groups.len() < 2 {
        return;
    }

    let mut cursor = queue.front();
    let mut turn = 0usize;
    while let Some(pos) = cursor {
        if groups.is_empty() {
            break;
        }
        let slot = turn % groups.len();
        let want = groups[slot].clone();
        if queue.value(pos).parent.as_deref() == Some(want.as_str()) {
            cursor = queue.next(pos);
            turn += 1;
            continue;
        }
        let mut scan = queue.next(pos);
        let mut found = None;
        while let Some(node) = scan {
            if queue.value(node).parent.as_deref() == Some(want.as_str()) {
                found = Some(node);
                break;
            }
            scan = queue.next(node);
        }
        match found {
            Some(node) => {
                queue.swap(pos, node);
                cursor = queue.next(pos);
                turn += 1;
            }
            None => {
                // group exhausted, drop it from the rotation
                groups.remove(slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(path: &str, parent: Option<&str>) -> PlaylistItem {
        PlaylistItem {
            paths: vec![path.to_string()],
            parent: parent.map(str::to_string),
            duration: Duration::from_secs(1200),
        }
    }

    fn push(queue: &mut OrderedMap<PlaylistItem>, item: PlaylistItem) {
        queue.insert(item.lookup_keys(), item);
    }

    fn order(queue: &OrderedMap<PlaylistItem>) -> Vec<String> {
        queue
            .iter()
            .map(|(_, item)| item.paths[0].clone())
            .collect()
    }

    #[test]
    fn media_key_strips_base_dir_and_extension() {
        assert_eq!(
            media_key("/tv/Show Name/s01e01.mkv").as_deref(),
            Some("Show Name/s01e01")
        );
        assert_eq!(
            media_key("movies/Some.Movie.2019/film.mp4").as_deref(),
            Some("Some.Movie.2019/film")
        );
        assert_eq!(media_key("orphan.mp4"), None);
        assert_eq!(media_key("/tv/"), None);
    }

    #[test]
    fn lookup_keys_deduplicate_variants() {
        let item = PlaylistItem {
            paths: vec![
                "/tv720/Show/e1.mp4".to_string(),
                "/tv/Show/e1.mkv".to_string(),
            ],
            parent: Some("Show".to_string()),
            duration: Duration::ZERO,
        };
        assert_eq!(item.lookup_keys(), vec!["Show/e1".to_string()]);
    }

    #[test]
    fn interleave_alternates_two_groups() {
        let mut queue = OrderedMap::new();
        // shuffled order: A2 B1 A1 A3 B2
        push(&mut queue, item("/tv/A/e2.mp4", Some("A")));
        push(&mut queue, item("/tv/B/e1.mp4", Some("B")));
        push(&mut queue, item("/tv/A/e1.mp4", Some("A")));
        push(&mut queue, item("/tv/A/e3.mp4", Some("A")));
        push(&mut queue, item("/tv/B/e2.mp4", Some("B")));

        interleave_groups(&mut queue);

        let parents: Vec<String> = queue
            .iter()
            .map(|(_, i)| i.parent.clone().unwrap())
            .collect();
        assert_eq!(parents, vec!["A", "B", "A", "B", "A"]);
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn interleave_skips_queues_with_standalone_items() {
        let mut queue = OrderedMap::new();
        push(&mut queue, item("/movies/one/a.mp4", None));
        push(&mut queue, item("/movies/two/b.mp4", None));
        let before = order(&queue);
        interleave_groups(&mut queue);
        assert_eq!(order(&queue), before);
    }

    #[test]
    fn interleave_handles_exhausted_groups() {
        let mut queue = OrderedMap::new();
        push(&mut queue, item("/tv/A/e1.mp4", Some("A")));
        push(&mut queue, item("/tv/A/e2.mp4", Some("A")));
        push(&mut queue, item("/tv/A/e3.mp4", Some("A")));
        push(&mut queue, item("/tv/B/e1.mp4", Some("B")));

        interleave_groups(&mut queue);

        let parents: Vec<String> = queue
            .iter()
            .map(|(_, i)| i.parent.clone().unwrap())
            .collect();
        // no two consecutive entries share a group while both have entries
        for pair in parents.windows(2).take(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn materialized_set_requires_every_key() {
        let mut set = MaterializedSet::new();
        set.insert(&["Show/e1".to_string(), "Show720/e1".to_string()], 100);
        assert!(set.contains_all(&["Show/e1".to_string(), "Show720/e1".to_string()]));
        assert!(!set.contains_all(&["Show/e1".to_string(), "Other/e9".to_string()]));
        assert!(set.contains_any(&["Other/e9".to_string(), "Show/e1".to_string()]));
        assert_eq!(
            set.remove_entry(&["Show/e1".to_string(), "Show720/e1".to_string()]),
            100
        );
        assert!(set.is_empty());
    }

    #[test]
    fn total_size_prefers_declared_budget() {
        let declared = Playlist::new("p", Some("1 GB".to_string()), false);
        assert_eq!(declared.total_size(10_000, 500, 300), 1_000_000_000);

        let derived = Playlist::new("p", None, false);
        assert_eq!(derived.total_size(10_000, 500, 300), 9_800);
    }

    #[test]
    fn base_dir_comes_from_head_item() {
        let mut playlist = Playlist::new("p", None, false);
        push(
            &mut playlist.items,
            PlaylistItem {
                paths: vec![
                    "/tv720/Show/e1.mp4".to_string(),
                    "/tv/Show/e1.mkv".to_string(),
                ],
                parent: Some("Show".to_string()),
                duration: Duration::ZERO,
            },
        );
        assert_eq!(playlist.base_dir().as_deref(), Some("tv"));
    }
}
