use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::playlist::PlaylistItem;

const REFRESH_POLL: Duration = Duration::from_secs(30);
const REFRESH_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid server url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        source: reqwest::Error,
    },
    #[error("server returned {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("unexpected response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("playlist {0} not found")]
    PlaylistNotFound(String),
    #[error("no destination server configured")]
    NoDestinationServer,
}

/// Remote media catalog. Failures here skip the affected playlist or
/// library; they never abort the whole run.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Playlist membership in playlist order, one entry per logical item
    /// with its candidate variants resolved.
    async fn playlist_items(&self, name: &str) -> Result<Vec<PlaylistItem>, CatalogError>;

    /// Kicks off a rescan of every library on the destination server and
    /// streams the key of each library as its refresh completes.
    async fn refresh_libraries(
        &self,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<String>, CatalogError>;

    /// Pushes watch progress recorded on the destination server back to the
    /// source server for one refreshed library.
    async fn sync_watched(&self, library_key: &str) -> Result<(), CatalogError>;
}

// Plex wire types; numbers that matter arrive as JSON numbers here, unlike
// ffprobe's stringly output.
#[derive(Debug, Default, Deserialize)]
struct Envelope<T> {
    #[serde(rename = "MediaContainer")]
    media_container: T,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataContainer {
    #[serde(rename = "Metadata", default)]
    metadata: Vec<ItemMeta>,
    #[serde(rename = "librarySectionTitle", default)]
    library_section_title: String,
}

#[derive(Debug, Default, Deserialize)]
struct DirectoryContainer {
    #[serde(rename = "Directory", default)]
    directory: Vec<Directory>,
}

#[derive(Debug, Default, Deserialize)]
struct Directory {
    #[serde(default)]
    key: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    refreshing: bool,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
struct ItemMeta {
    #[serde(rename = "ratingKey", default)]
    rating_key: String,
    #[serde(default)]
    title: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(rename = "grandparentTitle", default)]
    grandparent_title: String,
    #[serde(rename = "parentIndex", default)]
    parent_index: i64,
    #[serde(default)]
    index: i64,
    #[serde(rename = "viewCount", default)]
    view_count: u64,
    #[serde(rename = "viewOffset", default)]
    view_offset: u64,
    #[serde(rename = "librarySectionID", default)]
    library_section_id: i64,
    #[serde(rename = "Media", default)]
    media: Vec<Media>,
}

#[derive(Debug, Default, Deserialize)]
struct Media {
    #[serde(default)]
    height: u32,
    /// Milliseconds.
    #[serde(default)]
    duration: u64,
    #[serde(rename = "Part", default)]
    part: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
struct Part {
    #[serde(default)]
    file: String,
}

/// Picks the variant closest to (but not above) the height ceiling, falling
/// back to the first listing. Returns the chosen file plus the primary file
/// as a backup candidate, and the chosen variant's duration. Items with
/// multipart files only are unsupported and yield `None`.
fn select_variant(item: &ItemMeta, height_limit: u32) -> Option<(Vec<String>, Duration)> {
    let primary = item.media.iter().find(|m| m.part.len() == 1)?;
    let mut best = primary;
    for media in &item.media {
        if media.part.len() != 1 {
            continue;
        }
        if media.height <= height_limit
            && (best.height > height_limit || media.height > best.height)
        {
            best = media;
        }
    }
    let mut paths = vec![best.part[0].file.clone()];
    if primary.part[0].file != paths[0] {
        paths.push(primary.part[0].file.clone());
    }
    Some((paths, Duration::from_millis(best.duration)))
}

/// One authenticated Plex endpoint.
pub struct PlexServer {
    base: Url,
    client: reqwest::Client,
}

impl PlexServer {
    pub fn new(base: &str, token: &str) -> Result<Self, CatalogError> {
        let base = Url::parse(base).map_err(|err| CatalogError::InvalidUrl {
            url: base.to_string(),
            message: err.to_string(),
        })?;
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let token_value =
            HeaderValue::from_str(token).map_err(|err| CatalogError::InvalidUrl {
                url: base.to_string(),
                message: format!("token is not a valid header value: {err}"),
            })?;
        headers.insert("X-Plex-Token", token_value);
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| CatalogError::InvalidUrl {
                url: base.to_string(),
                message: err.to_string(),
            })?;
        Ok(Self { base, client })
    }

    fn endpoint(&self, path: &str) -> Result<Url, CatalogError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|err| CatalogError::InvalidUrl {
                url: format!("{}{path}", self.base),
                message: err.to_string(),
            })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, CatalogError> {
        let url = self.endpoint(path)?;
        debug!(%url, "GET");
        let response = self
            .client
            .get(url.clone())
            .query(query)
            .send()
            .await
            .map_err(|source| CatalogError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Status {
                status,
                url: url.to_string(),
            });
        }
        response
            .json()
            .await
            .map_err(|err| CatalogError::Decode {
                url: url.to_string(),
                message: err.to_string(),
            })
    }

    /// GET where only the status matters; some endpoints answer with an
    /// empty body.
    async fn get_ok(&self, path: &str) -> Result<(), CatalogError> {
        let url = self.endpoint(path)?;
        debug!(%url, "GET");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| CatalogError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Status {
                status,
                url: url.to_string(),
            });
        }
        Ok(())
    }

    async fn put(&self, path: &str, query: &[(&str, String)]) -> Result<(), CatalogError> {
        let url = self.endpoint(path)?;
        debug!(%url, "PUT");
        let response = self
            .client
            .put(url.clone())
            .query(query)
            .send()
            .await
            .map_err(|source| CatalogError::Request {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() && status != StatusCode::NO_CONTENT {
            return Err(CatalogError::Status {
                status,
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

/// Catalog over one source server and an optional destination server (the
/// latter is needed only for library refresh and watched-state sync).
pub struct PlexCatalog {
    source: PlexServer,
    destination: Option<PlexServer>,
    height_limit: u32,
}

impl PlexCatalog {
    pub fn new(
        source: PlexServer,
        destination: Option<PlexServer>,
        height_limit: u32,
    ) -> Self {
        Self {
            source,
            destination,
            height_limit,
        }
    }

    fn destination(&self) -> Result<&PlexServer, CatalogError> {
        self.destination
            .as_ref()
            .ok_or(CatalogError::NoDestinationServer)
    }

    async fn episodes(
        &self,
        server: &PlexServer,
        rating_key: &str,
    ) -> Result<Vec<ItemMeta>, CatalogError> {
        let leaves: Envelope<MetadataContainer> = server
            .get(&format!("library/metadata/{rating_key}/allLeaves"), &[])
            .await?;
        Ok(leaves.media_container.metadata)
    }

    /// Pushes the destination's watch progress for one pair of items back to
    /// the source server.
    async fn push_watched(&self, src: &ItemMeta, dest: &ItemMeta) -> Result<(), CatalogError> {
        let mut query: Vec<(&str, String)> = vec![
            ("id", src.rating_key.clone()),
            ("type", src.kind.clone()),
        ];
        let mut update = false;
        if src.view_count == 0 && dest.view_count > 0 {
            query.push(("viewCount", dest.view_count.to_string()));
            update = true;
        }
        if dest.view_offset > 0 {
            query.push(("viewOffset", dest.view_offset.to_string()));
            update = true;
        }
        if !update {
            return Ok(());
        }
        self.source
            .put(
                &format!("library/sections/{}/all", src.library_section_id),
                &query,
            )
            .await
    }
}

#[async_trait]
impl Catalog for PlexCatalog {
    async fn playlist_items(&self, name: &str) -> Result<Vec<PlaylistItem>, CatalogError> {
        let playlists: Envelope<MetadataContainer> = self
            .source
            .get("playlists", &[("title", name)])
            .await?;
        let playlist = playlists
            .media_container
            .metadata
            .first()
            .ok_or_else(|| CatalogError::PlaylistNotFound(name.to_string()))?;

        let listing: Envelope<MetadataContainer> = self
            .source
            .get(&format!("playlists/{}/items", playlist.rating_key), &[])
            .await?;

        let mut items = Vec::new();
        for meta in &listing.media_container.metadata {
            let Some((paths, duration)) = select_variant(meta, self.height_limit) else {
                warn!(title = %meta.title, "skipping item without a single-part variant");
                continue;
            };
            let parent = (meta.kind == "episode" && !meta.grandparent_title.is_empty())
                .then(|| meta.grandparent_title.clone());
            items.push(PlaylistItem {
                paths,
                parent,
                duration,
            });
        }
        info!(playlist = name, items = items.len(), "playlist retrieved");
        Ok(items)
    }

    async fn refresh_libraries(
        &self,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<String>, CatalogError> {
        let dest = self.destination()?;
        dest.get_ok("library/sections/all/refresh").await?;

        let (tx, rx) = mpsc::channel(16);
        let base = dest.base.clone();
        let client = dest.client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let poller = PlexServer { base, client };
            let deadline = tokio::time::Instant::now() + REFRESH_TIMEOUT;
            let mut ticker = tokio::time::interval(REFRESH_POLL);
            ticker.tick().await;
            let mut was_refreshing: std::collections::HashMap<String, bool> =
                std::collections::HashMap::new();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep_until(deadline) => return,
                }
                let sections: Envelope<DirectoryContainer> =
                    match poller.get("library/sections", &[]).await {
                        Ok(sections) => sections,
                        Err(err) => {
                            warn!(%err, "library poll failed");
                            return;
                        }
                    };
                let mut any_refreshing = false;
                for dir in &sections.media_container.directory {
                    if was_refreshing.get(&dir.key).copied().unwrap_or(false)
                        && !dir.refreshing
                    {
                        info!(library = %dir.title, "refresh complete");
                        if tx.send(dir.key.clone()).await.is_err() {
                            return;
                        }
                    }
                    was_refreshing.insert(dir.key.clone(), dir.refreshing);
                    any_refreshing = any_refreshing || dir.refreshing;
                }
                if !any_refreshing {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn sync_watched(&self, library_key: &str) -> Result<(), CatalogError> {
        let dest = self.destination()?;
        let dest_lib: Envelope<MetadataContainer> = dest
            .get(&format!("library/sections/{library_key}/all"), &[])
            .await?;
        let title = &dest_lib.media_container.library_section_title;

        let sections: Envelope<DirectoryContainer> =
            self.source.get("library/sections", &[]).await?;
        let Some(section) = sections
            .media_container
            .directory
            .iter()
            .find(|d| &d.title == title)
        else {
            warn!(library = %title, "source has no matching library");
            return Ok(());
        };
        let src_lib: Envelope<MetadataContainer> = self
            .source
            .get(&format!("library/sections/{}/all", section.key), &[])
            .await?;

        match section.kind.as_str() {
            "show" => {
                for dest_show in &dest_lib.media_container.metadata {
                    let Some(src_show) = src_lib
                        .media_container
                        .metadata
                        .iter()
                        .find(|s| s.title == dest_show.title)
                    else {
                        continue;
                    };
                    let dest_episodes = self.episodes(dest, &dest_show.rating_key).await?;
                    let src_episodes =
                        self.episodes(&self.source, &src_show.rating_key).await?;
                    for dest_episode in &dest_episodes {
                        let matched = src_episodes.iter().find(|s| {
                            s.parent_index == dest_episode.parent_index
                                && s.index == dest_episode.index
                        });
                        if let Some(src_episode) = matched {
                            self.push_watched(src_episode, dest_episode).await?;
                        }
                    }
                }
            }
            "movie" => {
                for dest_movie in &dest_lib.media_container.metadata {
                    let matched = src_lib
                        .media_container
                        .metadata
                        .iter()
                        .find(|s| s.title == dest_movie.title);
                    if let Some(src_movie) = matched {
                        self.push_watched(src_movie, dest_movie).await?;
                    }
                }
            }
            other => debug!(kind = other, "library type has no watch state to sync"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(height: u32, file: &str) -> Media {
        Media {
            height,
            duration: 60_000,
            part: vec![Part {
                file: file.to_string(),
            }],
        }
    }

    #[test]
    fn variant_selection_prefers_tallest_under_the_ceiling() {
        let item = ItemMeta {
            media: vec![
                media(1080, "/tv/Show/e1.mkv"),
                media(480, "/tv480/Show/e1.mp4"),
                media(720, "/tv720/Show/e1.mp4"),
            ],
            ..Default::default()
        };
        let (paths, duration) = select_variant(&item, 720).unwrap();
        assert_eq!(
            paths,
            vec!["/tv720/Show/e1.mp4".to_string(), "/tv/Show/e1.mkv".to_string()]
        );
        assert_eq!(duration, Duration::from_secs(60));
    }

    #[test]
    fn variant_selection_skips_multipart_media() {
        let multipart = ItemMeta {
            media: vec![Media {
                height: 720,
                duration: 0,
                part: vec![Part::default(), Part::default()],
            }],
            ..Default::default()
        };
        assert!(select_variant(&multipart, 720).is_none());

        let mixed = ItemMeta {
            media: vec![
                Media {
                    height: 720,
                    duration: 0,
                    part: vec![Part::default(), Part::default()],
                },
                media(480, "/tv/Show/e1.mp4"),
            ],
            ..Default::default()
        };
        let (paths, _) = select_variant(&mixed, 720).unwrap();
        assert_eq!(paths, vec!["/tv/Show/e1.mp4".to_string()]);
    }

    #[test]
    fn oversized_only_item_keeps_its_primary_variant() {
        let item = ItemMeta {
            media: vec![media(2160, "/tv/Show/e1.mkv")],
            ..Default::default()
        };
        let (paths, _) = select_variant(&item, 720).unwrap();
        assert_eq!(paths, vec!["/tv/Show/e1.mkv".to_string()]);
    }

    #[test]
    fn wire_types_deserialize_plex_shapes() {
        let body = r#"{
            "MediaContainer": {
                "librarySectionTitle": "TV Shows",
                "Metadata": [{
                    "ratingKey": "101",
                    "title": "Pilot",
                    "type": "episode",
                    "grandparentTitle": "Show",
                    "parentIndex": 1,
                    "index": 1,
                    "viewCount": 2,
                    "viewOffset": 12345,
                    "librarySectionID": 3,
                    "Media": [{
                        "height": 720,
                        "duration": 1800000,
                        "Part": [{"file": "/tv/Show/s01e01.mp4"}]
                    }]
                }]
            }
        }"#;
        let parsed: Envelope<MetadataContainer> = serde_json::from_str(body).unwrap();
        let item = &parsed.media_container.metadata[0];
        assert_eq!(item.rating_key, "101");
        assert_eq!(item.view_count, 2);
        assert_eq!(item.library_section_id, 3);
        assert_eq!(item.media[0].part[0].file, "/tv/Show/s01e01.mp4");
        assert_eq!(parsed.media_container.library_section_title, "TV Shows");
    }
}
