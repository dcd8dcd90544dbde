use std::path::Path;

use serde::Deserialize;

use crate::error::{ConfigError, Result};

const DEFAULT_BITRATE_LIMIT: u64 = 3_500_000;
const DEFAULT_HEIGHT_LIMIT: u32 = 720;
const DEFAULT_WIDTH_LIMIT: u32 = 1280;
const DEFAULT_CRF: u8 = 23;
const DEFAULT_CONTAINER: &str = "mp4";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SyncConfig {
    pub server: String,
    #[serde(default)]
    pub destination_server: Option<String>,
    pub token: String,
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub playlists: Vec<PlaylistSpec>,
    #[serde(default)]
    pub media_format: MediaFormat,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(skip)]
    pub fast_convert: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistSpec {
    pub name: String,
    /// Declared byte budget, e.g. "50 GB". When absent the budget is derived
    /// from destination free space at scan time.
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub clean: bool,
}

/// Target format policy for materialized artifacts.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaFormat {
    #[serde(default = "default_bitrate_limit")]
    pub bitrate_limit: u64,
    #[serde(default = "default_height_limit")]
    pub height_limit: u32,
    #[serde(default = "default_width_limit")]
    pub width_limit: u32,
    #[serde(default = "default_crf")]
    pub crf: u8,
    #[serde(default = "default_container")]
    pub container: String,
}

impl Default for MediaFormat {
    fn default() -> Self {
        Self {
            bitrate_limit: DEFAULT_BITRATE_LIMIT,
            height_limit: DEFAULT_HEIGHT_LIMIT,
            width_limit: DEFAULT_WIDTH_LIMIT,
            crf: DEFAULT_CRF,
            container: DEFAULT_CONTAINER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    /// Maximum concurrently running playlist pipelines.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Free-space safety margin subtracted from live free space.
    #[serde(default = "default_safety_margin_mib")]
    pub safety_margin_mib: u64,
    /// Remaining-budget floor under which copying stops being worthwhile.
    #[serde(default = "default_worth_floor_mib")]
    pub worth_floor_mib: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            safety_margin_mib: default_safety_margin_mib(),
            worth_floor_mib: default_worth_floor_mib(),
        }
    }
}

fn default_bitrate_limit() -> u64 {
    DEFAULT_BITRATE_LIMIT
}
fn default_height_limit() -> u32 {
    DEFAULT_HEIGHT_LIMIT
}
fn default_width_limit() -> u32 {
    DEFAULT_WIDTH_LIMIT
}
fn default_crf() -> u8 {
    DEFAULT_CRF
}
fn default_container() -> String {
    DEFAULT_CONTAINER.to_string()
}
fn default_threads() -> usize {
    2
}
fn default_safety_margin_mib() -> u64 {
    500
}
fn default_worth_floor_mib() -> u64 {
    50
}

/// Command-line overrides applied on top of the config file. All fields are
/// optional; merging is a pure function of (file config, overrides).
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub server: Option<String>,
    pub destination_server: Option<String>,
    pub token: Option<String>,
    pub source: Option<String>,
    pub destination: Option<String>,
    /// (name, declared size) pairs; when non-empty they are appended to the
    /// configured playlists.
    pub playlists: Vec<(String, Option<String>)>,
    pub threads: Option<usize>,
    pub fast_convert: bool,
}

impl SyncConfig {
    pub fn merged(mut self, overrides: &CliOverrides) -> Self {
        if let Some(server) = &overrides.server {
            self.server = server.clone();
        }
        if let Some(dest) = &overrides.destination_server {
            self.destination_server = Some(dest.clone());
        }
        if let Some(token) = &overrides.token {
            self.token = token.clone();
        }
        if let Some(source) = &overrides.source {
            self.source = source.clone();
        }
        if let Some(destination) = &overrides.destination {
            self.destination = destination.clone();
        }
        for (name, size) in &overrides.playlists {
            self.playlists.push(PlaylistSpec {
                name: name.clone(),
                size: size.clone(),
                clean: false,
            });
        }
        if let Some(threads) = overrides.threads {
            self.limits.threads = threads;
        }
        self.fast_convert = overrides.fast_convert;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.is_empty() {
            return Err(ConfigError::Invalid {
                field: "source",
                message: "source path must not be empty".into(),
            });
        }
        if self.destination.is_empty() {
            return Err(ConfigError::Invalid {
                field: "destination",
                message: "destination path must not be empty".into(),
            });
        }
        if self.limits.threads == 0 {
            return Err(ConfigError::Invalid {
                field: "limits.threads",
                message: "at least one concurrent playlist is required".into(),
            });
        }
        Ok(())
    }
}

pub fn load_sync_config<P: AsRef<Path>>(path: P) -> Result<SyncConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

/// Parses human byte sizes like "50 GB", "1.5GiB" or plain byte counts.
pub fn parse_bytes(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    let value: f64 = number.trim().parse().ok()?;
    let multiplier: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "kb" => 1_000,
        "kib" | "k" => 1 << 10,
        "mb" => 1_000_000,
        "mib" | "m" => 1 << 20,
        "gb" => 1_000_000_000,
        "gib" | "g" => 1 << 30,
        "tb" => 1_000_000_000_000,
        "tib" | "t" => 1 << 40,
        _ => return None,
    };
    Some((value * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config_applies_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            server = "http://plex:32400"
            token = "abc"
            source = "/mnt/library"
            destination = "/mnt/portable"

            [[playlists]]
            name = "Road Trip"
            size = "50 GB"
            clean = true
            "#,
        )
        .unwrap();

        assert_eq!(config.media_format.container, "mp4");
        assert_eq!(config.media_format.bitrate_limit, 3_500_000);
        assert_eq!(config.media_format.height_limit, 720);
        assert_eq!(config.limits.threads, 2);
        assert_eq!(config.playlists.len(), 1);
        assert!(config.playlists[0].clean);
        config.validate().unwrap();
    }

    #[test]
    fn merge_overrides_wins_over_file_values() {
        let config: SyncConfig = toml::from_str(
            r#"
            server = "http://plex:32400"
            token = "abc"
            source = "/a"
            destination = "/b"
            "#,
        )
        .unwrap();
        let overrides = CliOverrides {
            server: Some("http://other:32400".into()),
            playlists: vec![("Kids".into(), Some("10 GB".into()))],
            threads: Some(4),
            fast_convert: true,
            ..Default::default()
        };
        let merged = config.merged(&overrides);
        assert_eq!(merged.server, "http://other:32400");
        assert_eq!(merged.playlists.len(), 1);
        assert_eq!(merged.limits.threads, 4);
        assert!(merged.fast_convert);
    }

    #[test]
    fn parse_bytes_accepts_common_suffixes() {
        assert_eq!(parse_bytes("1000"), Some(1000));
        assert_eq!(parse_bytes("50 GB"), Some(50_000_000_000));
        assert_eq!(parse_bytes("1.5GiB"), Some((1.5 * (1u64 << 30) as f64) as u64));
        assert_eq!(parse_bytes("200MiB"), Some(200 << 20));
        assert_eq!(parse_bytes("nope"), None);
    }
}
