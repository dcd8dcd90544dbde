use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use plexsync_core::{
    backend_for, load_sync_config, Catalog, CliOverrides, FfmpegEncoder, FfprobeProber,
    PlexCatalog, PlexServer, ProgressSink, SyncConfig, SyncEngine,
};

pub mod commands;
mod render;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] plexsync_core::ConfigError),
    #[error("catalog error: {0}")]
    Catalog(#[from] plexsync_core::CatalogError),
    #[error("storage error: {0}")]
    Storage(#[from] plexsync_core::StorageError),
    #[error("sync error: {0}")]
    Sync(#[from] plexsync_core::SyncError),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Budget-aware Plex playlist sync", long_about = None)]
pub struct Cli {
    /// Path to the sync config file
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,
    /// Checkpoint file recording mid-run progress
    #[arg(long, default_value = "progress.json")]
    pub progress_file: PathBuf,
    /// Log filter, e.g. "info" or "plexsync_core=debug"
    #[arg(long, default_value = "info")]
    pub log_level: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Materializes every configured playlist onto the destination
    Clone(CloneArgs),
    /// Refreshes destination libraries and pushes watch state back
    Sync(ConnectionArgs),
    /// Deletes destination files no configured playlist references
    Clean(ConnectionArgs),
}

#[derive(Args, Debug, Default)]
pub struct ConnectionArgs {
    /// Source Plex server URL, overrides the config file
    #[arg(long)]
    pub server: Option<String>,
    /// Destination Plex server URL
    #[arg(long)]
    pub destination_server: Option<String>,
    /// Plex API token
    #[arg(long)]
    pub token: Option<String>,
    /// Source media root (local path or //host/share)
    #[arg(long)]
    pub source: Option<String>,
    /// Destination media root
    #[arg(long)]
    pub destination: Option<String>,
    /// Playlist to sync, may repeat; appended to the configured list
    #[arg(long = "playlist")]
    pub playlists: Vec<String>,
    /// Byte budget for the playlist at the same position, e.g. "50 GB"
    #[arg(long = "size")]
    pub sizes: Vec<String>,
    /// Concurrent playlist limit
    #[arg(long)]
    pub threads: Option<usize>,
    /// Skip items that would need a re-encode instead of converting them
    #[arg(long)]
    pub fast: bool,
}

#[derive(Args, Debug, Default)]
pub struct CloneArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,
    /// Discard the checkpoint from an interrupted run and start over
    #[arg(long)]
    pub reset: bool,
}

impl ConnectionArgs {
    fn overrides(&self) -> CliOverrides {
        let playlists = self
            .playlists
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), self.sizes.get(i).cloned()))
            .collect();
        CliOverrides {
            server: self.server.clone(),
            destination_server: self.destination_server.clone(),
            token: self.token.clone(),
            source: self.source.clone(),
            destination: self.destination.clone(),
            playlists,
            threads: self.threads,
            fast_convert: self.fast,
        }
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    init_logging(&cli.log_level);

    let connection = match &cli.command {
        Commands::Clone(args) => &args.connection,
        Commands::Sync(args) | Commands::Clean(args) => args,
    };
    let config = load_sync_config(&cli.config)?.merged(&connection.overrides());
    config.validate()?;

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let (events, receiver) = ProgressSink::new();
    let renderer = tokio::spawn(render::drive(receiver));

    let engine = build_engine(&config, &cli.progress_file, events, cancel)?;
    let outcome = match cli.command {
        Commands::Clone(args) => commands::clone::run(&engine, args.reset).await,
        Commands::Sync(_) => commands::sync::run(&engine).await,
        Commands::Clean(_) => commands::clean::run(&engine).await,
    };
    let _ = renderer.await;
    outcome
}

fn build_engine(
    config: &SyncConfig,
    progress_file: &PathBuf,
    events: ProgressSink,
    cancel: CancellationToken,
) -> Result<SyncEngine> {
    let source_server = PlexServer::new(&config.server, &config.token)?;
    let destination_server = match &config.destination_server {
        Some(url) => Some(PlexServer::new(url, &config.token)?),
        None => None,
    };
    let catalog: Arc<dyn Catalog> = Arc::new(PlexCatalog::new(
        source_server,
        destination_server,
        config.media_format.height_limit,
    ));

    let source = backend_for(&config.source, None)?;
    let dest = backend_for(&config.destination, None)?;

    Ok(SyncEngine::new(
        config.clone(),
        catalog,
        Arc::new(FfmpegEncoder::new(config.media_format.clone())),
        Arc::new(FfprobeProber::new("ffprobe")),
        source,
        dest,
        progress_file.clone(),
        events,
        cancel,
    ))
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing current items");
            cancel.cancel();
        }
    });
}

fn init_logging(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn playlist_and_size_flags_pair_up() {
        let cli = Cli::parse_from([
            "plexsyncctl",
            "clone",
            "--playlist",
            "Trip",
            "--size",
            "50 GB",
            "--playlist",
            "Kids",
            "--fast",
        ]);
        let Commands::Clone(args) = cli.command else {
            panic!("expected clone");
        };
        let overrides = args.connection.overrides();
        assert_eq!(
            overrides.playlists,
            vec![
                ("Trip".to_string(), Some("50 GB".to_string())),
                ("Kids".to_string(), None),
            ]
        );
        assert!(overrides.fast_convert);
        assert!(!args.reset);
    }

    #[test]
    fn clone_reset_flag_parses() {
        let cli = Cli::parse_from(["plexsyncctl", "clone", "--reset"]);
        let Commands::Clone(args) = cli.command else {
            panic!("expected clone");
        };
        assert!(args.reset);
    }
}
