use plexsync_core::SyncEngine;

use crate::render::human_bytes;
use crate::Result;

pub async fn run(engine: &SyncEngine, reset: bool) -> Result<()> {
    let report = engine.run_clone(reset).await?;

    for playlist in &report.playlists {
        match &playlist.error {
            Some(message) => {
                println!("{}: did not finish ({message})", playlist.name);
            }
            None => {
                println!(
                    "{}: {} new, {} already present, {} failed, {} written, {} budget left",
                    playlist.name,
                    playlist.completed,
                    playlist.skipped,
                    playlist.failed,
                    human_bytes(playlist.bytes_written),
                    human_bytes(playlist.remaining),
                );
            }
        }
    }
    if report.cancelled {
        println!("run interrupted; progress saved, rerun to resume");
    } else if !report.success() {
        println!("some items failed; rerun to retry them");
    }
    Ok(())
}
