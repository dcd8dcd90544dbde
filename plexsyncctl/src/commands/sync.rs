use plexsync_core::SyncEngine;

use crate::Result;

pub async fn run(engine: &SyncEngine) -> Result<()> {
    engine.sync_watched().await?;
    println!("watch state synced");
    Ok(())
}
