use plexsync_core::SyncEngine;

use crate::render::human_bytes;
use crate::Result;

pub async fn run(engine: &SyncEngine) -> Result<()> {
    let reports = engine.run_clean().await?;
    if reports.is_empty() {
        println!("no playlist has cleaning enabled");
        return Ok(());
    }
    for report in reports {
        println!(
            "{}: cleaned, {} of referenced media kept",
            report.name,
            human_bytes(report.kept_bytes)
        );
    }
    Ok(())
}
