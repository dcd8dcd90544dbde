use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use plexsync_core::ProgressEvent;

/// Consumes the engine's progress feed and prints one line per event.
/// Byte-level progress is throttled to whole-percent changes per path so a
/// slow copy does not flood the terminal.
pub async fn drive(mut events: UnboundedReceiver<ProgressEvent>) {
    let mut last_percent: Option<(String, u32)> = None;
    while let Some(event) = events.recv().await {
        match event {
            ProgressEvent::PlaylistStarted {
                playlist,
                items,
                budget,
            } => {
                println!(
                    "[{playlist}] starting: {items} queued, {} budget",
                    human_bytes(budget)
                );
            }
            ProgressEvent::PlaylistFinished {
                playlist,
                remaining,
            } => {
                println!("[{playlist}] done, {} budget left", human_bytes(remaining));
            }
            ProgressEvent::ItemStarted { playlist, path } => {
                println!("[{playlist}] {path}");
            }
            ProgressEvent::ItemFinished {
                playlist,
                path,
                bytes,
            } => {
                println!("[{playlist}] {path}: {}", human_bytes(bytes));
            }
            ProgressEvent::ItemSkipped { playlist, path } => {
                println!("[{playlist}] {path}: already present");
            }
            ProgressEvent::ItemFailed {
                playlist,
                path,
                message,
            } => {
                println!("[{playlist}] {path}: FAILED ({message})");
            }
            ProgressEvent::Evicted {
                playlist,
                path,
                reclaimed,
            } => {
                println!(
                    "[{playlist}] evicted {path}, reclaimed {}",
                    human_bytes(reclaimed)
                );
            }
            ProgressEvent::Copy {
                label,
                path,
                fraction,
                eta,
                ..
            } => {
                let percent = (fraction * 100.0) as u32;
                if throttled(&mut last_percent, &path, percent) {
                    println!(
                        "[{label}] copying {path}: {percent}%, {} left",
                        human_duration(eta)
                    );
                }
            }
            ProgressEvent::Transcode {
                label,
                path,
                fraction,
                speed,
                eta,
                ..
            } => {
                let percent = (fraction * 100.0) as u32;
                if throttled(&mut last_percent, &path, percent) {
                    println!(
                        "[{label}] converting {path}: {percent}% at {speed:.1}x, {} left",
                        human_duration(eta)
                    );
                }
            }
        }
    }
}

fn throttled(last: &mut Option<(String, u32)>, path: &str, percent: u32) -> bool {
    match last {
        Some((p, v)) if p == path && *v == percent => false,
        _ => {
            *last = Some((path.to_string(), percent));
            true
        }
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
