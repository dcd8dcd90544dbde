use std::time::Duration;

use tokio::sync::mpsc;

/// User-facing progress feed. Events carry everything a renderer needs; the
/// engine never formats output itself.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    PlaylistStarted {
        playlist: String,
        items: usize,
        budget: u64,
    },
    PlaylistFinished {
        playlist: String,
        remaining: u64,
    },
    ItemStarted {
        playlist: String,
        path: String,
    },
    ItemFinished {
        playlist: String,
        path: String,
        bytes: u64,
    },
    ItemSkipped {
        playlist: String,
        path: String,
    },
    ItemFailed {
        playlist: String,
        path: String,
        message: String,
    },
    Evicted {
        playlist: String,
        path: String,
        reclaimed: u64,
    },
    /// Byte-level copy progress.
    Copy {
        label: String,
        path: String,
        fraction: f64,
        bytes: u64,
        eta: Duration,
    },
    /// Encoder progress, sampled from the running process.
    Transcode {
        label: String,
        path: String,
        fraction: f64,
        speed: f64,
        eta: Duration,
        bytes: u64,
    },
}

/// Send side of the progress feed. Emitting never blocks and never fails:
/// a closed or absent receiver simply drops the event.
#[derive(Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything. Used when no renderer is attached.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitted_events_arrive_in_order() {
        let (sink, mut rx) = ProgressSink::new();
        sink.emit(ProgressEvent::ItemStarted {
            playlist: "p".into(),
            path: "a.mp4".into(),
        });
        sink.emit(ProgressEvent::ItemFinished {
            playlist: "p".into(),
            path: "a.mp4".into(),
            bytes: 7,
        });
        assert!(matches!(
            rx.recv().await,
            Some(ProgressEvent::ItemStarted { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ProgressEvent::ItemFinished { bytes: 7, .. })
        ));
    }

    #[test]
    fn disabled_sink_and_dropped_receiver_are_silent() {
        let sink = ProgressSink::disabled();
        sink.emit(ProgressEvent::ItemSkipped {
            playlist: "p".into(),
            path: "a".into(),
        });

        let (sink, rx) = ProgressSink::new();
        drop(rx);
        sink.emit(ProgressEvent::ItemSkipped {
            playlist: "p".into(),
            path: "a".into(),
        });
    }
}
