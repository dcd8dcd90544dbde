use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MediaFormat;
use crate::encoder::{
    EncodeInput, EncodeMode, EncodeOutput, EncodeProgress, EncodeRequest, Encoder, EncoderError,
    MediaProbe, MediaProber,
};
use crate::playlist::{artifact_rel, PlaylistItem};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::storage::{parent_of, transfer, LocalBackend, StorageBackend, StorageError};

/// Re-encoding that saves less than this is considered a wash; the source is
/// copied byte-for-byte instead.
const SIZE_TOLERANCE: u64 = 20 * (1 << 20);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("item requires conversion but fast mode is enabled")]
    RequiresConversion,
    #[error("encoder produced an empty artifact for {0}")]
    EmptyOutput(String),
    #[error("no readable source variant")]
    NoSource,
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("materialization cancelled")]
    Cancelled,
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Materializes one item onto the destination: probe, decide, convert if
/// needed, and absorb non-seekable-stream failures by staging through local
/// temporary files.
pub struct TranscodePipeline {
    encoder: Arc<dyn Encoder>,
    prober: Arc<dyn MediaProber>,
    format: MediaFormat,
    fast: bool,
    cancel: CancellationToken,
    events: ProgressSink,
}

impl TranscodePipeline {
    pub fn new(
        encoder: Arc<dyn Encoder>,
        prober: Arc<dyn MediaProber>,
        format: MediaFormat,
        fast: bool,
        cancel: CancellationToken,
        events: ProgressSink,
    ) -> Self {
        Self {
            encoder,
            prober,
            format,
            fast,
            cancel,
            events,
        }
    }

    /// Tries each candidate variant in preference order until one
    /// materializes. Returns the artifact's destination-relative path and
    /// final byte size.
    pub async fn materialize(
        &self,
        source: &dyn StorageBackend,
        dest: &dyn StorageBackend,
        item: &PlaylistItem,
        label: &str,
    ) -> PipelineResult<(String, u64)> {
        let mut last_err = PipelineError::NoSource;
        for path in &item.paths {
            let rel = path.trim_start_matches('/');
            if !source.exists(rel).await {
                continue;
            }
            match self.materialize_variant(source, dest, rel, label).await {
                Ok(result) => return Ok(result),
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(err) => {
                    warn!(path = rel, %err, "variant failed, trying next");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    async fn materialize_variant(
        &self,
        source: &dyn StorageBackend,
        dest: &dyn StorageBackend,
        rel: &str,
        label: &str,
    ) -> PipelineResult<(String, u64)> {
        let out_rel = artifact_rel(rel, &self.format.container);
        let target_ext = format!(".{}", self.format.container);
        let probe = self.prober.probe(source, rel).await?;
        let src_size = source.size(rel).await.unwrap_or(probe.size);

        if probe.meets(&self.format) && rel.ends_with(&target_ext) {
            debug!(path = rel, "source conforms, copying byte-for-byte");
            let size = self.copy(source, rel, dest, &out_rel, label).await?;
            return Ok((out_rel, size));
        }

        let mode = if probe.meets(&self.format) {
            EncodeMode::Remux
        } else if self.fast {
            return Err(PipelineError::RequiresConversion);
        } else {
            EncodeMode::Reencode
        };

        let mut total = self
            .convert(source, rel, dest, &out_rel, mode, &probe, label)
            .await?;

        // re-encoding an already-small file buys nothing; keep the original
        if rel.ends_with(&target_ext)
            && total > 0
            && total + SIZE_TOLERANCE >= src_size
        {
            info!(path = rel, "converted artifact not smaller, copying source instead");
            let _ = dest.remove(&out_rel).await;
            total = self.copy(source, rel, dest, &out_rel, label).await?;
        }

        if total == 0 {
            let _ = dest.remove(&out_rel).await;
            return Err(PipelineError::EmptyOutput(out_rel));
        }
        Ok((out_rel, total))
    }

    /// Chunked copy between backends. A cancelled copy is a run shutdown,
    /// not an item failure, so it surfaces as `Cancelled` rather than a
    /// storage error.
    async fn copy(
        &self,
        source: &dyn StorageBackend,
        rel: &str,
        dest: &dyn StorageBackend,
        out_rel: &str,
        label: &str,
    ) -> PipelineResult<u64> {
        match transfer(source, rel, dest, out_rel, &self.cancel, &self.events, label).await {
            Err(StorageError::Cancelled(_)) => Err(PipelineError::Cancelled),
            other => Ok(other?),
        }
    }

    /// Runs the conversion, retrying once through a staged input and once
    /// through a staged output when the encoder rejects a non-seekable pipe.
    /// Staged files live in temp directories torn down on drop.
    async fn convert(
        &self,
        source: &dyn StorageBackend,
        rel: &str,
        dest: &dyn StorageBackend,
        out_rel: &str,
        mode: EncodeMode,
        probe: &MediaProbe,
        label: &str,
    ) -> PipelineResult<u64> {
        let mut mode = mode;
        let mut staged_input: Option<(tempfile::TempDir, LocalBackend)> = None;
        let mut staged_output: Option<(tempfile::TempDir, LocalBackend)> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let in_backend: &dyn StorageBackend = match &staged_input {
                Some((_, local)) => local,
                None => source,
            };
            let out_backend: &dyn StorageBackend = match &staged_output {
                Some((_, local)) => local,
                None => dest,
            };
            let input_streaming = in_backend.is_streaming();
            let output_streaming = out_backend.is_streaming();

            let result = self
                .run_encode(in_backend, rel, out_backend, out_rel, mode, probe, label)
                .await;

            match result {
                Ok(total) => {
                    if let Some((_, local)) = staged_output.as_ref() {
                        debug!(path = out_rel, "moving staged artifact to destination");
                        let moved = self.copy(local, out_rel, dest, out_rel, label).await?;
                        return Ok(moved.max(total));
                    }
                    return Ok(total);
                }
                Err(PipelineError::Encoder(EncoderError::InputBuffering))
                    if input_streaming && staged_input.is_none() =>
                {
                    info!(path = rel, "staging source through local file");
                    let tmp = tempfile::tempdir().map_err(EncoderError::Io)?;
                    let local = LocalBackend::new(tmp.path().to_string_lossy());
                    self.copy(source, rel, &local, rel, label).await?;
                    staged_input = Some((tmp, local));
                }
                Err(PipelineError::Encoder(EncoderError::OutputBuffering))
                    if output_streaming && staged_output.is_none() =>
                {
                    info!(path = out_rel, "staging output through local file");
                    let tmp = tempfile::tempdir().map_err(EncoderError::Io)?;
                    let local = LocalBackend::new(tmp.path().to_string_lossy());
                    staged_output = Some((tmp, local));
                }
                Err(PipelineError::Encoder(EncoderError::UnsupportedCodec))
                    if mode == EncodeMode::Remux =>
                {
                    if self.fast {
                        return Err(PipelineError::RequiresConversion);
                    }
                    info!(path = rel, "container rejects copied codec, re-encoding");
                    mode = EncodeMode::Reencode;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run_encode(
        &self,
        src: &dyn StorageBackend,
        rel: &str,
        out: &dyn StorageBackend,
        out_rel: &str,
        mode: EncodeMode,
        probe: &MediaProbe,
        label: &str,
    ) -> PipelineResult<u64> {
        let input = if src.is_streaming() {
            EncodeInput::Stream(src.read(rel).await?)
        } else {
            EncodeInput::Path(src.absolute(rel))
        };
        let output = if out.is_streaming() {
            EncodeOutput::Stream(out.write(out_rel).await?)
        } else {
            out.mkdir(parent_of(out_rel)).await?;
            EncodeOutput::Path(out.absolute(out_rel))
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = self.spawn_progress_watcher(rx, probe.duration, label, out_rel);
        let request = EncodeRequest {
            input,
            output,
            mode,
            conforming_audio: probe.conforming_audio.clone(),
        };
        let result = self.encoder.encode(request, tx, &self.cancel).await;
        let _ = watcher.await;

        match result {
            Ok(total) => Ok(total),
            Err(EncoderError::Cancelled) => {
                let _ = out.remove(out_rel).await;
                Err(PipelineError::Cancelled)
            }
            Err(err) => {
                let _ = out.remove(out_rel).await;
                Err(err.into())
            }
        }
    }

    fn spawn_progress_watcher(
        &self,
        mut rx: mpsc::UnboundedReceiver<EncodeProgress>,
        duration: Duration,
        label: &str,
        path: &str,
    ) -> JoinHandle<()> {
        let events = self.events.clone();
        let label = label.to_string();
        let path = path.to_string();
        tokio::spawn(async move {
            let start = Instant::now();
            while let Some(sample) = rx.recv().await {
                let fraction = if duration > Duration::ZERO {
                    (sample.out_time.as_secs_f64() / duration.as_secs_f64()).min(1.0)
                } else {
                    0.0
                };
                let elapsed = start.elapsed();
                let eta = if sample.out_time > Duration::ZERO {
                    let remaining = duration.saturating_sub(sample.out_time);
                    elapsed.mul_f64(
                        remaining.as_secs_f64()
                            / (sample.out_time + Duration::from_secs(1)).as_secs_f64(),
                    )
                } else {
                    Duration::ZERO
                };
                events.emit(ProgressEvent::Transcode {
                    label: label.clone(),
                    path: path.clone(),
                    fraction,
                    speed: sample.speed,
                    eta,
                    bytes: sample.total_size,
                });
            }
        })
    }
}
