mod probe;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::UnixListener;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::MediaFormat;
use crate::storage::{ByteReader, ByteWriter, StorageError};

pub use probe::{FfprobeProber, MediaProbe, MediaProber};

#[derive(Debug, Error)]
pub enum EncoderError {
    /// The muxer needs a seekable input but was fed a pipe. Recoverable by
    /// staging the source to a local file.
    #[error("muxer requires a seekable input")]
    InputBuffering,
    /// The muxer needs a seekable output but was given a pipe. Recoverable
    /// by encoding to a local file and moving it afterwards.
    #[error("muxer requires a seekable output")]
    OutputBuffering,
    #[error("codec not supported in target container")]
    UnsupportedCodec,
    #[error("probe of {path} failed: {message}")]
    Probe { path: String, message: String },
    #[error("encoder failed: {0}")]
    Failed(String),
    #[error("encode cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Maps known ffmpeg diagnostics to their recoverable classifications.
fn classify_stderr(stderr: &str) -> Option<EncoderError> {
    if stderr.contains("muxer does not support non seekable input") {
        return Some(EncoderError::InputBuffering);
    }
    if stderr.contains("Cannot write moov atom")
        || stderr.contains("muxer does not support non seekable output")
    {
        return Some(EncoderError::OutputBuffering);
    }
    if stderr.contains("codec not currently supported in container") {
        return Some(EncoderError::UnsupportedCodec);
    }
    None
}

/// One sample of the encoder's progress feed.
#[derive(Debug, Clone, Default)]
pub struct EncodeProgress {
    pub frame: u64,
    pub fps: f64,
    pub bitrate: String,
    pub total_size: u64,
    pub out_time: Duration,
    pub dup_frames: u64,
    pub drop_frames: u64,
    pub speed: f64,
    pub finished: bool,
}

/// Accumulates `key=value` lines from the `-progress` feed; a `progress=`
/// line terminates a block and yields a snapshot.
#[derive(Debug, Default)]
struct ProgressParser {
    current: EncodeProgress,
    max_size: u64,
}

impl ProgressParser {
    fn push_line(&mut self, line: &str) -> Option<EncodeProgress> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();
        match key {
            "frame" => self.current.frame = value.parse().unwrap_or(0),
            "fps" => self.current.fps = value.parse().unwrap_or(0.0),
            "bitrate" => self.current.bitrate = value.to_string(),
            "total_size" => {
                self.current.total_size = value.parse().unwrap_or(0);
                self.max_size = self.max_size.max(self.current.total_size);
            }
            // both fields carry microseconds
            "out_time_us" | "out_time_ms" => {
                self.current.out_time = Duration::from_micros(value.parse().unwrap_or(0));
            }
            "dup_frames" => self.current.dup_frames = value.parse().unwrap_or(0),
            "drop_frames" => self.current.drop_frames = value.parse().unwrap_or(0),
            "speed" => {
                self.current.speed = value.trim_end_matches('x').parse().unwrap_or(0.0);
            }
            "progress" => {
                self.current.finished = value == "end";
                return Some(self.current.clone());
            }
            _ => {}
        }
        None
    }
}

pub enum EncodeInput {
    /// Local file, addressed by absolute path; the encoder may seek.
    Path(String),
    /// Non-seekable stream piped through stdin.
    Stream(ByteReader),
}

pub enum EncodeOutput {
    Path(String),
    /// Non-seekable stream fed from stdout.
    Stream(ByteWriter),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMode {
    /// Copy the video stream, change container only.
    Remux,
    /// Re-encode video at the configured quality ceiling.
    Reencode,
}

pub struct EncodeRequest {
    pub input: EncodeInput,
    pub output: EncodeOutput,
    pub mode: EncodeMode,
    /// Audio-stream indices already in the target codec; mapped through
    /// unchanged. When empty, all audio is transcoded instead.
    pub conforming_audio: Vec<usize>,
}

#[async_trait]
pub trait Encoder: Send + Sync {
    /// Runs one conversion, forwarding progress samples as they arrive.
    /// Returns the largest output size the progress feed reported.
    async fn encode(
        &self,
        request: EncodeRequest,
        progress: mpsc::UnboundedSender<EncodeProgress>,
        cancel: &CancellationToken,
    ) -> Result<u64, EncoderError>;
}

/// Drives the `ffmpeg` binary. Progress is read over a unix socket given to
/// ffmpeg via `-progress`, so stderr stays free for diagnostics.
pub struct FfmpegEncoder {
    binary: String,
    format: MediaFormat,
}

impl FfmpegEncoder {
    pub fn new(format: MediaFormat) -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            format,
        }
    }

    pub fn with_binary(binary: impl Into<String>, format: MediaFormat) -> Self {
        Self {
            binary: binary.into(),
            format,
        }
    }

    fn build_args(
        &self,
        input: &EncodeInput,
        output: &EncodeOutput,
        mode: EncodeMode,
        conforming_audio: &[usize],
        progress_uri: &str,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-loglevel".into(),
            "error".into(),
            "-progress".into(),
            progress_uri.into(),
            "-i".into(),
        ];
        match input {
            EncodeInput::Path(path) => args.push(path.clone()),
            EncodeInput::Stream(_) => args.push("pipe:0".into()),
        }
        match mode {
            EncodeMode::Remux => {
                args.extend(["-c:v".into(), "copy".into()]);
            }
            EncodeMode::Reencode => {
                args.extend([
                    "-c:v".into(),
                    "libx264".into(),
                    "-crf".into(),
                    self.format.crf.to_string(),
                    "-s".into(),
                    format!("{}x{}", self.format.width_limit, self.format.height_limit),
                ]);
            }
        }
        if conforming_audio.is_empty() {
            args.extend(["-c:a".into(), "aac".into()]);
        } else {
            // carry every audio stream: default to transcoding, then copy
            // the conforming ones stream-by-stream (output order follows
            // input order, so the indices line up)
            args.extend(["-map".into(), "0:v".into(), "-map".into(), "0:a".into()]);
            args.extend(["-c:a".into(), "aac".into()]);
            for idx in conforming_audio {
                args.extend([format!("-c:a:{idx}"), "copy".into()]);
            }
        }
        args.extend(["-f".into(), self.format.container.clone()]);
        match output {
            EncodeOutput::Path(path) => {
                args.extend(["-movflags".into(), "faststart".into(), path.clone()]);
            }
            EncodeOutput::Stream(_) => {
                args.extend([
                    "-movflags".into(),
                    "frag_keyframe+empty_moov".into(),
                    "pipe:1".into(),
                ]);
            }
        }
        args
    }
}

fn bind_progress_socket() -> Result<(PathBuf, UnixListener), EncoderError> {
    loop {
        let path = std::env::temp_dir().join(format!("encode_{:x}.sock", rand::random::<u64>()));
        match UnixListener::bind(&path) {
            Ok(listener) => return Ok((path, listener)),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

async fn watch_progress(
    listener: UnixListener,
    tx: mpsc::UnboundedSender<EncodeProgress>,
    max_size: Arc<AtomicU64>,
) {
    let Ok((stream, _)) = listener.accept().await else {
        return;
    };
    let mut lines = BufReader::new(stream).lines();
    let mut parser = ProgressParser::default();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(snapshot) = parser.push_line(&line) {
            max_size.fetch_max(parser.max_size, Ordering::Relaxed);
            let _ = tx.send(snapshot);
        }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(
        &self,
        request: EncodeRequest,
        progress: mpsc::UnboundedSender<EncodeProgress>,
        cancel: &CancellationToken,
    ) -> Result<u64, EncoderError> {
        let EncodeRequest {
            input,
            output,
            mode,
            conforming_audio,
        } = request;

        let (sock_path, listener) = bind_progress_socket()?;
        let uri = format!("unix://{}", sock_path.display());
        let args = self.build_args(&input, &output, mode, &conforming_audio, &uri);
        debug!(binary = %self.binary, ?args, "spawning encoder");

        let max_size = Arc::new(AtomicU64::new(0));
        let watcher = tokio::spawn(watch_progress(
            listener,
            progress,
            max_size.clone(),
        ));

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match &input {
            EncodeInput::Path(_) => cmd.stdin(Stdio::null()),
            EncodeInput::Stream(_) => cmd.stdin(Stdio::piped()),
        };
        match &output {
            EncodeOutput::Path(_) => cmd.stdout(Stdio::null()),
            EncodeOutput::Stream(_) => cmd.stdout(Stdio::piped()),
        };

        let mut child = cmd.spawn()?;

        if let EncodeInput::Stream(mut reader) = input {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| EncoderError::Failed("encoder child has no stdin".into()))?;
            tokio::spawn(async move {
                // a broken pipe here surfaces as an encoder diagnostic
                let _ = tokio::io::copy(&mut reader, &mut stdin).await;
            });
        }

        let output_pump = if let EncodeOutput::Stream(mut writer) = output {
            let mut stdout = child
                .stdout
                .take()
                .ok_or_else(|| EncoderError::Failed("encoder child has no stdout".into()))?;
            Some(tokio::spawn(async move {
                tokio::io::copy(&mut stdout, &mut writer).await?;
                use tokio::io::AsyncWriteExt;
                writer.shutdown().await
            }))
        } else {
            None
        };

        let mut stderr = String::new();
        let mut stderr_pipe = child.stderr.take();

        let status = tokio::select! {
            status = child.wait() => status,
            () = cancel.cancelled() => {
                let _ = child.kill().await;
                watcher.abort();
                let _ = tokio::fs::remove_file(&sock_path).await;
                return Err(EncoderError::Cancelled);
            }
        };
        if let Some(mut pipe) = stderr_pipe.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        if let Some(pump) = output_pump {
            match pump.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%err, "output stream closed early"),
                Err(err) => warn!(%err, "output pump panicked"),
            }
        }
        watcher.abort();
        let _ = tokio::fs::remove_file(&sock_path).await;

        let status = status?;
        if !status.success() {
            if let Some(classified) = classify_stderr(&stderr) {
                return Err(classified);
            }
            let message = if stderr.trim().is_empty() {
                format!("ffmpeg exited with {status}")
            } else {
                stderr.trim().to_string()
            };
            return Err(EncoderError::Failed(message));
        }
        Ok(max_size.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_blocks_yield_snapshots() {
        let mut parser = ProgressParser::default();
        let lines = [
            "frame=120",
            "fps=24.0",
            "bitrate=2000.1kbits/s",
            "total_size=1048576",
            "out_time_ms=5000000",
            "dup_frames=0",
            "drop_frames=2",
            "speed=1.5x",
            "progress=continue",
        ];
        let mut snapshot = None;
        for line in lines {
            if let Some(s) = parser.push_line(line) {
                snapshot = Some(s);
            }
        }
        let snapshot = snapshot.unwrap();
        assert_eq!(snapshot.frame, 120);
        assert_eq!(snapshot.total_size, 1_048_576);
        assert_eq!(snapshot.out_time, Duration::from_secs(5));
        assert_eq!(snapshot.drop_frames, 2);
        assert!((snapshot.speed - 1.5).abs() < f64::EPSILON);
        assert!(!snapshot.finished);

        let end = parser.push_line("progress=end").unwrap();
        assert!(end.finished);
        assert_eq!(parser.max_size, 1_048_576);
    }

    #[test]
    fn garbage_values_do_not_panic() {
        let mut parser = ProgressParser::default();
        assert!(parser.push_line("out_time_ms=N/A").is_none());
        assert!(parser.push_line("not a key value pair").is_none());
        let snapshot = parser.push_line("progress=continue").unwrap();
        assert_eq!(snapshot.out_time, Duration::ZERO);
    }

    #[test]
    fn stderr_classification_matches_known_diagnostics() {
        assert!(matches!(
            classify_stderr("x muxer does not support non seekable input y"),
            Some(EncoderError::InputBuffering)
        ));
        assert!(matches!(
            classify_stderr("Cannot write moov atom before ..."),
            Some(EncoderError::OutputBuffering)
        ));
        assert!(matches!(
            classify_stderr("the muxer does not support non seekable output"),
            Some(EncoderError::OutputBuffering)
        ));
        assert!(matches!(
            classify_stderr("Could not write header: codec not currently supported in container"),
            Some(EncoderError::UnsupportedCodec)
        ));
        assert!(classify_stderr("some other failure").is_none());
    }

    #[test]
    fn remux_args_copy_video_and_fragment_piped_output() {
        let encoder = FfmpegEncoder::new(MediaFormat::default());
        let args = encoder.build_args(
            &EncodeInput::Path("/src/a.mkv".into()),
            &EncodeOutput::Stream(Box::new(tokio::io::sink())),
            EncodeMode::Remux,
            &[0, 2],
            "unix:///tmp/p.sock",
        );
        let joined = args.join(" ");
        assert!(joined.contains("-i /src/a.mkv"));
        assert!(joined.contains("-c:v copy"));
        // streams 0 and 2 conform and are copied; stream 1 falls under the
        // blanket aac transcode instead of being dropped
        assert!(joined.contains("-map 0:v -map 0:a -c:a aac -c:a:0 copy -c:a:2 copy"));
        assert!(!joined.contains("-c:a:1 copy"));
        assert!(joined.contains("-movflags frag_keyframe+empty_moov pipe:1"));
        assert!(!joined.contains("faststart"));
    }

    #[test]
    fn reencode_args_set_quality_ceiling_and_transcode_audio() {
        let encoder = FfmpegEncoder::new(MediaFormat::default());
        let args = encoder.build_args(
            &EncodeInput::Stream(Box::new(tokio::io::empty())),
            &EncodeOutput::Path("/dest/a.mp4".into()),
            EncodeMode::Reencode,
            &[],
            "unix:///tmp/p.sock",
        );
        let joined = args.join(" ");
        assert!(joined.contains("-i pipe:0"));
        assert!(joined.contains("-c:v libx264 -crf 23 -s 1280x720"));
        assert!(joined.contains("-c:a aac"));
        assert!(joined.contains("-movflags faststart /dest/a.mp4"));
    }
}
