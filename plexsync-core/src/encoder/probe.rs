use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::EncoderError;
use crate::config::MediaFormat;
use crate::storage::StorageBackend;

// ffprobe emits numbers as JSON strings
#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    duration: String,
    #[serde(default)]
    format_name: String,
    #[serde(default)]
    size: String,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeTags {
    #[serde(default, rename = "BPS")]
    bps: String,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    codec_name: String,
    #[serde(default)]
    codec_type: String,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    bit_rate: String,
    #[serde(default)]
    tags: ProbeTags,
}

#[derive(Debug, Default, Deserialize)]
struct ProbePacket {
    #[serde(default)]
    duration_time: String,
    #[serde(default)]
    dts_time: String,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeData {
    #[serde(default)]
    format: ProbeFormat,
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    packets: Vec<ProbePacket>,
}

/// What the pipeline needs to know about a source before deciding how to
/// materialize it.
#[derive(Debug, Clone, Default)]
pub struct MediaProbe {
    pub duration: Duration,
    /// Video bitrate in bits per second; falls back to `size * 8 / duration`
    /// when no stream reports one.
    pub bitrate: u64,
    pub height: u32,
    /// Indices (in audio-stream order) of streams already in the target
    /// audio codec.
    pub conforming_audio: Vec<usize>,
    pub size: u64,
    pub container: String,
}

impl MediaProbe {
    /// True when the source already satisfies the quality ceiling and can be
    /// copied or remuxed instead of re-encoded.
    pub fn meets(&self, format: &MediaFormat) -> bool {
        self.bitrate > 0
            && self.height > 0
            && self.bitrate <= format.bitrate_limit
            && self.height <= format.height_limit
    }
}

#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(
        &self,
        backend: &dyn StorageBackend,
        rel: &str,
    ) -> Result<MediaProbe, EncoderError>;

    /// Duration derived from the last audio packet, used to verify that an
    /// artifact on the destination is complete rather than truncated.
    async fn actual_duration(
        &self,
        backend: &dyn StorageBackend,
        rel: &str,
    ) -> Result<Duration, EncoderError>;
}

/// Probes via the `ffprobe` binary. Streaming backends are piped through
/// stdin; local files are handed over by absolute path.
pub struct FfprobeProber {
    binary: String,
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self {
            binary: "ffprobe".to_string(),
        }
    }
}

impl FfprobeProber {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn call(
        &self,
        backend: &dyn StorageBackend,
        rel: &str,
        extra: &[&str],
    ) -> Result<ProbeData, EncoderError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(extra)
            .args(["-print_format", "json", "-loglevel", "warning", "-hide_banner"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut feed = None;
        if backend.is_streaming() {
            cmd.arg("pipe:0").stdin(Stdio::piped());
            feed = Some(backend.read(rel).await?);
        } else {
            cmd.arg(backend.absolute(rel)).stdin(Stdio::null());
        }

        let mut child = cmd.spawn()?;
        if let Some(mut reader) = feed {
            let mut stdin = child.stdin.take().ok_or_else(|| {
                EncoderError::Failed("probe child has no stdin".to_string())
            })?;
            tokio::spawn(async move {
                // ffprobe closes the pipe once it has read the headers
                let _ = tokio::io::copy(&mut reader, &mut stdin).await;
            });
        }

        let mut stdout = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout).await?;
        }
        let status = child.wait().await?;
        if !status.success() && stdout.trim().is_empty() {
            return Err(EncoderError::Probe {
                path: rel.to_string(),
                message: format!("ffprobe exited with {status}"),
            });
        }
        serde_json::from_str(&stdout).map_err(|err| EncoderError::Probe {
            path: rel.to_string(),
            message: err.to_string(),
        })
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(
        &self,
        backend: &dyn StorageBackend,
        rel: &str,
    ) -> Result<MediaProbe, EncoderError> {
        let data = self
            .call(backend, rel, &["-show_format", "-show_streams"])
            .await?;
        let stat_size = backend.size(rel).await.unwrap_or(0);
        let probe = summarize(data, stat_size);
        debug!(
            path = rel,
            duration = ?probe.duration,
            bitrate = probe.bitrate,
            height = probe.height,
            "probed source"
        );
        Ok(probe)
    }

    async fn actual_duration(
        &self,
        backend: &dyn StorageBackend,
        rel: &str,
    ) -> Result<Duration, EncoderError> {
        let data = self
            .call(
                backend,
                rel,
                &[
                    "-show_entries",
                    "packet=duration_time,dts_time",
                    "-read_intervals",
                    "999999",
                    "-select_streams",
                    "a",
                ],
            )
            .await?;
        let mut seconds: f64 = 0.0;
        for packet in &data.packets {
            let (Ok(dur), Ok(dts)) = (
                packet.duration_time.parse::<f64>(),
                packet.dts_time.parse::<f64>(),
            ) else {
                continue;
            };
            if dts + dur > seconds {
                seconds = dts + dur;
            }
        }
        Ok(Duration::from_secs_f64(seconds))
    }
}

fn summarize(data: ProbeData, stat_size: u64) -> MediaProbe {
    let duration_secs: f64 = data.format.duration.parse().unwrap_or(0.0);
    let mut size: u64 = data.format.size.parse().unwrap_or(0);
    if size == 0 {
        size = stat_size;
    }

    let mut bitrate: u64 = 0;
    let mut height: u32 = 0;
    let mut conforming_audio = Vec::new();
    let mut audio_index = 0;
    for stream in &data.streams {
        match stream.codec_type.as_str() {
            "video" => {
                if height == 0 {
                    let mut rate: u64 = stream.bit_rate.parse().unwrap_or(0);
                    if rate == 0 {
                        rate = stream.tags.bps.parse().unwrap_or(0);
                    }
                    if rate > 0 && stream.height > 0 {
                        bitrate = rate;
                        height = stream.height;
                    }
                }
            }
            "audio" => {
                if stream.codec_name == "aac" {
                    conforming_audio.push(audio_index);
                }
                audio_index += 1;
            }
            _ => {}
        }
    }
    if bitrate == 0 {
        if duration_secs > 0.0 {
            bitrate = (size as f64 * 8.0 / duration_secs) as u64;
        } else {
            warn!("probe reported no bitrate and no duration");
        }
    }

    MediaProbe {
        duration: Duration::from_secs_f64(duration_secs.max(0.0)),
        bitrate,
        height,
        conforming_audio,
        size,
        container: data
            .format
            .format_name
            .split(',')
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}
