use std::{
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::instrument;

use crate::{error::Error, pool::BYTES_PER_PIXEL, time::Ticks};

/// Used whenever the container reports an unusable frame rate.
pub const DEFAULT_FRAME_RATE: f64 = 60.0;

/// Stream metadata, probed once at session construction and immutable
/// afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoMeta {
    pub width: u32,
    pub height: u32,
    /// Average frame rate reported by the container; ≤ 0 means unknown.
    pub frame_rate: f64,
    pub duration: Ticks,
}

impl VideoMeta {
    pub fn effective_frame_rate(&self) -> f64 {
        if self.frame_rate > 0.0 {
            self.frame_rate
        } else {
            DEFAULT_FRAME_RATE
        }
    }

    pub fn frame_duration(&self) -> Ticks {
        Ticks::from_secs_f64(1.0 / self.effective_frame_rate())
    }

    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

/// Probes `path` with ffprobe. `NoVideoStream` when the file has no video
/// stream; other probe problems surface as `ProbeFailed`.
#[instrument(err)]
pub async fn probe(path: &Path) -> Result<VideoMeta, Error> {
    let owned = path.to_owned();
    let outcome = tokio::task::spawn_blocking(move || probe_blocking(&owned))
        .await
        .map_err(|e| Error::ProbeFailed {
            path: path.to_owned(),
            source: anyhow::Error::new(e),
        })?;
    match outcome {
        Ok(Some(meta)) => Ok(meta),
        Ok(None) => Err(Error::NoVideoStream(path.to_owned())),
        Err(source) => Err(Error::ProbeFailed {
            path: path.to_owned(),
            source,
        }),
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

fn probe_blocking(path: &Path) -> Result<Option<VideoMeta>> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,avg_frame_rate,r_frame_rate,duration",
            "-show_entries",
            "format=duration",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .context("failed to launch ffprobe")?;
    if !output.status.success() {
        bail!("ffprobe exited with {}", output.status);
    }
    parse_probe_output(&output.stdout)
}

/// None when the file has no video stream.
fn parse_probe_output(stdout: &[u8]) -> Result<Option<VideoMeta>> {
    let parsed: ProbeOutput =
        serde_json::from_slice(stdout).context("unparsable ffprobe output")?;
    let Some(stream) = parsed.streams.into_iter().next() else {
        return Ok(None);
    };
    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        return Ok(None);
    };
    if width == 0 || height == 0 {
        bail!("degenerate video geometry {width}x{height}");
    }

    let frame_rate = stream
        .avg_frame_rate
        .as_deref()
        .map(parse_rational)
        .filter(|&rate| rate > 0.0)
        .or_else(|| stream.r_frame_rate.as_deref().map(parse_rational))
        .unwrap_or(0.0);

    let duration_secs = stream
        .duration
        .as_deref()
        .or(parsed.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|&secs| secs > 0.0)
        .context("stream duration missing")?;

    Ok(Some(VideoMeta {
        width,
        height,
        frame_rate,
        duration: Ticks::from_secs_f64(duration_secs),
    }))
}

/// "30000/1001" → 29.97…; malformed or zero-denominator input → 0.
fn parse_rational(text: &str) -> f64 {
    let mut parts = text.splitn(2, '/');
    let num: f64 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0.0);
    let den: f64 = parts.next().map_or(1.0, |p| p.parse().unwrap_or(0.0));
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}
