//! External video trimmer boundary.
//!
//! The core hands the trimmer a list of absolute keep-ranges and an output
//! path and waits for it to finish; how the cut happens is the tool's
//! business. The default implementation shells out to ffmpeg.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

/// One keep-range, absolute `HH:MM:SS` timestamps
#[derive(Debug, Clone)]
pub struct TrimSegment {
    pub start: String,
    pub end: String,
}

#[async_trait]
pub trait Trimmer: Send + Sync {
    /// Cut `source` down to the given segments, writing `output`.
    /// Blocks until the tool finishes.
    async fn trim(&self, source: &Path, segments: &[TrimSegment], output: &Path) -> Result<()>;
}

/// ffmpeg-backed trimmer
pub struct FfmpegTrimmer;

#[async_trait]
impl Trimmer for FfmpegTrimmer {
    async fn trim(&self, source: &Path, segments: &[TrimSegment], output: &Path) -> Result<()> {
        if segments.is_empty() {
            bail!("no segments to keep");
        }

        let select: Vec<String> = segments
            .iter()
            .map(|segment| format!("between(t,{},{})", ffmpeg_time(&segment.start), ffmpeg_time(&segment.end)))
            .collect();
        let select = select.join("+");
        let filter = format!(
            "[0:v]select='{select}',setpts=N/FRAME_RATE/TB[v];[0:a]aselect='{select}',asetpts=N/SR/TB[a]"
        );

        info!(
            target: "trimmer",
            source = %source.display(),
            segments = segments.len(),
            output = %output.display(),
            "Invoking trimmer"
        );

        let status = tokio::process::Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(source)
            .arg("-filter_complex")
            .arg(&filter)
            .arg("-map")
            .arg("[v]")
            .arg("-map")
            .arg("[a]")
            .arg(output)
            .status()
            .await
            .context("failed to spawn ffmpeg")?;

        if !status.success() {
            bail!("ffmpeg exited with {status}");
        }
        debug!(target: "trimmer", output = %output.display(), "Trim complete");
        Ok(())
    }
}

/// Convert `HH:MM:SS` to seconds for ffmpeg filter expressions.
fn ffmpeg_time(timestamp: &str) -> u64 {
    crate::timecode::parse_timestamp(timestamp).unwrap_or(0)
}

/// Test double that records invocations without touching ffmpeg
#[cfg(test)]
pub struct RecordingTrimmer {
    pub calls: std::sync::Mutex<Vec<(std::path::PathBuf, usize, std::path::PathBuf)>>,
}

#[cfg(test)]
impl RecordingTrimmer {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            calls: std::sync::Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
#[async_trait]
impl Trimmer for RecordingTrimmer {
    async fn trim(&self, source: &Path, segments: &[TrimSegment], output: &Path) -> Result<()> {
        self.calls.lock().unwrap().push((
            source.to_path_buf(),
            segments.len(),
            output.to_path_buf(),
        ));
        tokio::fs::write(output, b"trimmed").await?;
        Ok(())
    }
}
