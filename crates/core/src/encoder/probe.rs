//! Media probing: runs ffprobe against one input and extracts the handful
//! of facts the encoder driver needs (stream presence, duration).

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaProbeError {
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    #[error("failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeResult {
    pub has_video: bool,
    pub has_audio: bool,
    pub duration_secs: f64,
}

mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Probes one file via `ffprobe -v quiet -print_format json -show_streams
/// -show_format <path>` and reduces the result to what the encoder driver
/// needs: whether video/audio streams exist, and the container duration.
pub fn probe(path: &Path) -> Result<ProbeResult, MediaProbeError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MediaProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ffprobe_output(&stdout)
}

pub fn parse_ffprobe_output(json_str: &str) -> Result<ProbeResult, MediaProbeError> {
    let parsed: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| MediaProbeError::ParseError(e.to_string()))?;

    let streams = parsed.streams.unwrap_or_default();
    let has_video = streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("video"));
    let has_audio = streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let duration_secs = parsed
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(ProbeResult {
        has_video,
        has_audio,
        duration_secs,
    })
}
