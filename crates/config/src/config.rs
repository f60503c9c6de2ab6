//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A `${NAME}` placeholder referenced an environment variable that isn't set
    #[error("Environment variable '{0}' referenced in config is not set")]
    MissingEnvVar(String),

    /// The encoder selection string did not match one of the supported encoders
    #[error("Unknown video encoder '{0}' (expected libx265, h264_nvenc, or libx264)")]
    UnknownEncoder(String),
}

/// The three encoders this crate knows how to drive.
///
/// Represented as a closed, tagged enum rather than a loose string past this
/// boundary: `h264_nvenc` carries no preset/tune, so the type itself rules out
/// constructing an invocation that pairs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoEncoder {
    Libx265 { preset: String, tune: String },
    H264Nvenc,
    Libx264 { preset: String, tune: String },
}

impl VideoEncoder {
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            VideoEncoder::Libx265 { .. } => "libx265",
            VideoEncoder::H264Nvenc => "h264_nvenc",
            VideoEncoder::Libx264 { .. } => "libx264",
        }
    }

    pub fn preset_tune(&self) -> Option<(&str, &str)> {
        match self {
            VideoEncoder::Libx265 { preset, tune } | VideoEncoder::Libx264 { preset, tune } => {
                Some((preset.as_str(), tune.as_str()))
            }
            VideoEncoder::H264Nvenc => None,
        }
    }

    fn from_raw(name: &str, preset: &str, tune: &str) -> Result<Self, ConfigError> {
        match name {
            "libx265" => Ok(VideoEncoder::Libx265 {
                preset: preset.to_string(),
                tune: tune.to_string(),
            }),
            "h264_nvenc" => Ok(VideoEncoder::H264Nvenc),
            "libx264" => Ok(VideoEncoder::Libx264 {
                preset: preset.to_string(),
                tune: tune.to_string(),
            }),
            other => Err(ConfigError::UnknownEncoder(other.to_string())),
        }
    }
}

/// Raw, serde-facing encoder selection as it appears in TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEncoderConfig {
    pub video_encoder: String,
    #[serde(default)]
    pub preset: String,
    #[serde(default)]
    pub tune: String,
}

impl Default for RawEncoderConfig {
    fn default() -> Self {
        Self {
            video_encoder: "libx265".to_string(),
            preset: "medium".to_string(),
            tune: "film".to_string(),
        }
    }
}

/// Per-resolution bitrate ladder (1080p/720p/480p/360p), e.g. `"6500k"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BitrateLadder {
    #[serde(default = "default_bitrate_1080p")]
    pub p1080: String,
    #[serde(default = "default_bitrate_720p")]
    pub p720: String,
    #[serde(default = "default_bitrate_480p")]
    pub p480: String,
    #[serde(default = "default_bitrate_360p")]
    pub p360: String,
}

fn default_bitrate_1080p() -> String {
    "6500k".to_string()
}
fn default_bitrate_720p() -> String {
    "4000k".to_string()
}
fn default_bitrate_480p() -> String {
    "2000k".to_string()
}
fn default_bitrate_360p() -> String {
    "1000k".to_string()
}

impl Default for BitrateLadder {
    fn default() -> Self {
        Self {
            p1080: default_bitrate_1080p(),
            p720: default_bitrate_720p(),
            p480: default_bitrate_480p(),
            p360: default_bitrate_360p(),
        }
    }
}

/// Batch processing / resource-aware planner configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchProcessingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default = "default_max_memory_percent")]
    pub max_memory_percent: f32,
}

fn default_true() -> bool {
    true
}
fn default_max_memory_percent() -> f32 {
    90.0
}

impl Default for BatchProcessingConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            batch_size: None,
            max_memory_percent: default_max_memory_percent(),
        }
    }
}

/// File intake rename/validate/organize configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntakeConfig {
    #[serde(default)]
    pub auto_rename_files: bool,
    #[serde(default = "default_rename_pattern")]
    pub file_rename_pattern: String,
    #[serde(default = "default_validation_pattern")]
    pub file_validation_pattern: String,
    #[serde(default)]
    pub auto_organize_folders: bool,
    #[serde(default = "default_organization_pattern")]
    pub folder_organization_pattern: String,
}

fn default_rename_pattern() -> String {
    r"(\d+-\d+)(?:[_-].*?)?\.mp4$".to_string()
}
fn default_validation_pattern() -> String {
    r"^\d+-\d+\.mp4$".to_string()
}
fn default_organization_pattern() -> String {
    r"^(\d+)-\d+".to_string()
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            auto_rename_files: false,
            file_rename_pattern: default_rename_pattern(),
            file_validation_pattern: default_validation_pattern(),
            auto_organize_folders: false,
            folder_organization_pattern: default_organization_pattern(),
        }
    }
}

/// Retry/backoff and cancellation timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// FFmpeg exit codes treated as transient/retryable. Empty by default: the
    /// source material gave no enumeration of which codes are transient, so
    /// this is left for the operator to populate.
    #[serde(default)]
    pub retryable_exit_codes: Vec<i32>,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_retry_max_delay_ms() -> u64 {
    60_000
}
fn default_cancel_grace_ms() -> u64 {
    5_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            retryable_exit_codes: Vec::new(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Source directory, `${NAME}`-expanded.
    pub input_folder: String,
    /// Destination directory, `${NAME}`-expanded.
    pub output_folder: String,

    #[serde(flatten)]
    pub raw_encoder: RawEncoderConfig,

    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub include_audio: bool,

    #[serde(default)]
    pub bitrates: BitrateLadder,
    #[serde(default = "default_audio_bitrates")]
    pub audio_bitrates: Vec<String>,

    #[serde(default)]
    pub max_parallel_jobs: Option<u32>,

    #[serde(default)]
    pub batch_processing: BatchProcessingConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default = "default_hls_time_secs")]
    pub hls_time_secs: u32,
}

fn default_fps() -> u32 {
    30
}
fn default_audio_bitrates() -> Vec<String> {
    vec!["128k".to_string()]
}
fn default_hls_time_secs() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_folder: String::new(),
            output_folder: String::new(),
            raw_encoder: RawEncoderConfig::default(),
            fps: default_fps(),
            include_audio: false,
            bitrates: BitrateLadder::default(),
            audio_bitrates: default_audio_bitrates(),
            max_parallel_jobs: None,
            batch_processing: BatchProcessingConfig::default(),
            intake: IntakeConfig::default(),
            retry: RetryConfig::default(),
            hls_time_secs: default_hls_time_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, expanding `${NAME}` environment
    /// placeholders in `input_folder`/`output_folder` before parsing structure.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.input_folder = expand_env_placeholders(&config.input_folder)?;
        config.output_folder = expand_env_placeholders(&config.output_folder)?;
        Ok(config)
    }

    /// Validate and resolve the raw TOML-facing encoder fields into the
    /// closed `VideoEncoder` representation used by the rest of the crate.
    pub fn resolve_encoder(&self) -> Result<VideoEncoder, ConfigError> {
        VideoEncoder::from_raw(
            &self.raw_encoder.video_encoder,
            &self.raw_encoder.preset,
            &self.raw_encoder.tune,
        )
    }

    /// Load configuration from file; `${NAME}` interpolation is already
    /// applied by `parse_toml`, so no further override step runs here.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_from_file(path)
    }
}

/// Expands `${NAME}` placeholders in a string against the process environment.
///
/// This is a pure, syntactic pre-step: it does not read config-specific
/// override variables (there are none), only the literal names a config
/// author wrote inside `${...}`.
fn expand_env_placeholders(input: &str) -> Result<String, ConfigError> {
    let mut cache: HashMap<String, String> = HashMap::new();
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c == '$' && input[i + 1..].starts_with('{') {
            if let Some(end) = input[i..].find('}') {
                let name = &input[i + 2..i + end];
                let value = if let Some(v) = cache.get(name) {
                    v.clone()
                } else {
                    let v = std::env::var(name)
                        .map_err(|_| ConfigError::MissingEnvVar(name.to_string()))?;
                    cache.insert(name.to_string(), v.clone());
                    v
                };
                out.push_str(&value);
                for _ in 0..end {
                    chars.next();
                }
                continue;
            }
        }
        out.push(c);
    }

    Ok(out)
}
