pub mod capture;
pub mod control;
pub mod detect;
pub mod error;
pub mod pipeline;
pub mod server;

use std::path::Path;

use serde::{Deserialize, Serialize};

use capture::frame::{PixelFormat, DEFAULT_SCRATCH_BYTES};
use error::ConfigError;

/// Environment variables with this prefix override file settings,
/// e.g. `QC_EDGE__CAMERA__ADAPTER=simulated`.
pub const ENV_PREFIX: &str = "QC_EDGE";

/// Service configuration, loaded from `infer.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model_path: String,
    pub default_imgsz: u32,
    pub conf_thres: f32,
    pub iou_thres: f32,
    pub ng_classes: Vec<String>,
    pub camera: CameraConfig,
    pub stream: StreamConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraAdapter {
    V4l2,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub adapter: CameraAdapter,
    /// Device id or path; first enumerated device when unset.
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub read_timeout_ms: u64,
    pub failure_backoff_ms: u64,
    pub failure_report_every: u64,
    pub scratch_bytes: usize,
    /// Frame pacing for the simulated adapter.
    pub sim_frame_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub poll_interval_ms: u64,
    pub frame_interval_ms: u64,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: "models/best.pt".into(),
            default_imgsz: 640,
            conf_thres: 0.25,
            iou_thres: 0.45,
            ng_classes: Vec::new(),
            camera: CameraConfig::default(),
            stream: StreamConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            adapter: CameraAdapter::V4l2,
            device: None,
            width: 640,
            height: 480,
            format: PixelFormat::Mono8,
            buffer_count: 4,
            read_timeout_ms: 1000,
            failure_backoff_ms: 10,
            failure_report_every: 100,
            scratch_bytes: DEFAULT_SCRATCH_BYTES,
            sim_frame_interval_ms: 33, // ~30fps
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            frame_interval_ms: 33,
            jpeg_quality: 80,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".into(),
            allowed_origins: vec![
                "http://localhost:3000".into(),
                "http://localhost:3110".into(),
                "http://127.0.0.1:3000".into(),
                "http://127.0.0.1:3110".into(),
            ],
        }
    }
}

impl Config {
    /// Load a JSON config file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::Missing(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse JSON text (a leading BOM is tolerated), then apply environment
    /// overrides.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        Self::build(Some(text))
    }

    /// Defaults plus environment overrides only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::build(None)
    }

    fn build(json: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(json) = json {
            builder = builder.add_source(config::File::from_str(json, config::FileFormat::Json));
        }
        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}
