//! Configuration: camera list (XML) and runtime settings (TOML).

mod cameras;
mod settings;

pub use cameras::{CameraConfig, CameraEntry, DefaultSetting, SettingError};
pub use settings::{
    Backend, CaptureSettings, MetricsSettings, Overrides, ServerSettings, Settings,
    DEFAULT_BASE_PORT,
};

/// Configuration loading and validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileReadError(String),
    #[error("failed to parse config file: {0}")]
    ParseError(String),
    #[error("camera #{0} has no id")]
    MissingCameraId(usize),
    #[error("camera {0} is listed twice")]
    DuplicateCamera(String),
    #[error("queue capacity must be at least 1")]
    InvalidQueueCapacity,
    #[error("buffer count must be at least 1")]
    InvalidBufferCount,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("no port left for camera #{index} above base port {base}")]
    PortRange { base: u16, index: usize },
}
