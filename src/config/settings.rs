//! Runtime settings, read from an optional TOML file.
//!
//! Every key has a default, so an empty file (or no file) is valid.
//! Durations are given in milliseconds.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::stream::{HeaderFormat, OverflowPolicy};

/// Control server port when none is given.
pub const DEFAULT_BASE_PORT: u16 = 42000;

/// Settings shared by the control server and every frame server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Control server port; camera `i` streams on `base_port + 1 + i`.
    pub base_port: u16,
    pub bind_address: IpAddr,
    /// Frames buffered per stream between camera and client.
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub header: HeaderFormat,
    /// Upper bound on a single blocking send to a client.
    pub send_timeout_ms: u64,
    /// A connected client with no frame for this long is dropped.
    pub frame_timeout_ms: u64,
    /// How often the accept loop checks for a stop request.
    pub accept_poll_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_BASE_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            queue_capacity: 3,
            overflow: OverflowPolicy::DropOldest,
            header: HeaderFormat::Extended,
            send_timeout_ms: 10_000,
            frame_timeout_ms: 3_000,
            accept_poll_ms: 1_000,
        }
    }
}

impl ServerSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    /// Address of the control server.
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.base_port)
    }

    /// Port of the `index`-th camera in the configuration.
    ///
    /// A base port of 0 asks the OS for ephemeral ports everywhere.
    pub fn camera_port(&self, index: usize) -> Result<u16, ConfigError> {
        if self.base_port == 0 {
            return Ok(0);
        }
        u16::try_from(index)
            .ok()
            .and_then(|i| self.base_port.checked_add(1)?.checked_add(i))
            .ok_or(ConfigError::PortRange {
                base: self.base_port,
                index,
            })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidQueueCapacity);
        }
        for (name, value) in [
            ("send_timeout_ms", self.send_timeout_ms),
            ("frame_timeout_ms", self.frame_timeout_ms),
            ("accept_poll_ms", self.accept_poll_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if let OverflowPolicy::Block { timeout } = self.overflow {
            if timeout.is_zero() {
                return Err(ConfigError::ZeroDuration("overflow.timeout"));
            }
        }
        Ok(())
    }
}

/// Which camera backend to open devices with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    #[default]
    Simulated,
    V4l2,
}

/// Camera supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Frame buffers announced to the camera.
    pub buffer_count: usize,
    /// Wait after an error before locating the camera again.
    pub retry_delay_ms: u64,
    /// Wait after a device reset before reopening.
    pub reset_settle_ms: u64,
    /// Skip the device reset on open.
    pub skip_reset: bool,
    pub backend: Backend,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            buffer_count: 10,
            retry_delay_ms: 3_000,
            reset_settle_ms: 5_000,
            skip_reset: false,
            backend: Backend::Simulated,
        }
    }
}

impl CaptureSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_count == 0 {
            return Err(ConfigError::InvalidBufferCount);
        }
        Ok(())
    }
}

/// Metrics exporter settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Port of the Prometheus endpoint (0 to disable).
    pub port: u16,
}

/// Full settings file format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub capture: CaptureSettings,
    pub metrics: MetricsSettings,
}

impl Settings {
    /// Parses and validates a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.capture.validate()?;
        if self.capture.buffer_count < self.server.queue_capacity + 2 {
            tracing::warn!(
                buffers = self.capture.buffer_count,
                queue_capacity = self.server.queue_capacity,
                "Fewer buffers than queue capacity + 2, the camera may starve while streaming"
            );
        }
        Ok(())
    }

    /// Applies command-line overrides on top of the file values.
    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(port) = overrides.base_port {
            self.server.base_port = port;
        }
        if let Some(capacity) = overrides.queue_capacity {
            self.server.queue_capacity = capacity;
        }
        if overrides.legacy_header {
            self.server.header = HeaderFormat::Legacy;
        }
        if let Some(port) = overrides.metrics_port {
            self.metrics.port = port;
        }
        if let Some(backend) = overrides.backend {
            self.capture.backend = backend;
        }
    }
}

/// Values given on the command line, which win over the settings file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub base_port: Option<u16>,
    pub queue_capacity: Option<usize>,
    pub legacy_header: bool,
    pub metrics_port: Option<u16>,
    pub backend: Option<Backend>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.server.base_port, 42000);
        assert_eq!(settings.server.queue_capacity, 3);
        assert_eq!(settings.server.frame_timeout(), Duration::from_secs(3));
        assert_eq!(settings.capture.buffer_count, 10);
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.server.header, HeaderFormat::Extended);
        assert_eq!(settings.capture.backend, Backend::Simulated);
    }

    #[test]
    fn test_partial_file() {
        let settings = Settings::from_toml(
            r#"
            [server]
            base_port = 50000
            header = "legacy"
            overflow = { policy = "block", timeout = 3000 }

            [capture]
            backend = "v4l2"
            retry_delay_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(settings.server.base_port, 50000);
        assert_eq!(settings.server.header, HeaderFormat::Legacy);
        assert_eq!(
            settings.server.overflow,
            OverflowPolicy::Block {
                timeout: Duration::from_secs(3)
            }
        );
        assert_eq!(settings.server.send_timeout_ms, 10_000);
        assert_eq!(settings.capture.backend, Backend::V4l2);
        assert_eq!(settings.capture.retry_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            Settings::from_toml("[server]\nqueue_capacity = 0"),
            Err(ConfigError::InvalidQueueCapacity)
        ));
        assert!(matches!(
            Settings::from_toml("[server]\nsend_timeout_ms = 0"),
            Err(ConfigError::ZeroDuration("send_timeout_ms"))
        ));
        assert!(matches!(
            Settings::from_toml("[capture]\nbuffer_count = 0"),
            Err(ConfigError::InvalidBufferCount)
        ));
        assert!(matches!(
            Settings::from_toml("[server]\nbase_port = \"high\""),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_camera_ports() {
        let mut server = ServerSettings::default();
        assert_eq!(server.camera_port(0).unwrap(), 42001);
        assert_eq!(server.camera_port(2).unwrap(), 42003);

        server.base_port = u16::MAX - 1;
        assert_eq!(server.camera_port(0).unwrap(), u16::MAX);
        assert!(matches!(
            server.camera_port(1),
            Err(ConfigError::PortRange { index: 1, .. })
        ));

        server.base_port = 0;
        assert_eq!(server.camera_port(5).unwrap(), 0);
    }

    #[test]
    fn test_overrides_win() {
        let mut settings = Settings::default();
        settings.apply(&Overrides {
            base_port: Some(43000),
            queue_capacity: Some(5),
            legacy_header: true,
            metrics_port: Some(9100),
            backend: None,
        });
        assert_eq!(settings.server.base_port, 43000);
        assert_eq!(settings.server.queue_capacity, 5);
        assert_eq!(settings.server.header, HeaderFormat::Legacy);
        assert_eq!(settings.metrics.port, 9100);
        assert_eq!(settings.capture.backend, Backend::Simulated);
    }
}
