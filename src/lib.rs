pub mod capture;
pub mod detect;
pub mod error;
pub mod pipeline;
pub mod render;
pub mod server;
pub mod telemetry;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{Frame, PixelFormat};
pub use detect::Detection;
pub use error::{ConfigError, PipelineError};
pub use pipeline::{CaptureLoop, FrameCell, FramePacket};

/// Environment variable prefix for configuration overrides,
/// e.g. `FRAMECAST_SERVER__PORT=8000`
pub const ENV_PREFIX: &str = "FRAMECAST";

/// System configuration, fixed at process start
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub server: ServerConfig,
    pub stream: StreamConfig,
    pub detection: DetectionConfig,
    pub log: LogConfig,
}

/// Where frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureSource {
    /// Synthetic moving color bars, no hardware needed
    TestPattern,
    /// Linux V4L2 device node (requires the `v4l2` feature)
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: CaptureSource,
    /// Device node path, or "auto" to probe /dev/video*
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Pin the capture thread to this core id
    pub pin_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// How long open connections may drain after shutdown before they are dropped
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Per-client emission rate
    pub target_fps: u32,
    /// Fraction of the frame period a session sleeps after each chunk
    pub pacing_factor: f32,
    /// How long a session waits before re-checking an empty cell
    pub poll_interval_ms: u64,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub enabled: bool,
    /// Per-pixel luma difference that counts as change
    pub threshold: u8,
    /// Minimum changed pixels before a detection is reported
    pub min_area: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by RUST_LOG
    pub filter: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: CaptureSource::TestPattern,
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            fps: 24,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            pin_core: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 5001,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            target_fps: 24,
            pacing_factor: 0.8,
            poll_interval_ms: 10,
            jpeg_quality: 85,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 32,
            min_area: 64,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "framecast=info".into(),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl StreamConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Sleep after each emitted chunk: `pacing_factor / target_fps`
    pub fn frame_interval(&self) -> Duration {
        let micros = 1_000_000.0 * f64::from(self.pacing_factor) / f64::from(self.target_fps.max(1));
        Duration::from_micros(micros.round() as u64)
    }
}

impl Config {
    /// Load defaults, then the optional TOML file, then `FRAMECAST_*` env vars
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Config>()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.capture.width == 0 || self.capture.height == 0 {
            return invalid("capture resolution must be non-zero");
        }
        if self.capture.fps == 0 {
            return invalid("capture.fps must be at least 1");
        }
        if self.capture.buffer_count == 0 {
            return invalid("capture.buffer_count must be at least 1");
        }
        if self.stream.target_fps == 0 {
            return invalid("stream.target_fps must be at least 1");
        }
        if !(self.stream.pacing_factor > 0.0 && self.stream.pacing_factor.is_finite()) {
            return invalid("stream.pacing_factor must be a positive number");
        }
        if self.stream.poll_interval_ms == 0 {
            return invalid("stream.poll_interval_ms must be at least 1");
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return invalid("stream.jpeg_quality must be between 1 and 100");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.server.port, 5001);
        assert_eq!((config.capture.width, config.capture.height), (640, 480));
        assert_eq!(config.stream.jpeg_quality, 85);
    }

    #[test]
    fn frame_interval_applies_pacing_factor() {
        let stream = StreamConfig {
            target_fps: 20,
            pacing_factor: 0.8,
            ..StreamConfig::default()
        };
        assert_eq!(stream.frame_interval(), Duration::from_millis(40));
    }

    #[test]
    fn rejects_bad_quality_and_zero_resolution() {
        let mut config = Config::default();
        config.stream.jpeg_quality = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.capture.height = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn deserializes_partial_toml() {
        let config = config::Config::builder()
            .add_source(config::File::from_str(
                "[server]\nport = 8000\n[capture]\nsource = \"test-pattern\"\nwidth = 320\n[detection]\nenabled = false\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize::<Config>()
            .unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.capture.width, 320);
        assert_eq!(config.capture.height, 480);
        assert_eq!(config.capture.source, CaptureSource::TestPattern);
        assert!(!config.detection.enabled);
    }
}
