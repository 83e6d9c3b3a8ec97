//! Configuration loading from TOML
//!
//! # Configuration File Format
//!
//! ```toml
//! [detector]
//! ip = "192.168.1.2"
//! cmd_port = 3000
//! img_port = 4001
//! pixel_depth = 16
//!
//! [command]
//! timeout_ms = 20000
//! heartbeat = true
//! heartbeat_period_ms = 1000
//!
//! [acquisition]
//! image_timeout_ms = 1000
//! lines_per_frame = 1024
//! header_mode = false
//! ```
//!
//! Every field is optional; defaults match the detector's factory settings.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Detector addressing and geometry.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Detector IP address.
    #[serde(default = "default_ip")]
    pub ip: String,

    /// Command channel port.
    #[serde(default = "default_cmd_port")]
    pub cmd_port: u16,

    /// Image channel port.
    #[serde(default = "default_img_port")]
    pub img_port: u16,

    /// Bits per pixel on the image stream (12/14/16/18/20).
    #[serde(default = "default_pixel_depth")]
    pub pixel_depth: u8,
}

fn default_ip() -> String {
    "192.168.1.2".to_string()
}
fn default_cmd_port() -> u16 {
    3000
}
fn default_img_port() -> u16 {
    4001
}
fn default_pixel_depth() -> u8 {
    16
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            ip: default_ip(),
            cmd_port: default_cmd_port(),
            img_port: default_img_port(),
            pixel_depth: default_pixel_depth(),
        }
    }
}

/// Command channel behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    /// Request/response deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Start the heartbeat thread when a session opens.
    #[serde(default = "default_heartbeat")]
    pub heartbeat: bool,

    /// Heartbeat poll period in milliseconds.
    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,
}

fn default_timeout_ms() -> u64 {
    20_000
}
fn default_heartbeat() -> bool {
    true
}
fn default_heartbeat_period_ms() -> u64 {
    1_000
}

impl Default for CommandConfig {
    fn default() -> Self {
        CommandConfig {
            timeout_ms: default_timeout_ms(),
            heartbeat: default_heartbeat(),
            heartbeat_period_ms: default_heartbeat_period_ms(),
        }
    }
}

/// Image channel behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionConfig {
    /// Poll deadline for one image packet in milliseconds.
    #[serde(default = "default_image_timeout_ms")]
    pub image_timeout_ms: u64,

    /// Lines grouped into one frame.
    #[serde(default = "default_lines_per_frame")]
    pub lines_per_frame: u32,

    /// Expect the per-line packet header on the stream.
    #[serde(default)]
    pub header_mode: bool,
}

fn default_image_timeout_ms() -> u64 {
    1_000
}
fn default_lines_per_frame() -> u32 {
    1_024
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        AcquisitionConfig {
            image_timeout_ms: default_image_timeout_ms(),
            lines_per_frame: default_lines_per_frame(),
            header_mode: false,
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub command: CommandConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
}

/// Pixel depths the acquisition path understands.
const SUPPORTED_DEPTHS: [u8; 5] = [12, 14, 16, 18, 20];

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Validation
    ///
    /// - command and image ports must differ
    /// - `pixel_depth` must be one of 12/14/16/18/20
    /// - `lines_per_frame` must be non-zero
    /// - `heartbeat_period_ms` must be non-zero
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("failed to read config: {}", e)))?;

        let config: Config = basic_toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the invariants the sessions rely on.
    pub fn validate(&self) -> Result<()> {
        if self.detector.cmd_port == self.detector.img_port {
            return Err(Error::Config(format!(
                "cmd_port and img_port must differ (both {})",
                self.detector.cmd_port
            )));
        }
        if !SUPPORTED_DEPTHS.contains(&self.detector.pixel_depth) {
            return Err(Error::Config(format!(
                "pixel_depth must be one of 12/14/16/18/20 (got {})",
                self.detector.pixel_depth
            )));
        }
        if self.acquisition.lines_per_frame == 0 {
            return Err(Error::Config(
                "lines_per_frame must be non-zero".to_string(),
            ));
        }
        if self.command.heartbeat_period_ms == 0 {
            return Err(Error::Config(
                "heartbeat_period_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_factory_settings() {
        let config = Config::default();
        assert_eq!(config.detector.ip, "192.168.1.2");
        assert_eq!(config.detector.cmd_port, 3000);
        assert_eq!(config.detector.img_port, 4001);
        assert_eq!(config.command.timeout_ms, 20_000);
        assert_eq!(config.command.heartbeat_period_ms, 1_000);
        assert_eq!(config.acquisition.image_timeout_ms, 1_000);
        assert_eq!(config.acquisition.lines_per_frame, 1_024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[detector]\nip = \"10.0.0.9\"\ncmd_port = 3100").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.detector.ip, "10.0.0.9");
        assert_eq!(config.detector.cmd_port, 3100);
        assert_eq!(config.detector.img_port, 4001);
        assert!(config.command.heartbeat);
    }

    #[test]
    fn equal_ports_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[detector]\ncmd_port = 4001").unwrap();
        assert!(matches!(Config::load(file.path()), Err(Error::Config(_))));
    }

    #[test]
    fn odd_pixel_depth_is_rejected() {
        let config = Config {
            detector: DetectorConfig {
                pixel_depth: 13,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
