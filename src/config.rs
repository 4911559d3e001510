//! Layered configuration: built-in defaults, TOML file, environment

use std::collections::HashSet;
use std::path::Path;

use config::{Environment, File, FileFormat};
use tracing::info;

use crate::error::{CaptureError, Result};
use crate::{CameraConfig, Config};

/// More cameras than this are not supported by one process
pub const MAX_CAMERAS: usize = 2;

impl Config {
    /// Load defaults, then `path` (if any), then `APERTURE__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        builder = builder.add_source(
            Environment::with_prefix("APERTURE")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder.build()?.try_deserialize()?;
        config.with_default_camera().validated()
    }

    /// Parse a TOML document on top of the defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.with_default_camera().validated()
    }

    fn with_default_camera(mut self) -> Self {
        if self.cameras.is_empty() {
            self.cameras.push(CameraConfig::default());
        }
        self
    }

    fn validated(self) -> Result<Self> {
        if self.cameras.len() > MAX_CAMERAS {
            return Err(CaptureError::ConfigurationRejected(format!(
                "{} cameras configured, at most {} supported",
                self.cameras.len(),
                MAX_CAMERAS
            )));
        }

        let mut seen = HashSet::new();
        for camera in self.cameras.iter().filter(|c| !c.id.is_empty()) {
            if !seen.insert(camera.id.as_str()) {
                return Err(CaptureError::ConfigurationRejected(format!(
                    "camera {} configured twice",
                    camera.id
                )));
            }
        }

        if let Some(camera) = self
            .cameras
            .iter()
            .find(|c| c.buffer_count == Some(0))
        {
            return Err(CaptureError::ConfigurationRejected(format!(
                "camera {:?} requests zero buffers",
                camera.id
            )));
        }
        Ok(self)
    }
}
