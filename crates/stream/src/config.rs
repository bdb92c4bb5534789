use std::path::Path;

use glam::{IVec3, Vec3};
use lodtrack_common::grid_coord;
use lodtrack_octree::MAX_RANGE;
use serde::{Deserialize, Serialize};

use crate::query::HandleParams;

/// Upper bound on configured levels; roots of size 2^15.
pub const MAX_LODS: u32 = 16;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid tracker config: {0}")]
    Invalid(String),
}

/// Tracker configuration. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// World units per finest-level cell.
    pub chunk_size: f32,
    /// Number of resolution levels; roots have size `2^(lods - 1)`.
    pub lods: u32,
    /// Half-width, in finest cells, of the full-resolution cube.
    pub min_lod_range: i32,
    /// Whether vertical movement crosses cell boundaries.
    pub track_y: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16.0,
            lods: 1,
            min_lod_range: 2,
            track_y: false,
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.chunk_size.is_finite() && self.chunk_size > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "chunk_size must be positive and finite, got {}",
                self.chunk_size
            )));
        }
        if self.lods == 0 || self.lods > MAX_LODS {
            return Err(ConfigError::Invalid(format!(
                "lods must be in 1..={MAX_LODS}, got {}",
                self.lods
            )));
        }
        if !(0..=MAX_RANGE).contains(&self.min_lod_range) {
            return Err(ConfigError::Invalid(format!(
                "min_lod_range must be in 0..={MAX_RANGE}, got {}",
                self.min_lod_range
            )));
        }
        Ok(())
    }

    /// Size of the coarsest cells. Assumes a validated config.
    pub fn max_lod(&self) -> i32 {
        1 << (self.lods.clamp(1, MAX_LODS) - 1)
    }

    pub fn handle_params(&self) -> HandleParams {
        HandleParams {
            lods: self.lods,
            min_lod_range: self.min_lod_range,
            track_y: self.track_y,
        }
    }

    /// Grid coordinate used to detect cell-boundary crossings.
    pub fn grid_coord(&self, position: Vec3) -> IVec3 {
        grid_coord(position, self.chunk_size, self.track_y)
    }

    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` file, or YAML for any other extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json_str(&source)?
        } else {
            Self::from_yaml_str(&source)?
        };
        tracing::debug!(path = %path.display(), ?config, "loaded tracker config");
        Ok(config)
    }
}
