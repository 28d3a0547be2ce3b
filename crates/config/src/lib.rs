//! Shared configuration for the surface embedding engine
//!
//! This crate provides the single source of truth for the frame budget, the
//! coarse step sizes of the cooperative worker, and the optional deformation
//! behaviours (patches, undo capture, collider rebuilds). Hosts either use
//! [`DeformationConfig::default`] or load a JSON document.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[cfg(feature = "bevy")]
use bevy::prelude::Resource;

/// Default extra displacement (metres) pushed beyond an object's back plane
pub const DEFAULT_EXTRA_DISPLACEMENT: f32 = 0.02;

/// Default processing budget per frame, in seconds
pub const DEFAULT_MAX_SECONDS_PER_FRAME: f32 = 4e-3;

/// Default number of vertices transformed per cooperative step
pub const DEFAULT_VERTICES_PER_STEP: usize = 1024;

/// Default number of triangles tested per cooperative step
pub const DEFAULT_TRIANGLES_PER_STEP: usize = 512;

/// Default edge length (metres) of a margin region cell
pub const DEFAULT_REGION_CELL_SIZE: f32 = 0.5;

/// Default number of undo entries kept before the oldest is dropped
pub const DEFAULT_MAX_UNDO_ENTRIES: usize = 20;

fn default_region_cell_size() -> f32 {
    DEFAULT_REGION_CELL_SIZE
}

/// Errors produced while loading or validating a configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// How the vertex projector treats vertices that already lie beyond the plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionMode {
    /// Move every selected vertex exactly onto the plane, from either side
    #[default]
    Unconditional,
    /// Leave vertices that are already at or past the plane untouched
    RecessOnly,
}

/// Granularity of the margin memoization cache
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MarginMode {
    /// One guaranteed depth per mesh
    #[default]
    PerMesh,
    /// One guaranteed depth per mesh and world-space grid cell
    PerRegion {
        #[serde(default = "default_region_cell_size")]
        cell_size: f32,
    },
}

impl MarginMode {
    /// Per-region tracking with the default cell size
    pub fn per_region() -> Self {
        MarginMode::PerRegion {
            cell_size: DEFAULT_REGION_CELL_SIZE,
        }
    }
}

/// Deformation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "bevy", derive(Resource))]
#[serde(default)]
pub struct DeformationConfig {
    /// Extra displacement beyond an embedded object's back plane (metres)
    pub extra_displacement: f32,
    /// Wall-clock budget per `update` call (seconds)
    pub max_seconds_per_frame: f32,
    /// Vertices transformed into box space per coarse step
    pub vertices_per_step: usize,
    /// Triangles tested against the box per coarse step
    pub triangles_per_step: usize,
    /// Snapshot displaced regions as independent patch meshes
    pub create_patches: bool,
    /// Record original vertex positions in the undo log
    pub record_undo: bool,
    /// Undo entries kept; the oldest is dropped past this
    pub max_undo_entries: usize,
    /// Rebuild collision geometry after each mesh is displaced (expensive)
    pub rebuild_collision: bool,
    /// Projection behaviour for vertices already past the plane
    pub projection_mode: ProjectionMode,
    /// Margin cache granularity
    pub margin_mode: MarginMode,
}

impl Default for DeformationConfig {
    fn default() -> Self {
        Self {
            extra_displacement: DEFAULT_EXTRA_DISPLACEMENT,
            max_seconds_per_frame: DEFAULT_MAX_SECONDS_PER_FRAME,
            vertices_per_step: DEFAULT_VERTICES_PER_STEP,
            triangles_per_step: DEFAULT_TRIANGLES_PER_STEP,
            create_patches: false,
            record_undo: false,
            max_undo_entries: DEFAULT_MAX_UNDO_ENTRIES,
            rebuild_collision: false,
            projection_mode: ProjectionMode::default(),
            margin_mode: MarginMode::default(),
        }
    }
}

impl DeformationConfig {
    /// Parse and validate a configuration from a JSON string.
    ///
    /// Missing fields take their default values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Frame budget as a [`Duration`]
    pub fn frame_budget(&self) -> Duration {
        Duration::from_secs_f32(self.max_seconds_per_frame.max(0.0))
    }

    /// Check every field for a usable value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.extra_displacement.is_finite() || self.extra_displacement < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "extra_displacement",
                reason: format!("must be finite and >= 0, got {}", self.extra_displacement),
            });
        }
        if !self.max_seconds_per_frame.is_finite() || self.max_seconds_per_frame < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "max_seconds_per_frame",
                reason: format!("must be finite and >= 0, got {}", self.max_seconds_per_frame),
            });
        }
        if self.vertices_per_step == 0 {
            return Err(ConfigError::InvalidValue {
                field: "vertices_per_step",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.triangles_per_step == 0 {
            return Err(ConfigError::InvalidValue {
                field: "triangles_per_step",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_undo_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_undo_entries",
                reason: "must be at least 1".to_string(),
            });
        }
        if let MarginMode::PerRegion { cell_size } = self.margin_mode {
            if !cell_size.is_finite() || cell_size <= 0.0 {
                return Err(ConfigError::InvalidValue {
                    field: "margin_mode.cell_size",
                    reason: format!("must be finite and > 0, got {cell_size}"),
                });
            }
        }
        Ok(())
    }
}
