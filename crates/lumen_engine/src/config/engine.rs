//! Engine configuration sections

use serde::{Deserialize, Serialize};

use super::{Config, ConfigError};

/// Hard cap on GPU-visible lights; the light buffer is sized for this many
pub const MAX_GPU_LIGHTS: u32 = 64;

/// Largest patch resolution whose vertex grid fits 16-bit indices
pub const MAX_PATCH_RESOLUTION: u32 = 254;

/// Debug and diagnostics switches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DebugConfig {
    /// Draw object gizmos after the main pass
    pub draw_gizmos: bool,
    /// Include BVH node boxes in the gizmo overlay
    pub draw_bvh: bool,
    /// Record profiler samples
    pub enable_profiling: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            draw_gizmos: false,
            draw_bvh: false,
            enable_profiling: true,
        }
    }
}

/// Draw submission settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RendererConfig {
    /// Largest number of instances merged into one instanced draw
    pub max_instance_batch: u32,
    /// Number of lights uploaded to the GPU per frame (at most 64)
    pub max_gpu_lights: u32,
    /// Primitives per BVH leaf
    pub bvh_leaf_size: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            max_instance_batch: 1024,
            max_gpu_lights: MAX_GPU_LIGHTS,
            bvh_leaf_size: 1,
        }
    }
}

/// Shadow atlas and cascade settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShadowConfig {
    /// Edge length of the square shadow atlas in texels
    pub atlas_resolution: u32,
    /// Edge length of one atlas tile in texels
    pub tile_resolution: u32,
    /// Blend between uniform (0) and logarithmic (1) cascade splits
    pub cascade_lambda: f32,
    /// Distance from the view camera covered by sun cascades
    pub shadow_distance: f32,
    /// Extra depth range added behind each cascade to catch off-screen casters
    pub depth_padding: f32,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            atlas_resolution: 8192,
            tile_resolution: 1024,
            cascade_lambda: 0.75,
            shadow_distance: 100.0,
            depth_padding: 50.0,
        }
    }
}

impl ShadowConfig {
    /// Number of tiles along one edge of the atlas
    pub fn tiles_per_row(&self) -> u32 {
        self.atlas_resolution / self.tile_resolution.max(1)
    }

    /// Total number of shadow tiles in the atlas
    pub fn tile_count(&self) -> u32 {
        self.tiles_per_row() * self.tiles_per_row()
    }
}

/// Terrain quadtree settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerrainConfig {
    /// World-space edge length of the root node
    pub size: f32,
    /// Maximum terrain height, used for bounds
    pub height: f32,
    /// Vertices per world unit beyond which nodes stop splitting
    pub max_vertex_resolution: f32,
    /// Grid cells along one edge of a patch (even)
    pub patch_resolution: u32,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            size: 1024.0,
            height: 256.0,
            max_vertex_resolution: 2.0,
            patch_resolution: 16,
        }
    }
}

/// # Engine Configuration
///
/// Settings for every subsystem of the scene core. All sections default
/// individually, so partial files are valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// `env_logger` filter used when `RUST_LOG` is unset
    pub log_level: String,
    /// Debug switches
    pub debug: DebugConfig,
    /// Draw submission
    pub renderer: RendererConfig,
    /// Shadows
    pub shadows: ShadowConfig,
    /// Terrain
    pub terrain: TerrainConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            debug: DebugConfig::default(),
            renderer: RendererConfig::default(),
            shadows: ShadowConfig::default(),
            terrain: TerrainConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log filter
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Enable or disable the gizmo overlay
    pub fn with_gizmos(mut self, enabled: bool) -> Self {
        self.debug.draw_gizmos = enabled;
        self
    }

    /// Set the instancing batch limit
    pub fn with_max_instance_batch(mut self, max: u32) -> Self {
        self.renderer.max_instance_batch = max;
        self
    }

    /// Set atlas and tile resolution
    pub fn with_shadow_atlas(mut self, atlas_resolution: u32, tile_resolution: u32) -> Self {
        self.shadows.atlas_resolution = atlas_resolution;
        self.shadows.tile_resolution = tile_resolution;
        self
    }
}

impl Config for EngineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.renderer.max_instance_batch == 0 {
            return Err(ConfigError::Invalid("renderer.max_instance_batch must be at least 1".into()));
        }
        if self.renderer.max_gpu_lights > MAX_GPU_LIGHTS {
            return Err(ConfigError::Invalid(format!(
                "renderer.max_gpu_lights must not exceed {MAX_GPU_LIGHTS}"
            )));
        }
        if self.renderer.bvh_leaf_size == 0 {
            return Err(ConfigError::Invalid("renderer.bvh_leaf_size must be at least 1".into()));
        }
        let shadows = &self.shadows;
        if shadows.tile_resolution == 0
            || shadows.tile_resolution > shadows.atlas_resolution
            || shadows.atlas_resolution % shadows.tile_resolution != 0
        {
            return Err(ConfigError::Invalid(
                "shadows.atlas_resolution must be a non-zero multiple of shadows.tile_resolution".into(),
            ));
        }
        if shadows.shadow_distance <= 0.0 {
            return Err(ConfigError::Invalid("shadows.shadow_distance must be positive".into()));
        }
        let patch = self.terrain.patch_resolution;
        if !(2..=MAX_PATCH_RESOLUTION).contains(&patch) || patch % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "terrain.patch_resolution must be even and between 2 and {MAX_PATCH_RESOLUTION}"
            )));
        }
        if self.terrain.size <= 0.0 {
            return Err(ConfigError::Invalid("terrain.size must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFormat;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::new().validate().is_ok());
        assert_eq!(ShadowConfig::default().tile_count(), 64);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let text = r#"
            log_level = "debug"

            [renderer]
            max_instance_batch = 16

            [debug]
            draw_gizmos = true
        "#;
        let config = EngineConfig::from_str_with_format(text, ConfigFormat::Toml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.renderer.max_instance_batch, 16);
        assert_eq!(config.renderer.max_gpu_lights, MAX_GPU_LIGHTS);
        assert!(config.debug.draw_gizmos);
        assert_eq!(config.shadows, ShadowConfig::default());
    }

    #[test]
    fn test_ron_round_trip() {
        let config = EngineConfig::new().with_gizmos(true).with_shadow_atlas(4096, 512);
        let text = config.to_string_with_format(ConfigFormat::Ron).unwrap();
        let parsed = EngineConfig::from_str_with_format(&text, ConfigFormat::Ron).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let too_many_lights = EngineConfig {
            renderer: RendererConfig {
                max_gpu_lights: 65,
                ..Default::default()
            },
            ..EngineConfig::new()
        };
        assert!(matches!(too_many_lights.validate(), Err(ConfigError::Invalid(_))));

        let uneven_atlas = EngineConfig::new().with_shadow_atlas(1000, 300);
        assert!(uneven_atlas.validate().is_err());

        let no_batching = EngineConfig::new().with_max_instance_batch(0);
        assert!(no_batching.validate().is_err());
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let result = EngineConfig::load_from_file("engine.yaml");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }
}
