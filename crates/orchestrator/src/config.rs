//! Configuration parsing and validation for particle scenes

use serde::{Deserialize, Serialize};
use std::fs;

/// Main simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Human-readable simulation name
    pub name: String,
    /// Which fluid scene to set up
    pub scene: FluidSceneType,
    /// Lighter variant of the scene (wider influence radius, fewer cells)
    #[serde(default)]
    pub cheap_variant: bool,
    /// Number of particles spawned at start
    pub particle_count: usize,
    /// Threads per group along x for both kernels
    #[serde(default = "default_group_size")]
    pub group_size: i32,
    /// Simulation domain bounds; particles leaving it are reported as escaped
    pub domain: DomainBounds,
    /// Gravity vector
    #[serde(default = "default_gravity")]
    pub gravity: [f32; 2],
    /// Fixed timestep (seconds)
    #[serde(default = "default_dt")]
    pub dt: f32,
    /// Stop after this many steps
    pub max_steps: Option<u64>,
    /// Compute backend
    #[serde(default)]
    pub backend: BackendType,
    /// How the escaped-particle count is read back each step
    #[serde(default)]
    pub readback: ReadbackMode,
}

/// Scene selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FluidSceneType {
    /// Introductory scene
    Intro,
    /// Low-viscosity water
    Water,
    /// High-viscosity syrup
    Syrup,
    /// Spring-bound slime
    Slime,
    /// Spring-bound gel
    Gel,
}

/// Domain bounding box
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainBounds {
    /// Minimum corner [x, y]
    pub min: [f32; 2],
    /// Maximum corner [x, y]
    pub max: [f32; 2],
}

/// Compute backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendType {
    /// CPU reference device
    Cpu,
    /// wgpu device (needs the `gpu` feature)
    Gpu,
    /// GPU when available, CPU otherwise
    #[default]
    Auto,
}

/// Escaped-count readback mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadbackMode {
    /// Wait for the count every step
    #[default]
    Blocking,
    /// Request the count and collect it on a later poll
    Async,
}

/// Per-scene field table applied on top of the config
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScenePreset {
    /// Render velocity colouring
    pub display_velocities: bool,
    /// Radius of the user interaction brush
    pub max_interaction_radius: f32,
    /// Neighbour search radius, in grid cells
    pub max_influence_radius: u32,
    /// Whether inter-particle springs are simulated
    pub simulate_springs: bool,
}

impl ScenePreset {
    /// Field values for `scene`; the cheap variant widens the influence radius.
    pub fn for_scene(scene: FluidSceneType, cheap_variant: bool) -> Self {
        let max_interaction_radius = match scene {
            FluidSceneType::Intro => 60.0,
            _ => 70.0,
        };
        let max_influence_radius = if scene == FluidSceneType::Syrup || cheap_variant {
            3
        } else {
            2
        };

        Self {
            display_velocities: scene == FluidSceneType::Water,
            max_interaction_radius,
            max_influence_radius,
            simulate_springs: !matches!(scene, FluidSceneType::Water | FluidSceneType::Syrup),
        }
    }
}

// Default values
fn default_group_size() -> i32 {
    64
}

fn default_gravity() -> [f32; 2] {
    [0.0, -9.81]
}

fn default_dt() -> f32 {
    1.0 / 120.0
}

impl SimulationConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &str) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        Self::from_json(&contents)
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self, String> {
        let config: SimulationConfig = serde_json::from_str(json)
            .map_err(|e| format!("Failed to parse config JSON: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.domain.min[0] >= self.domain.max[0] {
            return Err("Domain min.x must be less than max.x".to_string());
        }
        if self.domain.min[1] >= self.domain.max[1] {
            return Err("Domain min.y must be less than max.y".to_string());
        }

        if self.particle_count == 0 {
            return Err("particle_count must be at least 1".to_string());
        }
        if self.particle_count > u32::MAX as usize {
            return Err("particle_count does not fit a 32-bit index".to_string());
        }

        if self.group_size <= 0 {
            return Err("group_size must be positive".to_string());
        }

        if !self.dt.is_finite() || self.dt <= 0.0 {
            return Err("dt must be positive".to_string());
        }

        if let Some(max_steps) = self.max_steps {
            if max_steps == 0 {
                return Err("max_steps must be at least 1".to_string());
            }
        }

        Ok(())
    }

    /// Field table for the configured scene
    pub fn preset(&self) -> ScenePreset {
        ScenePreset::for_scene(self.scene, self.cheap_variant)
    }
}
