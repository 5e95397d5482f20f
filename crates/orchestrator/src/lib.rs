//! Orchestration Layer
//!
//! This crate sets up and steps particle scenes on top of the `compute`
//! layer:
//! - Scene configuration and per-scene presets
//! - Particle buffers and the integrate/cull step sequence
//! - Kernel registration for the CPU and wgpu backends
//! - Simulation runner with lifecycle management

#![warn(missing_docs)]

pub mod config;
pub mod kernels;
pub mod particles;
pub mod runner;

pub use config::SimulationConfig;
pub use particles::{Particle, ParticleSystem};
pub use runner::SimulationRunner;

use compute::{ComputeContext, ComputeDevice, CpuDevice};

/// Device type the runner drives, chosen at runtime.
pub type SimDevice = Box<dyn ComputeDevice + Send>;

/// Create a complete simulation from a configuration file
///
/// This function performs the full simulation setup pipeline:
/// 1. Load and validate the configuration
/// 2. Resolve the scene preset
/// 3. Create the compute device and register both kernels
/// 4. Spawn the particles and upload them
/// 5. Wrap in a SimulationRunner for lifecycle management
///
/// # Arguments
/// * `config_path` - Path to the JSON configuration file
///
/// # Returns
/// A `SimulationRunner` ready to be started, or an error if setup fails
///
/// # Example
/// ```no_run
/// use orchestrator::create_simulation;
///
/// let runner = create_simulation("configs/water.json")?;
/// runner.start();
/// // ... query status, pause, resume, etc.
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn create_simulation(config_path: &str) -> Result<SimulationRunner, Box<dyn std::error::Error>> {
    tracing::info!("Creating simulation from config: {}", config_path);

    // 1. Load and validate configuration
    let config = SimulationConfig::load(config_path)?;
    tracing::info!("Configuration loaded: {}", config.name);

    create_simulation_from(&config)
}

/// Same pipeline as [`create_simulation`] for an already loaded config.
pub fn create_simulation_from(
    config: &SimulationConfig,
) -> Result<SimulationRunner, Box<dyn std::error::Error>> {
    config.validate()?;

    // 2. Scene preset
    let preset = config.preset();
    tracing::info!(
        "Scene {:?}{}: interaction radius {}, influence radius {}, springs {}, velocity display {}",
        config.scene,
        if config.cheap_variant { " (cheap)" } else { "" },
        preset.max_interaction_radius,
        preset.max_influence_radius,
        preset.simulate_springs,
        preset.display_velocities,
    );

    // 3. Device and kernels
    let device = create_device(&config.backend, config.group_size as u32)?;
    let mut ctx = ComputeContext::new(device);

    // 4. Particles
    let particles = particles::spawn_particles(config);
    let mut system = ParticleSystem::new(config);
    system.upload(&mut ctx, &particles)?;
    tracing::info!("Uploaded {} particles", system.particle_count());

    // 5. Wrap in SimulationRunner
    let runner = SimulationRunner::new(ctx, system, config.dt, config.max_steps);

    tracing::info!("Simulation ready to start");
    Ok(runner)
}

fn cpu_device(group_size: u32) -> SimDevice {
    let mut device = CpuDevice::new();
    kernels::register_cpu(&mut device, group_size);
    Box::new(device)
}

#[cfg(feature = "gpu")]
fn gpu_device(group_size: u32) -> compute::ComputeResult<SimDevice> {
    let mut device = compute::WgpuDevice::new()?;
    kernels::register_wgpu(&mut device, group_size)?;
    Ok(Box::new(device))
}

/// Create a compute device with both particle kernels registered, based on
/// the backend configuration.
///
/// For `Auto`, attempts GPU first and falls back to CPU if unavailable.
/// For `Gpu`, returns an error if the GPU cannot be initialized.
/// For `Cpu`, always returns the CPU device.
pub fn create_device(
    backend: &config::BackendType,
    group_size: u32,
) -> Result<SimDevice, Box<dyn std::error::Error>> {
    match backend {
        config::BackendType::Cpu => {
            tracing::info!("Creating CPU compute device...");
            Ok(cpu_device(group_size))
        }
        #[cfg(feature = "gpu")]
        config::BackendType::Gpu => {
            tracing::info!("Creating GPU compute device...");
            gpu_device(group_size)
                .map_err(|e| format!("GPU backend requested but initialization failed: {e}").into())
        }
        #[cfg(not(feature = "gpu"))]
        config::BackendType::Gpu => Err(
            "GPU backend requested but 'gpu' feature is not enabled. Compile with --features gpu".into(),
        ),
        #[cfg(feature = "gpu")]
        config::BackendType::Auto => {
            tracing::info!("Auto-detecting backend...");
            if compute::gpu_available() {
                match gpu_device(group_size) {
                    Ok(device) => Ok(device),
                    Err(e) => {
                        tracing::warn!("GPU init failed ({e}), falling back to CPU");
                        Ok(cpu_device(group_size))
                    }
                }
            } else {
                tracing::info!("No GPU available, using CPU device");
                Ok(cpu_device(group_size))
            }
        }
        #[cfg(not(feature = "gpu"))]
        config::BackendType::Auto => {
            tracing::info!("GPU feature not enabled, using CPU device");
            Ok(cpu_device(group_size))
        }
    }
}
