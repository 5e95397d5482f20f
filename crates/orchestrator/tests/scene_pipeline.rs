//! End-to-end particle stepping on the CPU device, checked against a host
//! replay of the same integration.

use compute::{ComputeContext, ComputeDevice, CpuDevice, PollMode, ReleaseReport};
use orchestrator::config::{BackendType, DomainBounds, FluidSceneType, ReadbackMode};
use orchestrator::particles::spawn_particles;
use orchestrator::{kernels, Particle, ParticleSystem, SimulationConfig};

fn config(particle_count: usize, readback: ReadbackMode) -> SimulationConfig {
    SimulationConfig {
        name: "pipeline".to_string(),
        scene: FluidSceneType::Gel,
        cheap_variant: false,
        particle_count,
        group_size: 64,
        domain: DomainBounds {
            min: [0.0, 0.0],
            max: [1.0, 1.0],
        },
        gravity: [0.0, -9.81],
        dt: 0.02,
        max_steps: Some(40),
        backend: BackendType::Cpu,
        readback,
    }
}

fn cpu_context(device: CpuDevice) -> ComputeContext<CpuDevice> {
    let mut device = device;
    kernels::register_cpu(&mut device, 64);
    ComputeContext::new(device)
}

/// Host replay: escaped indices after each of `steps` steps.
fn replay(config: &SimulationConfig, steps: usize) -> Vec<Vec<u32>> {
    let mut particles = spawn_particles(config);
    (0..steps)
        .map(|_| {
            particles
                .iter_mut()
                .enumerate()
                .filter_map(|(i, p)| {
                    p.advance(config.gravity, config.dt);
                    p.is_outside(config.domain.min, config.domain.max)
                        .then_some(i as u32)
                })
                .collect()
        })
        .collect()
}

#[test]
fn blocking_counts_match_host_replay() {
    let config = config(500, ReadbackMode::Blocking);
    let expected = replay(&config, 40);
    assert!(expected.last().is_some_and(|e| !e.is_empty()), "scene should lose particles");

    let mut ctx = cpu_context(CpuDevice::new());
    let mut system = ParticleSystem::new(&config);
    system.upload(&mut ctx, &spawn_particles(&config)).unwrap();

    for (step, expected) in expected.iter().enumerate() {
        let outcome = system.step(&mut ctx, config.dt).unwrap();
        assert_eq!(outcome.escaped, Some(expected.len() as u32), "step {step}");

        let mut indices = system
            .escaped_indices(&mut ctx, expected.len() as u32)
            .unwrap();
        indices.sort_unstable();
        assert_eq!(&indices, expected, "step {step}");
    }
    assert_eq!(system.steps(), 40);
}

#[test]
fn async_counts_arrive_in_step_order() {
    let config = config(300, ReadbackMode::Async);
    let expected = replay(&config, 12);

    let mut ctx = cpu_context(CpuDevice::new().with_transfer_latency(2));
    let mut system = ParticleSystem::new(&config);
    system.upload(&mut ctx, &spawn_particles(&config)).unwrap();

    let mut landed = Vec::new();
    for _ in 0..12 {
        let outcome = system.step(&mut ctx, config.dt).unwrap();
        assert_eq!(outcome.escaped, None);
        ctx.poll(PollMode::Poll).unwrap();
        landed.extend(system.collect_counts());
    }
    assert!(system.pending_counts() > 0, "latency keeps the last requests in flight");

    ctx.poll(PollMode::Wait).unwrap();
    landed.extend(system.collect_counts());
    assert_eq!(system.pending_counts(), 0);

    let steps: Vec<u64> = landed.iter().map(|(step, _)| *step).collect();
    assert!(steps.iter().copied().eq(0..12));
    for (step, count) in landed {
        assert_eq!(count, Ok(expected[step as usize].len() as u32), "step {step}");
    }

    // Transient count buffers are gone; only the system's three remain.
    assert_eq!(ctx.device().live_allocations(), 3);
}

#[test]
fn upload_reuses_or_reallocates() {
    let config = config(64, ReadbackMode::Blocking);
    let mut ctx = cpu_context(CpuDevice::new());
    let mut system = ParticleSystem::new(&config);

    let particles = spawn_particles(&config);
    system.upload(&mut ctx, &particles).unwrap();
    assert_eq!(ctx.device().live_allocations(), 3);

    let moved: Vec<Particle> = particles
        .iter()
        .map(|p| Particle {
            position: [p.position[0], 0.9],
            velocity: [0.0, 0.0],
        })
        .collect();
    system.upload(&mut ctx, &moved).unwrap();
    assert_eq!(system.particles(&mut ctx).unwrap(), moved);
    assert_eq!(ctx.device().live_allocations(), 3);

    system.upload(&mut ctx, &moved[..10]).unwrap();
    assert_eq!(system.particle_count(), 10);
    assert_eq!(system.particles(&mut ctx).unwrap().len(), 10);
    assert_eq!(ctx.device().live_allocations(), 3);

    assert_eq!(system.release(&mut ctx), ReleaseReport { released: 3, skipped: 0 });
    assert_eq!(system.release(&mut ctx), ReleaseReport { released: 0, skipped: 3 });
    assert_eq!(ctx.device().live_allocations(), 0);
}

#[test]
fn empty_upload_steps_without_launching() {
    let config = config(1, ReadbackMode::Blocking);
    let mut ctx = cpu_context(CpuDevice::new());
    let mut system = ParticleSystem::new(&config);

    // Stepping before upload is a no-op.
    assert_eq!(system.step(&mut ctx, config.dt).unwrap().grid, None);

    system.upload(&mut ctx, &[]).unwrap();
    let outcome = system.step(&mut ctx, config.dt).unwrap();
    assert_eq!(outcome.grid, None);
    assert_eq!(outcome.escaped, Some(0));
    assert_eq!(ctx.device().launch_count(), 0);
}

#[test]
fn cpu_simulation_runs_from_config_file() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../configs/syrup-cheap.json");
    let runner = orchestrator::create_simulation(path).unwrap();
    let stats = runner.run_to_completion().unwrap();

    assert_eq!(stats.len(), 120);
    // 1024 particles in groups of 32.
    assert!(stats.iter().all(|s| s.groups == 32));
    assert!(stats.iter().all(|s| matches!(s.escaped, Some(n) if (0..=1024).contains(&n))));
}

#[test]
fn missing_config_is_an_error() {
    assert!(orchestrator::create_simulation("does/not/exist.json").is_err());
}

#[cfg(not(feature = "gpu"))]
#[test]
fn gpu_backend_without_feature_is_an_error() {
    let err = orchestrator::create_device(&BackendType::Gpu, 64).err();
    assert!(err.is_some_and(|e| e.to_string().contains("'gpu' feature")));
    assert!(orchestrator::create_device(&BackendType::Auto, 64).is_ok());
}
