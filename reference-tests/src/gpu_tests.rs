//! GPU backend conformance tests
//!
//! Runs the conformance suite and the particle pipeline on the wgpu device.
//! Each test returns early when no adapter is available.
//!
//! Gated behind `#[cfg(feature = "gpu")]`.

#![cfg(feature = "gpu")]

use crate::{gpu_context, run_suite};
use compute::{ComputeContext, ComputeDevice, PollMode};
use orchestrator::config::{BackendType, DomainBounds, FluidSceneType, ReadbackMode};
use orchestrator::particles::spawn_particles;
use orchestrator::{create_device, ParticleSystem, SimulationConfig};

fn scene(readback: ReadbackMode) -> SimulationConfig {
    SimulationConfig {
        name: "gpu-scene".to_string(),
        scene: FluidSceneType::Water,
        cheap_variant: false,
        particle_count: 2000,
        group_size: 64,
        domain: DomainBounds {
            min: [0.0, 0.0],
            max: [1.0, 1.0],
        },
        gravity: [0.0, -9.81],
        dt: 0.01,
        max_steps: Some(60),
        backend: BackendType::Gpu,
        readback,
    }
}

/// Escaped counts per step on the given backend, blocking reads.
fn escaped_counts(config: &SimulationConfig, backend: BackendType) -> Option<Vec<u32>> {
    let device = match create_device(&backend, config.group_size as u32) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("Skipping GPU pipeline test: {e}");
            return None;
        }
    };
    let mut ctx = ComputeContext::new(device);
    let mut system = ParticleSystem::new(config);
    system.upload(&mut ctx, &spawn_particles(config)).unwrap();

    let counts = (0..config.max_steps.unwrap_or(1))
        .map(|_| system.step(&mut ctx, config.dt).unwrap().escaped.unwrap())
        .collect();
    system.release(&mut ctx);
    assert_eq!(ctx.device().live_allocations(), 0);
    Some(counts)
}

#[test]
fn gpu_backend_passes_every_case() {
    let Some(mut ctx) = gpu_context() else {
        eprintln!("Skipping GPU conformance: no adapter");
        return;
    };
    let result = run_suite(&mut ctx);
    result.print_summary();

    for check in &result.checks {
        assert!(check.passed, "{}: {:?}", check.name, check.message);
    }
    assert_eq!(ctx.device().live_allocations(), 0);
}

#[test]
fn gpu_particle_counts_track_cpu() {
    let config = scene(ReadbackMode::Blocking);
    let Some(gpu) = escaped_counts(&config, BackendType::Gpu) else {
        return;
    };
    let cpu = escaped_counts(&config, BackendType::Cpu).unwrap();

    // Float contraction on the GPU can move a particle across the boundary a
    // step early or late; allow 1% of the particles.
    let tolerance = (config.particle_count / 100) as u32;
    for (step, (g, c)) in gpu.iter().zip(&cpu).enumerate() {
        assert!(
            g.abs_diff(*c) <= tolerance,
            "step {}: gpu {} vs cpu {}",
            step,
            g,
            c
        );
    }
    assert!(cpu.last().is_some_and(|&n| n > 0));
}

#[test]
fn gpu_async_counts_all_land() {
    let config = scene(ReadbackMode::Async);
    let device = match create_device(&BackendType::Gpu, config.group_size as u32) {
        Ok(device) => device,
        Err(e) => {
            eprintln!("Skipping GPU async test: {e}");
            return;
        }
    };
    let mut ctx = ComputeContext::new(device);
    let mut system = ParticleSystem::new(&config);
    system.upload(&mut ctx, &spawn_particles(&config)).unwrap();

    let mut landed = Vec::new();
    for _ in 0..30 {
        system.step(&mut ctx, config.dt).unwrap();
        ctx.poll(PollMode::Poll).unwrap();
        landed.extend(system.collect_counts());
    }
    ctx.poll(PollMode::Wait).unwrap();
    landed.extend(system.collect_counts());

    assert_eq!(landed.len(), 30);
    assert!(landed
        .iter()
        .all(|(_, count)| matches!(count, Ok(n) if *n <= config.particle_count as u32)));

    system.release(&mut ctx);
    assert_eq!(ctx.device().live_allocations(), 0);
}
