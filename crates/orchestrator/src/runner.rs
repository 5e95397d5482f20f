//! Simulation runner with lifecycle management
//!
//! This module provides the `SimulationRunner` which steps a
//! [`ParticleSystem`] in a background thread, including start, pause,
//! resume, and per-step statistics.

use compute::{ComputeContext, ComputeDevice, CountSentinel, PollMode};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::particles::ParticleSystem;

/// Runner state enum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerState {
    /// Simulation created but not yet started
    Created,
    /// Simulation actively running
    Running,
    /// Simulation paused
    Paused,
    /// Simulation finished (reached stopping condition)
    Finished,
    /// Simulation encountered an error
    Error,
}

/// Statistics for one executed step
#[derive(Debug, Clone, PartialEq)]
pub struct StepStats {
    /// Zero-based step index
    pub step: u64,
    /// Thread groups launched per kernel
    pub groups: u64,
    /// Particles outside the domain after the step; `None` until an async
    /// readback lands, and the error sentinel (-1) if it failed
    pub escaped: Option<i64>,
    /// Host time spent issuing the step (microseconds)
    pub wall_us: u64,
}

/// Shared state between the runner thread and control interface
struct SharedState {
    /// Current runner state
    state: RunnerState,
    /// Current simulation time (seconds)
    sim_time: f64,
    /// Number of steps executed
    step_count: u64,
    /// Per-step statistics, indexed by step
    stats: Vec<StepStats>,
    /// Most recent error message (if state is Error)
    error_message: Option<String>,
}

fn lock(shared: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle for controlling and querying a running simulation
pub struct SimulationRunner {
    /// Shared state (protected by mutex)
    shared: Arc<Mutex<SharedState>>,
    /// Handle to the background thread
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl SimulationRunner {
    /// Create a new simulation runner
    ///
    /// # Arguments
    /// * `ctx` - Compute context the particle system's buffers live in
    /// * `system` - Particle system, already uploaded
    /// * `dt` - Fixed timestep (seconds)
    /// * `max_steps` - Optional maximum number of steps
    pub fn new<D>(
        ctx: ComputeContext<D>,
        system: ParticleSystem,
        dt: f32,
        max_steps: Option<u64>,
    ) -> Self
    where
        D: ComputeDevice + Send + 'static,
    {
        let shared = Arc::new(Mutex::new(SharedState {
            state: RunnerState::Created,
            sim_time: 0.0,
            step_count: 0,
            stats: Vec::new(),
            error_message: None,
        }));

        let shared_clone = Arc::clone(&shared);

        // Spawn background thread
        let thread_handle = thread::spawn(move || {
            run_simulation_loop(ctx, system, shared_clone, dt, max_steps);
        });

        Self {
            shared,
            thread_handle: Some(thread_handle),
        }
    }

    /// Get current runner state
    pub fn state(&self) -> RunnerState {
        lock(&self.shared).state.clone()
    }

    /// Get current simulation time (seconds)
    pub fn sim_time(&self) -> f64 {
        lock(&self.shared).sim_time
    }

    /// Get current step count
    pub fn step_count(&self) -> u64 {
        lock(&self.shared).step_count
    }

    /// Get error message if state is Error
    pub fn error_message(&self) -> Option<String> {
        lock(&self.shared).error_message.clone()
    }

    /// Snapshot of the per-step statistics so far
    pub fn stats(&self) -> Vec<StepStats> {
        lock(&self.shared).stats.clone()
    }

    /// Pause the simulation
    pub fn pause(&self) {
        let mut state = lock(&self.shared);
        if state.state == RunnerState::Running {
            state.state = RunnerState::Paused;
        }
    }

    /// Resume the simulation
    pub fn resume(&self) {
        let mut state = lock(&self.shared);
        if state.state == RunnerState::Paused {
            state.state = RunnerState::Running;
        }
    }

    /// Start the simulation (transition from Created to Running)
    pub fn start(&self) {
        let mut state = lock(&self.shared);
        if state.state == RunnerState::Created {
            state.state = RunnerState::Running;
        }
    }

    /// Stop the simulation; the thread drains outstanding readbacks and
    /// releases its buffers before exiting
    pub fn stop(&self) {
        let mut state = lock(&self.shared);
        if matches!(
            state.state,
            RunnerState::Created | RunnerState::Running | RunnerState::Paused
        ) {
            state.state = RunnerState::Finished;
        }
    }

    /// Wait for the simulation thread to complete
    pub fn join(mut self) -> Result<(), String> {
        if let Some(handle) = self.thread_handle.take() {
            handle.join().map_err(|_| "Thread panicked".to_string())?;
        }
        Ok(())
    }

    /// Start, wait for `max_steps` and return the statistics. Without a
    /// step limit this never returns.
    pub fn run_to_completion(self) -> Result<Vec<StepStats>, String> {
        self.start();
        let shared = Arc::clone(&self.shared);
        self.join()?;

        let guard = lock(&shared);
        match (&guard.state, &guard.error_message) {
            (RunnerState::Error, Some(message)) => Err(message.clone()),
            (RunnerState::Error, None) => Err("simulation failed".to_string()),
            _ => Ok(guard.stats.clone()),
        }
    }
}

impl Drop for SimulationRunner {
    fn drop(&mut self) {
        // Set state to Finished to signal thread to exit
        self.stop();
    }
}

fn fail(shared: &Mutex<SharedState>, message: String) {
    tracing::error!("Simulation failed: {}", message);
    let mut guard = lock(shared);
    guard.state = RunnerState::Error;
    guard.error_message = Some(message);
}

/// Writes landed async counts into the per-step statistics.
fn record_counts(system: &mut ParticleSystem, shared: &Mutex<SharedState>) {
    let counts = system.collect_counts();
    if counts.is_empty() {
        return;
    }
    let mut guard = lock(shared);
    for (step, count) in counts {
        if let Err(e) = &count {
            tracing::warn!("Escaped count for step {} unavailable: {}", step, e);
        }
        if let Some(stats) = guard.stats.get_mut(step as usize) {
            stats.escaped = Some(count.sentinel());
        }
    }
}

/// Main simulation loop executed in background thread
fn run_simulation_loop<D: ComputeDevice>(
    mut ctx: ComputeContext<D>,
    mut system: ParticleSystem,
    shared: Arc<Mutex<SharedState>>,
    dt: f32,
    max_steps: Option<u64>,
) {
    // Wait for start signal
    let started = loop {
        let state = lock(&shared).state.clone();

        match state {
            RunnerState::Created => {
                // Wait a bit and check again
                thread::sleep(Duration::from_millis(10));
            }
            RunnerState::Running => break true,
            _ => break false,
        }
    };

    let start_wall_time = Instant::now();
    let mut sim_time = 0.0_f64;
    let mut step_count = 0_u64;

    while started {
        let current_state = lock(&shared).state.clone();

        match current_state {
            RunnerState::Running => {
                let t = Instant::now();
                let outcome = match system.step(&mut ctx, dt) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        fail(&shared, format!("step {} failed: {}", step_count, e));
                        break;
                    }
                };
                if let Err(e) = ctx.poll(PollMode::Poll) {
                    fail(&shared, format!("poll after step {} failed: {}", step_count, e));
                    break;
                }
                let wall_us = t.elapsed().as_micros() as u64;

                sim_time += dt as f64;
                step_count += 1;

                {
                    let mut guard = lock(&shared);
                    guard.sim_time = sim_time;
                    guard.step_count = step_count;
                    guard.stats.push(StepStats {
                        step: step_count - 1,
                        groups: outcome.grid.map_or(0, |g| g.total_groups()),
                        escaped: outcome.escaped.map(i64::from),
                        wall_us,
                    });
                }
                record_counts(&mut system, &shared);

                if let Some(max_steps) = max_steps {
                    if step_count >= max_steps {
                        tracing::info!("Simulation finished: reached max_steps = {}", max_steps);
                        let mut guard = lock(&shared);
                        if guard.state == RunnerState::Running {
                            guard.state = RunnerState::Finished;
                        }
                        break;
                    }
                }

                if step_count % 100 == 0 {
                    tracing::debug!(
                        "Step {}: sim_time={:.4}s, wall_time={:.2}s, pending counts={}",
                        step_count,
                        sim_time,
                        start_wall_time.elapsed().as_secs_f64(),
                        system.pending_counts(),
                    );
                }
            }
            RunnerState::Paused => {
                // Wait while paused
                thread::sleep(Duration::from_millis(50));
            }
            RunnerState::Finished | RunnerState::Error | RunnerState::Created => break,
        }
    }

    // Land outstanding counts before the buffers go away.
    if system.pending_counts() > 0 {
        if let Err(e) = ctx.poll(PollMode::Wait) {
            tracing::warn!("Draining readbacks failed: {}", e);
        }
        record_counts(&mut system, &shared);
    }

    let report = system.release(&mut ctx);
    tracing::info!(
        "Simulation thread exiting: {} steps, {:.4}s simulated, {} buffers released",
        step_count,
        sim_time,
        report.released
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendType, DomainBounds, FluidSceneType, ReadbackMode, SimulationConfig};
    use crate::kernels;
    use crate::particles::spawn_particles;
    use compute::CpuDevice;

    fn setup(max_steps: Option<u64>, readback: ReadbackMode) -> SimulationRunner {
        let config = SimulationConfig {
            name: "runner".to_string(),
            scene: FluidSceneType::Water,
            cheap_variant: false,
            particle_count: 100,
            group_size: 32,
            domain: DomainBounds {
                min: [0.0, 0.0],
                max: [1.0, 1.0],
            },
            gravity: [0.0, -9.81],
            dt: 0.01,
            max_steps,
            backend: BackendType::Cpu,
            readback,
        };

        let mut device = CpuDevice::new().with_transfer_latency(1);
        kernels::register_cpu(&mut device, config.group_size as u32);
        let mut ctx = ComputeContext::new(device);
        let mut system = ParticleSystem::new(&config);
        system.upload(&mut ctx, &spawn_particles(&config)).unwrap();

        SimulationRunner::new(ctx, system, config.dt, config.max_steps)
    }

    #[test]
    fn test_runner_lifecycle() {
        let runner = setup(Some(10), ReadbackMode::Blocking);

        // Initially Created
        assert_eq!(runner.state(), RunnerState::Created);

        // Start
        runner.start();
        assert!(matches!(
            runner.state(),
            RunnerState::Running | RunnerState::Finished
        ));

        let stats = runner.run_to_completion().unwrap();
        assert_eq!(stats.len(), 10);
        assert!(stats.iter().all(|s| s.groups == 4 && s.escaped.is_some()));
    }

    #[test]
    fn test_async_counts_land_before_exit() {
        let runner = setup(Some(25), ReadbackMode::Async);
        let stats = runner.run_to_completion().unwrap();

        assert_eq!(stats.len(), 25);
        for s in &stats {
            let escaped = s.escaped.expect("every async count lands");
            assert!((0..=100).contains(&escaped), "step {}: {}", s.step, escaped);
        }
    }

    #[test]
    fn test_runner_pause_resume() {
        let runner = setup(None, ReadbackMode::Blocking);

        runner.start();
        thread::sleep(Duration::from_millis(20));

        // Pause
        runner.pause();

        // Wait for pause to take effect
        thread::sleep(Duration::from_millis(100));
        assert_eq!(runner.state(), RunnerState::Paused);

        let steps_paused = runner.step_count();
        thread::sleep(Duration::from_millis(100));

        // Should not advance while paused (allow for 1 step race condition)
        let steps_after_pause = runner.step_count();
        assert!(
            steps_after_pause <= steps_paused + 1,
            "Steps should not advance while paused: before={}, after={}",
            steps_paused,
            steps_after_pause
        );

        // Resume
        runner.resume();
        assert_eq!(runner.state(), RunnerState::Running);

        runner.stop();
        runner.join().unwrap();
    }
}
