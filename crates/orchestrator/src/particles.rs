//! Particle buffers and the per-step kernel sequence.
//!
//! A [`ParticleSystem`] owns three device buffers: the particle array, an
//! append buffer collecting indices of particles that left the domain this
//! step, and a count buffer for blocking count reads. Each step resets the
//! append counter, integrates, culls, then reads the escaped count either
//! blocking or through a [`ReadbackHandle`] collected on a later poll.

use std::collections::VecDeque;

use bytemuck::{Pod, Zeroable};
use compute::{
    ComputeContext, ComputeDevice, ComputeResult, CountReadback, ExecutionGrid, GpuBuffer,
    KernelCall, ReadbackHandle, ReleaseReport,
};

use crate::config::{ReadbackMode, SimulationConfig};

/// Name of the integration kernel.
pub const INTEGRATE_KERNEL: &str = "integrate";
/// Name of the kernel appending escaped particle indices.
pub const CULL_KERNEL: &str = "cull_escaped";

/// One particle, laid out as two `vec2<f32>`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Particle {
    /// Position [x, y]
    pub position: [f32; 2],
    /// Velocity [vx, vy]
    pub velocity: [f32; 2],
}

impl Particle {
    /// Semi-implicit Euler step under constant acceleration.
    pub fn advance(&mut self, gravity: [f32; 2], dt: f32) {
        self.velocity[0] += gravity[0] * dt;
        self.velocity[1] += gravity[1] * dt;
        self.position[0] += self.velocity[0] * dt;
        self.position[1] += self.velocity[1] * dt;
    }

    /// Whether the particle lies outside `[min, max]` on either axis.
    pub fn is_outside(&self, min: [f32; 2], max: [f32; 2]) -> bool {
        let [x, y] = self.position;
        x < min[0] || y < min[1] || x > max[0] || y > max[1]
    }
}

/// Uniform block shared by both kernels (32 bytes, std140-compatible).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct StepParams {
    /// Live particles; invocations at or past this index do nothing
    pub particle_count: u32,
    /// Timestep (seconds)
    pub dt: f32,
    /// Gravity vector
    pub gravity: [f32; 2],
    /// Domain minimum corner
    pub domain_min: [f32; 2],
    /// Domain maximum corner
    pub domain_max: [f32; 2],
}

/// Deterministic initial block: a grid filling the upper middle of the
/// domain, columns drifting outward so the edges escape over time.
pub fn spawn_particles(config: &SimulationConfig) -> Vec<Particle> {
    let n = config.particle_count;
    if n == 0 {
        return Vec::new();
    }
    let [min_x, min_y] = config.domain.min;
    let [max_x, max_y] = config.domain.max;
    let (width, height) = (max_x - min_x, max_y - min_y);

    let cols = ((n as f32).sqrt().ceil() as usize).max(1);
    let rows = n.div_ceil(cols);
    let spacing = [width * 0.5 / cols as f32, height * 0.5 / rows as f32];
    let origin = [min_x + width * 0.25, min_y + height * 0.5];

    (0..n)
        .map(|i| {
            let (col, row) = ((i % cols) as f32 + 0.5, (i / cols) as f32 + 0.5);
            let drift = col / cols as f32 - 0.5;
            Particle {
                position: [origin[0] + col * spacing[0], origin[1] + row * spacing[1]],
                velocity: [drift * width, 0.0],
            }
        })
        .collect()
}

/// Result of one [`ParticleSystem::step`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOutcome {
    /// Groups launched per kernel, `None` when there were no particles.
    pub grid: Option<ExecutionGrid>,
    /// Escaped count, present only in blocking mode.
    pub escaped: Option<u32>,
}

/// Device-side particle state and its step sequence.
pub struct ParticleSystem {
    particles: Option<GpuBuffer>,
    escaped: Option<GpuBuffer>,
    count: Option<GpuBuffer>,
    particle_count: usize,
    group_size: i32,
    gravity: [f32; 2],
    domain_min: [f32; 2],
    domain_max: [f32; 2],
    readback: ReadbackMode,
    pending: VecDeque<(u64, ReadbackHandle<u32>)>,
    steps: u64,
}

impl ParticleSystem {
    /// An empty system; call [`upload`](Self::upload) before stepping.
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            particles: None,
            escaped: None,
            count: None,
            particle_count: 0,
            group_size: config.group_size,
            gravity: config.gravity,
            domain_min: config.domain.min,
            domain_max: config.domain.max,
            readback: config.readback,
            pending: VecDeque::new(),
            steps: 0,
        }
    }

    /// Number of particles on the device.
    pub fn particle_count(&self) -> usize {
        self.particle_count
    }

    /// Steps run so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Escaped-count requests not yet collected.
    pub fn pending_counts(&self) -> usize {
        self.pending.len()
    }

    /// Copies `particles` to the device. Buffers are rewritten in place when
    /// the count is unchanged and reallocated otherwise.
    pub fn upload<D: ComputeDevice>(
        &mut self,
        ctx: &mut ComputeContext<D>,
        particles: &[Particle],
    ) -> ComputeResult<()> {
        match &self.particles {
            Some(buffer) if particles.len() == self.particle_count => {
                ctx.write_buffer(buffer, particles)?;
            }
            _ => {
                self.particle_count = 0;
                ctx.create_structured_from_into(&mut self.particles, particles)?;
                ctx.create_append_into::<u32>(&mut self.escaped, particles.len())?;
                self.particle_count = particles.len();
                tracing::info!("Allocated particle buffers for {} particles", particles.len());
            }
        }
        if self.count.is_none() {
            ctx.create_count_into(&mut self.count)?;
        }
        Ok(())
    }

    fn params(&self, dt: f32) -> StepParams {
        StepParams {
            particle_count: self.particle_count as u32,
            dt,
            gravity: self.gravity,
            domain_min: self.domain_min,
            domain_max: self.domain_max,
        }
    }

    /// Runs one step: reset the escaped counter, integrate, cull, then read
    /// or request the escaped count.
    pub fn step<D: ComputeDevice>(
        &mut self,
        ctx: &mut ComputeContext<D>,
        dt: f32,
    ) -> ComputeResult<StepOutcome> {
        let (Some(particles), Some(escaped)) = (self.particles.as_ref(), self.escaped.as_ref())
        else {
            return Ok(StepOutcome::default());
        };
        let params = self.params(dt);

        ctx.reset_counter(escaped, 0)?;
        let integrate = KernelCall::new(INTEGRATE_KERNEL).bind(particles).params(&params);
        let grid = ctx.dispatch(&integrate, self.particle_count, self.group_size)?;
        let cull = KernelCall::new(CULL_KERNEL)
            .bind(particles)
            .bind(escaped)
            .params(&params);
        ctx.dispatch(&cull, self.particle_count, self.group_size)?;

        let escaped_count = match self.readback {
            ReadbackMode::Blocking => Some(ctx.append_count(escaped, self.count.as_ref())?),
            ReadbackMode::Async => {
                // Overlapping requests each get their own transient count buffer.
                let handle = ctx.request_append_count(escaped, None)?;
                self.pending.push_back((self.steps, handle));
                None
            }
        };

        self.steps += 1;
        Ok(StepOutcome {
            grid,
            escaped: escaped_count,
        })
    }

    /// Takes every resolved escaped-count request as `(step, count)`, in
    /// step order. Unresolved requests stay queued.
    pub fn collect_counts(&mut self) -> Vec<(u64, CountReadback)> {
        let mut resolved = Vec::new();
        self.pending.retain_mut(|(step, handle)| match handle.try_take() {
            Some(count) => {
                resolved.push((*step, count));
                false
            }
            None => true,
        });
        resolved
    }

    /// Current particle array, read back blocking.
    pub fn particles<D: ComputeDevice>(
        &self,
        ctx: &mut ComputeContext<D>,
    ) -> ComputeResult<Vec<Particle>> {
        match &self.particles {
            Some(buffer) => {
                let mut particles: Vec<Particle> = ctx.buffer_contents(buffer)?;
                particles.truncate(self.particle_count);
                Ok(particles)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Indices appended by the last cull, limited to `count` entries.
    pub fn escaped_indices<D: ComputeDevice>(
        &self,
        ctx: &mut ComputeContext<D>,
        count: u32,
    ) -> ComputeResult<Vec<u32>> {
        match &self.escaped {
            Some(buffer) => {
                let mut indices: Vec<u32> = ctx.buffer_contents(buffer)?;
                indices.truncate(count as usize);
                Ok(indices)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Releases every buffer the system owns. Safe to call repeatedly.
    pub fn release<D: ComputeDevice>(&mut self, ctx: &mut ComputeContext<D>) -> ReleaseReport {
        self.particle_count = 0;
        ctx.release_slots([&mut self.particles, &mut self.escaped, &mut self.count])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendType, DomainBounds, FluidSceneType};

    fn config(particle_count: usize) -> SimulationConfig {
        SimulationConfig {
            name: "particles".to_string(),
            scene: FluidSceneType::Water,
            cheap_variant: false,
            particle_count,
            group_size: 64,
            domain: DomainBounds {
                min: [0.0, 0.0],
                max: [2.0, 1.0],
            },
            gravity: [0.0, -9.81],
            dt: 0.01,
            max_steps: None,
            backend: BackendType::Cpu,
            readback: ReadbackMode::Blocking,
        }
    }

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<Particle>(), 16);
        assert_eq!(std::mem::size_of::<StepParams>(), 32);
    }

    #[test]
    fn test_spawn_inside_domain() {
        let config = config(37);
        let particles = spawn_particles(&config);
        assert_eq!(particles.len(), 37);
        assert!(particles
            .iter()
            .all(|p| !p.is_outside(config.domain.min, config.domain.max)));

        let drifts: Vec<f32> = particles.iter().map(|p| p.velocity[0]).collect();
        assert!(drifts.iter().any(|&v| v < 0.0));
        assert!(drifts.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn test_advance_and_bounds() {
        let mut p = Particle {
            position: [0.5, 0.5],
            velocity: [1.0, 0.0],
        };
        p.advance([0.0, -10.0], 0.1);
        assert!((p.velocity[1] + 1.0).abs() < 1e-6);
        assert!((p.position[0] - 0.6).abs() < 1e-6);
        assert!((p.position[1] - 0.4).abs() < 1e-6);

        assert!(!p.is_outside([0.0, 0.0], [1.0, 1.0]));
        assert!(p.is_outside([0.0, 0.45], [1.0, 1.0]));
        assert!(p.is_outside([0.0, 0.0], [0.55, 1.0]));
    }
}
