//! Kernel registration for both backends.
//!
//! The CPU closures and the WGSL in `shaders/` implement the same two
//! kernels over the same buffer layout:
//! - `integrate`: binding 0 particles (rw), params
//! - `cull_escaped`: binding 0 particles (ro), binding 1 escaped indices
//!   (append), params

use compute::CpuDevice;

use crate::particles::{Particle, StepParams, CULL_KERNEL, INTEGRATE_KERNEL};

/// Registers the CPU versions of both kernels with `group_size` threads
/// per group.
pub fn register_cpu(device: &mut CpuDevice, group_size: u32) {
    let workgroup = [group_size, 1, 1];

    device.register_kernel(INTEGRATE_KERNEL, workgroup, |inv| {
        let Some(params) = inv.params::<StepParams>() else {
            return;
        };
        let i = inv.index();
        if i >= params.particle_count {
            return;
        }
        if let Some(mut particle) = inv.read::<Particle>(0, i) {
            particle.advance(params.gravity, params.dt);
            inv.write(0, i, particle);
        }
    });

    device.register_kernel(CULL_KERNEL, workgroup, |inv| {
        let Some(params) = inv.params::<StepParams>() else {
            return;
        };
        let i = inv.index();
        if i >= params.particle_count {
            return;
        }
        let outside = inv
            .read::<Particle>(0, i)
            .is_some_and(|p| p.is_outside(params.domain_min, params.domain_max));
        if outside {
            inv.append(1, i);
        }
    });
}

/// Compiles both WGSL kernels with `group_size` threads per group.
#[cfg(feature = "gpu")]
pub fn register_wgpu(device: &mut compute::WgpuDevice, group_size: u32) -> compute::ComputeResult<()> {
    use compute::KernelSource;

    let wg_str = format!("@workgroup_size({})", group_size);

    let integrate_src: String =
        include_str!("shaders/integrate.wgsl").replace("@workgroup_size(64)", &wg_str);
    device.register_kernel(
        INTEGRATE_KERNEL,
        &KernelSource::new(integrate_src, "integrate").read_write(),
    )?;

    let cull_src: String = include_str!("shaders/cull.wgsl").replace("@workgroup_size(64)", &wg_str);
    device.register_kernel(
        CULL_KERNEL,
        &KernelSource::new(cull_src, "cull_escaped")
            .read_only()
            .read_write(),
    )?;

    tracing::info!("Compiled particle kernels (workgroup size {})", group_size);
    Ok(())
}
