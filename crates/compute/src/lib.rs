//! GPU compute-resource layer.
//!
//! Plans dispatch grids, owns the lifecycle of structured, append and count
//! buffers, and moves data back to the host either blocking or through
//! completion callbacks. Everything runs against a [`ComputeDevice`]: the
//! CPU reference device is always available, the wgpu device sits behind
//! the `gpu` feature.
//!
//! # Modules
//! - [`grid`] -- Thread-group planning for 1D/2D/3D domains.
//! - [`buffer`] -- Buffer kinds, descriptors and handles.
//! - [`lifecycle`] -- Creating, writing and releasing buffers.
//! - [`readback`] -- Blocking and asynchronous device-to-host reads.
//! - [`device`] -- The backend trait.
//! - [`cpu`] -- Reference backend running kernels as Rust closures.
//!
//! ```ignore
//! let mut ctx = ComputeContext::new(device);
//! let mut hits = ctx.create_append::<u32>(1024)?;
//! ctx.dispatch(&KernelCall::new("collide").bind(&hits), 500, 64)?;
//! ctx.append_count_async(&hits, None, |count| println!("{}", count.sentinel()))?;
//! ctx.poll(PollMode::Wait)?;
//! ctx.release(&mut hits);
//! ```

#![warn(missing_docs)]

pub mod buffer;
pub mod context;
pub mod cpu;
pub mod device;
pub mod error;
pub mod grid;
pub mod kernel;
pub mod lifecycle;
pub mod readback;

#[cfg(feature = "gpu")]
#[allow(missing_docs)]
pub mod gpu;

pub use buffer::{BufferDesc, BufferId, BufferKind, BufferState, GpuBuffer};
pub use context::ComputeContext;
pub use cpu::{CpuDevice, CpuInvocation};
pub use device::{Completion, ComputeDevice, KernelHandle, PollMode, RequestId};
pub use error::{ComputeError, ComputeResult, TransferError};
pub use grid::{plan_grid, ExecutionGrid, Extent};
pub use kernel::KernelCall;
pub use lifecycle::ReleaseReport;
pub use readback::{CountReadback, CountSentinel, ReadbackHandle, COUNT_ERROR_SENTINEL};

#[cfg(feature = "gpu")]
pub use gpu::{gpu_available, KernelSource, WgpuDevice};
