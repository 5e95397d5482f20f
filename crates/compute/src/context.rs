//! The compute context: one device plus the host-side bookkeeping.
//!
//! Dispatch lives here; buffer creation/release is in
//! [`lifecycle`](crate::lifecycle) and host readback in
//! [`readback`](crate::readback). All three are methods on
//! [`ComputeContext`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::buffer::{BufferId, GpuBuffer};
use crate::device::{ComputeDevice, PollMode, RequestId};
use crate::error::{ComputeError, ComputeResult, TransferError};
use crate::grid::{self, ExecutionGrid, Extent};
use crate::kernel::KernelCall;
use crate::readback::PendingReadback;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a context, stamped into every buffer it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ContextId(u64);

impl ContextId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Owns a compute device and every readback still in flight on it.
///
/// Single-threaded: callers drive completions with [`poll`](Self::poll),
/// and every completion callback runs inside that call.
pub struct ComputeContext<D: ComputeDevice> {
    pub(crate) id: ContextId,
    pub(crate) device: D,
    pub(crate) pending: HashMap<RequestId, PendingReadback>,
    next_request: u64,
}

impl<D: ComputeDevice> ComputeContext<D> {
    /// Wraps a device.
    pub fn new(device: D) -> Self {
        tracing::info!("Compute context ready on {} backend", device.name());
        Self {
            id: ContextId::next(),
            device,
            pending: HashMap::new(),
            next_request: 0,
        }
    }

    /// The underlying device.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Mutable access to the device, e.g. to register kernels.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Launches `call` over `extent` items with `group_size` threads per
    /// group on every axis.
    ///
    /// Returns `Ok(None)` without touching the device when the extent is
    /// empty on any axis. A non-positive group size is rejected first,
    /// regardless of the extent; released or foreign bindings are rejected
    /// next, even for an empty extent.
    pub fn dispatch(
        &mut self,
        call: &KernelCall<'_>,
        extent: impl Into<Extent>,
        group_size: i32,
    ) -> ComputeResult<Option<ExecutionGrid>> {
        let grid = grid::plan_grid(extent, group_size)?;
        let bindings = self.checked_bindings(call)?;
        if grid.is_empty() {
            debug!("Empty domain, dispatch of {} skipped", call.name());
            return Ok(None);
        }
        self.launch(call, grid, &bindings)?;
        Ok(Some(grid))
    }

    /// Launches `call` with explicit group counts. Returns `false` without
    /// touching the device when any count is zero or negative. Bindings are
    /// checked either way.
    pub fn dispatch_groups(
        &mut self,
        call: &KernelCall<'_>,
        groups: impl Into<Extent>,
    ) -> ComputeResult<bool> {
        let bindings = self.checked_bindings(call)?;
        let Some(grid) = ExecutionGrid::from_groups(groups) else {
            debug!("Empty group counts, dispatch of {} skipped", call.name());
            return Ok(false);
        };
        self.launch(call, grid, &bindings)?;
        Ok(true)
    }

    fn checked_bindings(&self, call: &KernelCall<'_>) -> ComputeResult<Vec<BufferId>> {
        call.bindings()
            .iter()
            .map(|buffer| self.checked(buffer))
            .collect()
    }

    fn launch(
        &mut self,
        call: &KernelCall<'_>,
        grid: ExecutionGrid,
        bindings: &[BufferId],
    ) -> ComputeResult<()> {
        let kernel = self.device.resolve_kernel(call.name())?;
        debug!("Dispatch {} over {:?} groups", call.name(), grid.as_array());
        self.device.launch(kernel, grid, bindings, call.params_bytes())
    }

    /// The buffer's allocation id, if the handle is live and was created by
    /// this context.
    pub(crate) fn checked(&self, buffer: &GpuBuffer) -> ComputeResult<BufferId> {
        buffer.ensure_owner(self.id)?;
        buffer.ensure_live()
    }

    /// Drives pending transfers. Every completed request has its callback
    /// invoked and its transient buffers released before this returns.
    /// Returns the number of requests completed.
    pub fn poll(&mut self, mode: PollMode) -> ComputeResult<usize> {
        if self.pending.is_empty() && mode == PollMode::Poll {
            return Ok(0);
        }
        let completions = self.device.poll(mode)?;
        let mut completed = 0;
        for completion in completions {
            let Some(pending) = self.pending.remove(&completion.request) else {
                warn!("Completion for unknown request {} dropped", completion.request.0);
                continue;
            };
            let PendingReadback {
                label,
                transient,
                finish,
            } = pending;
            if let Some(mut buffer) = transient {
                self.release(&mut buffer);
            }
            debug!(
                "Readback {} of {} complete (ok: {})",
                completion.request.0,
                label,
                completion.result.is_ok()
            );
            finish(completion.result);
            completed += 1;
        }
        Ok(completed)
    }

    /// Number of readbacks issued but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn next_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        id
    }

    /// Fails with `Backend` if an operation needs the device to make
    /// progress but nothing is pending.
    pub(crate) fn ensure_pending(&self) -> ComputeResult<()> {
        if self.pending.is_empty() {
            return Err(ComputeError::Backend(
                "no transfer in flight to wait on".to_string(),
            ));
        }
        Ok(())
    }
}

impl<D: ComputeDevice> Drop for ComputeContext<D> {
    /// Waits for readbacks still in flight so their callbacks run. Any the
    /// device cannot finish complete with `Disconnected`.
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        debug!(
            "Compute context dropped with {} readbacks in flight, draining",
            self.pending.len()
        );
        if let Err(e) = self.poll(PollMode::Wait) {
            warn!("Draining readbacks on {} failed: {}", self.device.name(), e);
        }
        if self.pending.is_empty() {
            return;
        }
        warn!(
            "{} readbacks on {} never completed, reporting them disconnected",
            self.pending.len(),
            self.device.name()
        );
        for (_, pending) in std::mem::take(&mut self.pending) {
            if let Some(mut buffer) = pending.transient {
                self.release(&mut buffer);
            }
            (pending.finish)(Err(TransferError::Disconnected));
        }
    }
}
