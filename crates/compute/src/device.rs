//! The backend seam.
//!
//! A [`ComputeDevice`] owns the raw allocations, compiled kernels and the
//! transfer queue of one accelerator (or of the CPU reference). The
//! [`ComputeContext`](crate::ComputeContext) drives it and keeps all
//! lifecycle and readback bookkeeping on the host side, so backends only
//! deal in ids and bytes.

use crate::buffer::{BufferDesc, BufferId};
use crate::error::{ComputeResult, TransferError};
use crate::grid::ExecutionGrid;

/// Backend-local handle of a resolved kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u32);

/// Identifies one in-flight asynchronous read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// How long [`ComputeDevice::poll`] may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Return immediately with whatever has finished.
    Poll,
    /// Block until every issued transfer has finished.
    Wait,
}

/// A finished asynchronous read.
#[derive(Debug)]
pub struct Completion {
    /// Request this completes.
    pub request: RequestId,
    /// Raw bytes of the source buffer's element storage, or the failure.
    pub result: Result<Vec<u8>, TransferError>,
}

/// A compute backend.
///
/// All methods take ids that the device itself handed out. Buffer payloads
/// are raw little-endian bytes; append buffers expose only their element
/// storage through [`upload`](Self::upload) and [`read`](Self::read), the
/// counter is reached through [`set_counter`](Self::set_counter) and
/// [`copy_counter`](Self::copy_counter).
pub trait ComputeDevice {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Looks up a kernel by name.
    fn resolve_kernel(&self, name: &str) -> ComputeResult<KernelHandle>;

    /// Launches `kernel` over `grid` with `bindings` bound in order.
    /// `params` is the kernel's uniform block, possibly empty.
    fn launch(
        &mut self,
        kernel: KernelHandle,
        grid: ExecutionGrid,
        bindings: &[BufferId],
        params: &[u8],
    ) -> ComputeResult<()>;

    /// Allocates a buffer. Fails with `OutOfMemory` when the device cannot
    /// satisfy the request.
    fn allocate(&mut self, desc: &BufferDesc) -> ComputeResult<BufferId>;

    /// Writes `bytes` to the start of the buffer's element storage.
    fn upload(&mut self, buffer: BufferId, bytes: &[u8]) -> ComputeResult<()>;

    /// Sets an append buffer's counter.
    fn set_counter(&mut self, buffer: BufferId, value: u32) -> ComputeResult<()>;

    /// Copies the counter of append buffer `src` into `dst` at byte
    /// `offset`. Ordered after every previously launched kernel.
    fn copy_counter(&mut self, src: BufferId, dst: BufferId, offset: u64) -> ComputeResult<()>;

    /// Reads a buffer's element storage, blocking until the device is idle.
    fn read(&mut self, buffer: BufferId) -> Result<Vec<u8>, TransferError>;

    /// Starts an asynchronous read. The result arrives through
    /// [`poll`](Self::poll) tagged with `request`.
    fn read_async(&mut self, buffer: BufferId, request: RequestId) -> ComputeResult<()>;

    /// Advances the transfer queue and returns every read that finished.
    fn poll(&mut self, mode: PollMode) -> ComputeResult<Vec<Completion>>;

    /// Frees an allocation. Unknown ids are ignored.
    fn free(&mut self, buffer: BufferId);

    /// Number of allocations currently held.
    fn live_allocations(&self) -> usize;
}

impl<D: ComputeDevice + ?Sized> ComputeDevice for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn resolve_kernel(&self, name: &str) -> ComputeResult<KernelHandle> {
        (**self).resolve_kernel(name)
    }

    fn launch(
        &mut self,
        kernel: KernelHandle,
        grid: ExecutionGrid,
        bindings: &[BufferId],
        params: &[u8],
    ) -> ComputeResult<()> {
        (**self).launch(kernel, grid, bindings, params)
    }

    fn allocate(&mut self, desc: &BufferDesc) -> ComputeResult<BufferId> {
        (**self).allocate(desc)
    }

    fn upload(&mut self, buffer: BufferId, bytes: &[u8]) -> ComputeResult<()> {
        (**self).upload(buffer, bytes)
    }

    fn set_counter(&mut self, buffer: BufferId, value: u32) -> ComputeResult<()> {
        (**self).set_counter(buffer, value)
    }

    fn copy_counter(&mut self, src: BufferId, dst: BufferId, offset: u64) -> ComputeResult<()> {
        (**self).copy_counter(src, dst, offset)
    }

    fn read(&mut self, buffer: BufferId) -> Result<Vec<u8>, TransferError> {
        (**self).read(buffer)
    }

    fn read_async(&mut self, buffer: BufferId, request: RequestId) -> ComputeResult<()> {
        (**self).read_async(buffer, request)
    }

    fn poll(&mut self, mode: PollMode) -> ComputeResult<Vec<Completion>> {
        (**self).poll(mode)
    }

    fn free(&mut self, buffer: BufferId) {
        (**self).free(buffer)
    }

    fn live_allocations(&self) -> usize {
        (**self).live_allocations()
    }
}
