//! CPU reference device.
//!
//! Kernels are Rust closures run once per invocation, in order, on the
//! calling thread. Append buffers behave like their GPU counterparts: the
//! counter is bumped on every append, writes past capacity are dropped.
//! Transfers can be delayed by a number of polls and made to fail on
//! demand, which the readback tests rely on.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::buffer::{BufferDesc, BufferId, BufferKind, APPEND_HEADER_BYTES};
use crate::device::{Completion, ComputeDevice, KernelHandle, PollMode, RequestId};
use crate::error::{ComputeError, ComputeResult, TransferError};
use crate::grid::ExecutionGrid;

/// Signature of a CPU kernel body.
pub type CpuKernelFn = dyn Fn(&mut CpuInvocation<'_>) + Send + Sync;

struct CpuKernel {
    name: String,
    workgroup_size: [u32; 3],
    func: Arc<CpuKernelFn>,
}

struct Allocation {
    kind: BufferKind,
    capacity: u32,
    data: Vec<u8>,
    counter: u32,
}

struct PendingTransfer {
    request: RequestId,
    polls_left: u32,
    // Captured at issue time, matching a GPU copy into a staging buffer.
    result: Result<Vec<u8>, TransferError>,
}

/// Reference [`ComputeDevice`] running kernels on the host.
pub struct CpuDevice {
    kernels: Vec<CpuKernel>,
    buffers: HashMap<BufferId, Allocation>,
    next_buffer: u64,
    pending: VecDeque<PendingTransfer>,
    transfer_latency: u32,
    failing_transfers: u32,
    memory_budget: Option<u64>,
    allocated_bytes: u64,
    launches: u64,
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuDevice {
    /// An empty device with no kernels, instant transfers and no memory limit.
    pub fn new() -> Self {
        Self {
            kernels: Vec::new(),
            buffers: HashMap::new(),
            next_buffer: 1,
            pending: VecDeque::new(),
            transfer_latency: 0,
            failing_transfers: 0,
            memory_budget: None,
            allocated_bytes: 0,
            launches: 0,
        }
    }

    /// Asynchronous reads complete only after `polls` non-blocking polls
    /// have passed without them.
    pub fn with_transfer_latency(mut self, polls: u32) -> Self {
        self.transfer_latency = polls;
        self
    }

    /// Allocations beyond `bytes` in total fail with `OutOfMemory`.
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Registers (or replaces) the kernel `name`.
    pub fn register_kernel<F>(&mut self, name: impl Into<String>, workgroup_size: [u32; 3], kernel: F)
    where
        F: Fn(&mut CpuInvocation<'_>) + Send + Sync + 'static,
    {
        let entry = CpuKernel {
            name: name.into(),
            workgroup_size: workgroup_size.map(|g| g.max(1)),
            func: Arc::new(kernel),
        };
        match self.kernels.iter_mut().find(|k| k.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.kernels.push(entry),
        }
    }

    /// The next `count` transfers (blocking or not) fail.
    pub fn fail_next_transfers(&mut self, count: u32) {
        self.failing_transfers = count;
    }

    /// Kernel launches performed so far.
    pub fn launch_count(&self) -> u64 {
        self.launches
    }

    /// Bytes currently allocated.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    /// Asynchronous reads issued but not yet returned by `poll`.
    pub fn pending_transfers(&self) -> usize {
        self.pending.len()
    }

    fn take_failure(&mut self) -> bool {
        if self.failing_transfers == 0 {
            return false;
        }
        self.failing_transfers -= 1;
        true
    }

    fn snapshot(&mut self, buffer: BufferId) -> Result<Vec<u8>, TransferError> {
        if self.take_failure() {
            return Err(TransferError::Failed("injected transfer failure".to_string()));
        }
        self.buffers
            .get(&buffer)
            .map(|alloc| alloc.data.clone())
            .ok_or_else(|| TransferError::Failed(format!("buffer {} is not allocated", buffer.raw())))
    }

    fn allocation_mut(&mut self, buffer: BufferId) -> ComputeResult<&mut Allocation> {
        self.buffers
            .get_mut(&buffer)
            .ok_or_else(|| ComputeError::Backend(format!("buffer {} is not allocated", buffer.raw())))
    }
}

fn allocation_bytes(desc: &BufferDesc) -> u64 {
    match desc.kind {
        BufferKind::Append => desc.data_bytes() + APPEND_HEADER_BYTES,
        _ => desc.data_bytes(),
    }
}

impl ComputeDevice for CpuDevice {
    fn name(&self) -> &str {
        "cpu"
    }

    fn resolve_kernel(&self, name: &str) -> ComputeResult<KernelHandle> {
        self.kernels
            .iter()
            .position(|k| k.name == name)
            .map(|index| KernelHandle(index as u32))
            .ok_or_else(|| ComputeError::KernelNotFound {
                name: name.to_string(),
            })
    }

    fn launch(
        &mut self,
        kernel: KernelHandle,
        grid: ExecutionGrid,
        bindings: &[BufferId],
        params: &[u8],
    ) -> ComputeResult<()> {
        let entry = self
            .kernels
            .get(kernel.0 as usize)
            .ok_or_else(|| ComputeError::Backend(format!("unknown kernel handle {}", kernel.0)))?;
        let func = Arc::clone(&entry.func);
        let [wx, wy, wz] = entry.workgroup_size;
        let span = |groups: u32, size: u32| {
            groups
                .checked_mul(size)
                .ok_or_else(|| ComputeError::Backend("invocation count overflows u32".to_string()))
        };
        let (nx, ny, nz) = (span(grid.x, wx)?, span(grid.y, wy)?, span(grid.z, wz)?);

        // The same buffer may be bound twice; each distinct one is taken out
        // of the map once and every binding slot points at it.
        let mut unique: Vec<BufferId> = Vec::with_capacity(bindings.len());
        let slots: Vec<usize> = bindings
            .iter()
            .map(|id| match unique.iter().position(|u| u == id) {
                Some(index) => index,
                None => {
                    unique.push(*id);
                    unique.len() - 1
                }
            })
            .collect();
        let mut taken = Vec::with_capacity(unique.len());
        for id in &unique {
            match self.buffers.remove(id) {
                Some(alloc) => taken.push(alloc),
                None => {
                    for (restored, alloc) in unique.iter().zip(taken) {
                        self.buffers.insert(*restored, alloc);
                    }
                    return Err(ComputeError::Backend(format!(
                        "buffer {} is not allocated",
                        id.raw()
                    )));
                }
            }
        }

        let mut invocation = CpuInvocation {
            global_id: [0; 3],
            slots: &slots,
            buffers: &mut taken,
            params,
        };
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    invocation.global_id = [x, y, z];
                    (*func)(&mut invocation);
                }
            }
        }

        for (id, alloc) in unique.into_iter().zip(taken) {
            self.buffers.insert(id, alloc);
        }
        self.launches += 1;
        Ok(())
    }

    fn allocate(&mut self, desc: &BufferDesc) -> ComputeResult<BufferId> {
        let bytes = allocation_bytes(desc);
        let out_of_memory = || ComputeError::OutOfMemory {
            label: desc.label.clone().unwrap_or_else(|| desc.kind.to_string()),
            bytes,
        };
        if let Some(budget) = self.memory_budget {
            if self.allocated_bytes.saturating_add(bytes) > budget {
                return Err(out_of_memory());
            }
        }
        let len = usize::try_from(desc.data_bytes()).map_err(|_| out_of_memory())?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| out_of_memory())?;
        data.resize(len, 0);

        let id = BufferId::new(self.next_buffer);
        self.next_buffer += 1;
        self.allocated_bytes += bytes;
        self.buffers.insert(
            id,
            Allocation {
                kind: desc.kind,
                capacity: desc.capacity,
                data,
                counter: 0,
            },
        );
        Ok(id)
    }

    fn upload(&mut self, buffer: BufferId, bytes: &[u8]) -> ComputeResult<()> {
        let alloc = self.allocation_mut(buffer)?;
        let available = alloc.data.len();
        let Some(target) = alloc.data.get_mut(..bytes.len()) else {
            return Err(ComputeError::Backend(format!(
                "upload of {} bytes exceeds buffer {} ({available} bytes)",
                bytes.len(),
                buffer.raw(),
            )));
        };
        target.copy_from_slice(bytes);
        Ok(())
    }

    fn set_counter(&mut self, buffer: BufferId, value: u32) -> ComputeResult<()> {
        let alloc = self.allocation_mut(buffer)?;
        if alloc.kind != BufferKind::Append {
            return Err(ComputeError::Backend(format!(
                "buffer {} has no counter",
                buffer.raw()
            )));
        }
        alloc.counter = value;
        Ok(())
    }

    fn copy_counter(&mut self, src: BufferId, dst: BufferId, offset: u64) -> ComputeResult<()> {
        let source = self.allocation_mut(src)?;
        if source.kind != BufferKind::Append {
            return Err(ComputeError::Backend(format!("buffer {} has no counter", src.raw())));
        }
        let counter = source.counter;
        let target = self.allocation_mut(dst)?;
        let start = offset as usize;
        let Some(slot) = target.data.get_mut(start..start + 4) else {
            return Err(ComputeError::Backend(format!(
                "counter copy at offset {offset} overruns buffer {}",
                dst.raw()
            )));
        };
        slot.copy_from_slice(&counter.to_le_bytes());
        Ok(())
    }

    fn read(&mut self, buffer: BufferId) -> Result<Vec<u8>, TransferError> {
        self.snapshot(buffer)
    }

    fn read_async(&mut self, buffer: BufferId, request: RequestId) -> ComputeResult<()> {
        if !self.buffers.contains_key(&buffer) {
            return Err(ComputeError::Backend(format!(
                "buffer {} is not allocated",
                buffer.raw()
            )));
        }
        let result = self.snapshot(buffer);
        self.pending.push_back(PendingTransfer {
            request,
            polls_left: self.transfer_latency,
            result,
        });
        Ok(())
    }

    fn poll(&mut self, mode: PollMode) -> ComputeResult<Vec<Completion>> {
        let mut completions = Vec::new();
        let mut waiting = VecDeque::with_capacity(self.pending.len());
        for mut transfer in self.pending.drain(..) {
            let ready = match mode {
                PollMode::Wait => true,
                PollMode::Poll if transfer.polls_left == 0 => true,
                PollMode::Poll => {
                    transfer.polls_left -= 1;
                    false
                }
            };
            if ready {
                completions.push(Completion {
                    request: transfer.request,
                    result: transfer.result,
                });
            } else {
                waiting.push_back(transfer);
            }
        }
        self.pending = waiting;
        Ok(completions)
    }

    fn free(&mut self, buffer: BufferId) {
        if let Some(alloc) = self.buffers.remove(&buffer) {
            let bytes = match alloc.kind {
                BufferKind::Append => alloc.data.len() as u64 + APPEND_HEADER_BYTES,
                _ => alloc.data.len() as u64,
            };
            self.allocated_bytes = self.allocated_bytes.saturating_sub(bytes);
        }
    }

    fn live_allocations(&self) -> usize {
        self.buffers.len()
    }
}

/// One kernel invocation on the CPU device.
///
/// Bindings are addressed by slot, in the order they were bound on the
/// [`KernelCall`](crate::KernelCall). Out-of-range accesses read `None` and
/// writes report `false`, mirroring robust buffer access on the GPU.
pub struct CpuInvocation<'a> {
    global_id: [u32; 3],
    slots: &'a [usize],
    buffers: &'a mut [Allocation],
    params: &'a [u8],
}

impl CpuInvocation<'_> {
    /// Global invocation id.
    pub fn global_id(&self) -> [u32; 3] {
        self.global_id
    }

    /// Global id along x, the item index of a 1D dispatch.
    pub fn index(&self) -> u32 {
        self.global_id[0]
    }

    /// The uniform parameter block, if one of at least `size_of::<T>()`
    /// bytes was supplied.
    pub fn params<T: bytemuck::Pod>(&self) -> Option<T> {
        self.params
            .get(..std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
    }

    fn binding(&self, slot: usize) -> Option<&Allocation> {
        self.buffers.get(*self.slots.get(slot)?)
    }

    fn binding_mut(&mut self, slot: usize) -> Option<&mut Allocation> {
        let index = *self.slots.get(slot)?;
        self.buffers.get_mut(index)
    }

    /// Capacity in elements of the buffer at `slot`, zero if unbound.
    pub fn capacity(&self, slot: usize) -> u32 {
        self.binding(slot).map_or(0, |alloc| alloc.capacity)
    }

    /// Element `index` of the buffer at `slot`.
    pub fn read<T: bytemuck::Pod>(&self, slot: usize, index: u32) -> Option<T> {
        let size = std::mem::size_of::<T>();
        let start = index as usize * size;
        self.binding(slot)?
            .data
            .get(start..start + size)
            .map(bytemuck::pod_read_unaligned)
    }

    /// Writes element `index` of the buffer at `slot`.
    pub fn write<T: bytemuck::Pod>(&mut self, slot: usize, index: u32, value: T) -> bool {
        let size = std::mem::size_of::<T>();
        let start = index as usize * size;
        let Some(target) = self
            .binding_mut(slot)
            .and_then(|alloc| alloc.data.get_mut(start..start + size))
        else {
            return false;
        };
        target.copy_from_slice(bytemuck::bytes_of(&value));
        true
    }

    /// Appends to the append buffer at `slot`. The counter is always
    /// incremented; the value is stored only while there is room.
    pub fn append<T: bytemuck::Pod>(&mut self, slot: usize, value: T) -> bool {
        let Some(alloc) = self.binding_mut(slot) else {
            return false;
        };
        if alloc.kind != BufferKind::Append {
            return false;
        }
        let index = alloc.counter;
        alloc.counter = alloc.counter.saturating_add(1);
        if index >= alloc.capacity {
            return false;
        }
        self.write(slot, index, value)
    }

    /// Current counter of the append buffer at `slot`.
    pub fn counter(&self, slot: usize) -> u32 {
        self.binding(slot).map_or(0, |alloc| alloc.counter)
    }
}
