//! GPU (Metal/Vulkan/DX12 via wgpu) implementation of [`ComputeDevice`].
//!
//! # Kernel layout
//! Every kernel uses bind group 0. Bindings `0..n` are the storage buffers
//! bound on the [`KernelCall`](crate::KernelCall), in order, and binding `n`
//! is a uniform block holding the call's params (zero-filled, at least 16
//! bytes). A kernel's WGSL must declare its bindings accordingly.
//!
//! # Append buffers
//! An append buffer starts with a 16-byte header whose first word is the
//! atomic counter; elements follow. In WGSL:
//!
//! ```wgsl
//! struct AppendU32 {
//!     count: atomic<u32>,
//!     _pad0: u32, _pad1: u32, _pad2: u32,
//!     items: array<u32>,
//! }
//! ```
//!
//! Kernels bump the counter with `atomicAdd` and store only while the slot
//! is below `arrayLength(&buf.items)`.
//!
//! # Readback
//! Reads copy into a MAP_READ staging buffer on the queue, so they observe
//! every launch submitted before them. Blocking reads wait on the device;
//! asynchronous ones are resolved by [`ComputeDevice::poll`].

pub mod buffers;

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::buffer::{BufferDesc, BufferId, BufferKind, APPEND_HEADER_BYTES};
use crate::device::{Completion, ComputeDevice, KernelHandle, PollMode, RequestId};
use crate::error::{ComputeError, ComputeResult, TransferError};
use crate::grid::ExecutionGrid;

use buffers::{align_to_copy, bgl_storage_ro, bgl_storage_rw, bgl_uniform, MIN_BUF_SIZE};

/// Access mode of one storage binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingAccess {
    /// `var<storage, read>`.
    ReadOnly,
    /// `var<storage, read_write>`.
    ReadWrite,
}

/// WGSL source of a kernel plus its storage binding layout.
#[derive(Debug, Clone)]
pub struct KernelSource<'a> {
    wgsl: Cow<'a, str>,
    entry_point: &'a str,
    bindings: Vec<BindingAccess>,
}

impl<'a> KernelSource<'a> {
    /// Source with no storage bindings yet.
    pub fn new(wgsl: impl Into<Cow<'a, str>>, entry_point: &'a str) -> Self {
        Self {
            wgsl: wgsl.into(),
            entry_point,
            bindings: Vec::new(),
        }
    }

    /// Adds a read-only storage binding.
    pub fn read_only(mut self) -> Self {
        self.bindings.push(BindingAccess::ReadOnly);
        self
    }

    /// Adds a read-write storage binding.
    pub fn read_write(mut self) -> Self {
        self.bindings.push(BindingAccess::ReadWrite);
        self
    }
}

struct WgpuKernel {
    name: String,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    storage_bindings: usize,
}

struct WgpuAllocation {
    buffer: wgpu::Buffer,
    kind: BufferKind,
    /// Start of element storage (past the append header).
    data_offset: u64,
    /// Unpadded element storage size.
    data_len: u64,
}

type MapStatus = Arc<Mutex<Option<Result<(), String>>>>;

struct PendingMap {
    request: RequestId,
    staging: wgpu::Buffer,
    len: u64,
    status: MapStatus,
}

/// Check whether a GPU adapter is available.
pub fn gpu_available() -> bool {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }));
    adapter.is_some()
}

/// wgpu-backed compute device.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    name: String,
    max_groups_per_dimension: u32,
    kernels: Vec<WgpuKernel>,
    buffers: HashMap<BufferId, WgpuAllocation>,
    next_buffer: u64,
    pending: Vec<PendingMap>,
}

impl WgpuDevice {
    /// Opens the highest-performance adapter available.
    ///
    /// Returns `ComputeError::Backend` if no adapter or device can be
    /// obtained, so callers can fall back to the CPU device.
    pub fn new() -> ComputeResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| ComputeError::Backend("no suitable GPU adapter found".into()))?;

        let info = adapter.get_info();
        tracing::info!("GPU adapter: {:?} ({:?})", info.name, info.backend);

        // wgpu defaults to 8 storage buffers per stage; take what the
        // adapter offers so wide kernels are not capped artificially.
        let adapter_limits = adapter.limits();
        let mut required_limits = wgpu::Limits::default();
        required_limits.max_storage_buffers_per_shader_stage =
            adapter_limits.max_storage_buffers_per_shader_stage;
        required_limits.max_storage_buffer_binding_size =
            adapter_limits.max_storage_buffer_binding_size;
        required_limits.max_buffer_size = adapter_limits.max_buffer_size;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("compute_device"),
                required_features: wgpu::Features::empty(),
                required_limits,
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| ComputeError::Backend(format!("failed to create device: {e}")))?;

        // Validation errors outside an error scope would otherwise panic.
        device.on_uncaptured_error(Box::new(|e: wgpu::Error| {
            tracing::error!("uncaptured wgpu error: {e}");
        }));

        let max_groups_per_dimension = device.limits().max_compute_workgroups_per_dimension;
        Ok(Self {
            device,
            queue,
            name: format!("wgpu:{}", info.name),
            max_groups_per_dimension,
            kernels: Vec::new(),
            buffers: HashMap::new(),
            next_buffer: 1,
            pending: Vec::new(),
        })
    }

    /// Compiles `source` and registers it as kernel `name`, replacing any
    /// kernel already registered under that name.
    pub fn register_kernel(&mut self, name: &str, source: &KernelSource<'_>) -> ComputeResult<KernelHandle> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(source.wgsl.clone()),
        });

        let mut entries: Vec<wgpu::BindGroupLayoutEntry> = source
            .bindings
            .iter()
            .enumerate()
            .map(|(slot, access)| match access {
                BindingAccess::ReadOnly => bgl_storage_ro(slot as u32),
                BindingAccess::ReadWrite => bgl_storage_rw(slot as u32),
            })
            .collect();
        entries.push(bgl_uniform(source.bindings.len() as u32));

        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(name),
            entries: &entries,
        });
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(name),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(name),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some(source.entry_point),
            compilation_options: Default::default(),
            cache: None,
        });

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ComputeError::Backend(format!(
                "kernel `{name}` failed to build: {err}"
            )));
        }

        let kernel = WgpuKernel {
            name: name.to_string(),
            pipeline,
            layout,
            storage_bindings: source.bindings.len(),
        };
        let index = match self.kernels.iter().position(|k| k.name == name) {
            Some(index) => {
                self.kernels[index] = kernel;
                index
            }
            None => {
                self.kernels.push(kernel);
                self.kernels.len() - 1
            }
        };
        tracing::info!("Registered kernel {}", name);
        Ok(KernelHandle(index as u32))
    }

    fn allocation(&self, buffer: BufferId) -> ComputeResult<&WgpuAllocation> {
        self.buffers
            .get(&buffer)
            .ok_or_else(|| ComputeError::Backend(format!("buffer {} is not allocated", buffer.raw())))
    }

    /// Copies `size` bytes at `offset` of `source` into a fresh staging
    /// buffer and submits the copy.
    fn stage(&self, source: &wgpu::Buffer, offset: u64, size: u64) -> wgpu::Buffer {
        let staging = buffers::create_staging_buf(&self.device, "readback_staging", size);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_buffer_to_buffer(source, offset, &staging, 0, staging.size());
        self.queue.submit(Some(encoder.finish()));
        staging
    }

    /// Blocking read of `len` bytes at `offset` within `source`.
    fn read_range(&self, source: &wgpu::Buffer, offset: u64, len: u64) -> Result<Vec<u8>, TransferError> {
        let staging = self.stage(source, offset, align_to_copy(len));
        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| TransferError::Disconnected)?
            .map_err(|e| TransferError::Failed(e.to_string()))?;

        let bytes = slice.get_mapped_range()[..len as usize].to_vec();
        staging.unmap();
        Ok(bytes)
    }
}

impl ComputeDevice for WgpuDevice {
    fn name(&self) -> &str {
        &self.name
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
        if bindings.len() != entry.storage_bindings {
            return Err(ComputeError::Backend(format!(
                "kernel `{}` takes {} storage buffers, {} bound",
                entry.name,
                entry.storage_bindings,
                bindings.len()
            )));
        }
        if grid.as_array().iter().any(|&g| g > self.max_groups_per_dimension) {
            return Err(ComputeError::Backend(format!(
                "grid {:?} exceeds the device limit of {} groups per dimension",
                grid.as_array(),
                self.max_groups_per_dimension
            )));
        }

        let params_buf = buffers::create_params_buf(&self.device, &entry.name, params);
        let mut entries = Vec::with_capacity(bindings.len() + 1);
        for (slot, id) in bindings.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: slot as u32,
                resource: self.allocation(*id)?.buffer.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: bindings.len() as u32,
            resource: params_buf.as_entire_binding(),
        });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(entry.name.as_str()),
            layout: &entry.layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(entry.name.as_str()) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(entry.name.as_str()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&entry.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(grid.x, grid.y, grid.z);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn allocate(&mut self, desc: &BufferDesc) -> ComputeResult<BufferId> {
        let data_offset = match desc.kind {
            BufferKind::Append => APPEND_HEADER_BYTES,
            _ => 0,
        };
        let data_len = desc.data_bytes();
        let size = (data_offset + align_to_copy(data_len)).max(MIN_BUF_SIZE);
        let label = desc.label.clone().unwrap_or_else(|| desc.kind.to_string());
        if size > self.device.limits().max_buffer_size {
            return Err(ComputeError::OutOfMemory { label, bytes: size });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label.as_str()),
            size,
            usage: buffers::storage_usage(),
            mapped_at_creation: false,
        });
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            return Err(ComputeError::OutOfMemory { label, bytes: size });
        }

        let id = BufferId::new(self.next_buffer);
        self.next_buffer += 1;
        self.buffers.insert(
            id,
            WgpuAllocation {
                buffer,
                kind: desc.kind,
                data_offset,
                data_len,
            },
        );
        Ok(id)
    }

    fn upload(&mut self, buffer: BufferId, bytes: &[u8]) -> ComputeResult<()> {
        let alloc = self.allocation(buffer)?;
        let len = bytes.len() as u64;
        if len > alloc.data_len {
            return Err(ComputeError::Backend(format!(
                "upload of {len} bytes exceeds buffer {} ({} bytes)",
                buffer.raw(),
                alloc.data_len
            )));
        }
        let aligned = align_to_copy(len);
        if aligned == len {
            self.queue.write_buffer(&alloc.buffer, alloc.data_offset, bytes);
            return Ok(());
        }
        // Unaligned tail: merge with the bytes already on the device so the
        // padding does not clobber the next element.
        let tail_start = aligned - wgpu::COPY_BUFFER_ALIGNMENT;
        let mut padded = bytes.to_vec();
        let existing = self.read_range(
            &alloc.buffer,
            alloc.data_offset + tail_start,
            wgpu::COPY_BUFFER_ALIGNMENT,
        )?;
        padded.extend_from_slice(&existing[(len - tail_start) as usize..]);
        self.queue.write_buffer(&alloc.buffer, alloc.data_offset, &padded);
        Ok(())
    }

    fn set_counter(&mut self, buffer: BufferId, value: u32) -> ComputeResult<()> {
        let alloc = self.allocation(buffer)?;
        if alloc.kind != BufferKind::Append {
            return Err(ComputeError::Backend(format!("buffer {} has no counter", buffer.raw())));
        }
        self.queue.write_buffer(&alloc.buffer, 0, &value.to_le_bytes());
        Ok(())
    }

    fn copy_counter(&mut self, src: BufferId, dst: BufferId, offset: u64) -> ComputeResult<()> {
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(ComputeError::Backend(format!(
                "counter copy offset {offset} is not 4-byte aligned"
            )));
        }
        let source = self.allocation(src)?;
        if source.kind != BufferKind::Append {
            return Err(ComputeError::Backend(format!("buffer {} has no counter", src.raw())));
        }
        let target = self.allocation(dst)?;
        if offset + 4 > align_to_copy(target.data_len) {
            return Err(ComputeError::Backend(format!(
                "counter copy at offset {offset} overruns buffer {}",
                dst.raw()
            )));
        }
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("copy_counter") });
        encoder.copy_buffer_to_buffer(&source.buffer, 0, &target.buffer, target.data_offset + offset, 4);
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read(&mut self, buffer: BufferId) -> Result<Vec<u8>, TransferError> {
        let alloc = self
            .buffers
            .get(&buffer)
            .ok_or_else(|| TransferError::Failed(format!("buffer {} is not allocated", buffer.raw())))?;
        self.read_range(&alloc.buffer, alloc.data_offset, alloc.data_len)
    }

    fn read_async(&mut self, buffer: BufferId, request: RequestId) -> ComputeResult<()> {
        let alloc = self.allocation(buffer)?;
        let len = alloc.data_len;
        let staging = self.stage(&alloc.buffer, alloc.data_offset, align_to_copy(len));

        let status: MapStatus = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&status);
        staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            if let Ok(mut slot) = slot.lock() {
                *slot = Some(result.map_err(|e| e.to_string()));
            }
        });
        self.pending.push(PendingMap {
            request,
            staging,
            len,
            status,
        });
        Ok(())
    }

    fn poll(&mut self, mode: PollMode) -> ComputeResult<Vec<Completion>> {
        let maintain = match mode {
            PollMode::Poll => wgpu::Maintain::Poll,
            PollMode::Wait => wgpu::Maintain::Wait,
        };
        self.device.poll(maintain);

        let mut completions = Vec::new();
        let mut waiting = Vec::with_capacity(self.pending.len());
        for map in std::mem::take(&mut self.pending) {
            let status = match map.status.lock() {
                Ok(mut slot) => slot.take(),
                Err(_) => Some(Err("map status lock poisoned".to_string())),
            };
            let result = match status {
                None => {
                    waiting.push(map);
                    continue;
                }
                Some(Ok(())) => {
                    let bytes = map.staging.slice(..).get_mapped_range()[..map.len as usize].to_vec();
                    map.staging.unmap();
                    Ok(bytes)
                }
                Some(Err(e)) => Err(TransferError::Failed(e)),
            };
            completions.push(Completion {
                request: map.request,
                result,
            });
        }
        self.pending = waiting;
        Ok(completions)
    }

    fn free(&mut self, buffer: BufferId) {
        if let Some(alloc) = self.buffers.remove(&buffer) {
            alloc.buffer.destroy();
        }
    }

    fn live_allocations(&self) -> usize {
        self.buffers.len()
    }
}
