//! Buffer handles and descriptors.
//!
//! A [`GpuBuffer`] is a host-side handle to a device allocation. It carries
//! the shape the buffer was created with and whether it has been released;
//! the allocation itself lives inside the backend device.

use std::fmt;

use crate::context::ContextId;
use crate::error::{ComputeError, ComputeResult};

/// Bytes reserved in front of an append buffer's items. The running counter
/// is the first `u32`; the rest pads the items to a 16-byte boundary.
pub const APPEND_HEADER_BYTES: u64 = 16;

/// Size of a count buffer: one 4-byte integer.
pub const COUNT_BUFFER_BYTES: u64 = 4;

/// What a buffer is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Fixed-length array of elements.
    Structured,
    /// Growable-within-capacity array with a device-side counter.
    Append,
    /// A single 4-byte integer, target of counter copies.
    Count,
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BufferKind::Structured => "structured",
            BufferKind::Append => "append",
            BufferKind::Count => "count",
        };
        f.write_str(name)
    }
}

/// Backend-assigned identity of a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    /// Wraps a raw backend id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw backend id.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Shape of a buffer to allocate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    /// Optional debug label.
    pub label: Option<String>,
    /// Buffer kind.
    pub kind: BufferKind,
    /// Capacity in elements, at least 1.
    pub capacity: u32,
    /// Element size in bytes.
    pub stride: u32,
}

impl BufferDesc {
    /// A structured buffer of `count` elements of `T` (at least one).
    pub fn structured<T: bytemuck::Pod>(count: usize) -> Self {
        Self::new(BufferKind::Structured, count, stride_of::<T>())
    }

    /// An append buffer with room for `capacity` elements of `T` (at least one).
    pub fn append<T: bytemuck::Pod>(capacity: usize) -> Self {
        Self::new(BufferKind::Append, capacity, stride_of::<T>())
    }

    /// A single-integer count buffer.
    pub fn count() -> Self {
        Self::new(BufferKind::Count, 1, COUNT_BUFFER_BYTES as u32)
    }

    fn new(kind: BufferKind, count: usize, stride: u32) -> Self {
        Self {
            label: None,
            kind,
            capacity: coerce_capacity(count),
            stride,
        }
    }

    /// Attaches a debug label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Bytes of element storage (excludes the append header).
    pub fn data_bytes(&self) -> u64 {
        self.capacity as u64 * self.stride as u64
    }
}

/// Zero-length requests are bumped to one element; devices reject empty
/// allocations.
fn coerce_capacity(count: usize) -> u32 {
    count.clamp(1, u32::MAX as usize) as u32
}

/// Size of `T` in bytes as a buffer stride.
pub fn stride_of<T>() -> u32 {
    std::mem::size_of::<T>() as u32
}

/// Whether a handle still refers to a live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Backed by a device allocation.
    Live,
    /// Released; every further use is an error except another release.
    Released,
}

/// Handle to a device buffer.
///
/// Not `Clone`: each allocation has exactly one owner. Release it through
/// the context that created it; other contexts reject the handle. A handle
/// dropped while live keeps its allocation until the device itself is
/// dropped.
#[derive(Debug)]
pub struct GpuBuffer {
    owner: ContextId,
    id: BufferId,
    kind: BufferKind,
    capacity: u32,
    stride: u32,
    label: String,
    state: BufferState,
}

impl GpuBuffer {
    pub(crate) fn new(owner: ContextId, id: BufferId, desc: BufferDesc) -> Self {
        let label = desc
            .label
            .unwrap_or_else(|| format!("{}#{}", desc.kind, id.raw()));
        Self {
            owner,
            id,
            kind: desc.kind,
            capacity: desc.capacity,
            stride: desc.stride,
            label,
            state: BufferState::Live,
        }
    }

    /// Backend id of the allocation.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Buffer kind.
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Capacity in elements.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Element size in bytes.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Debug label (generated from kind and id when none was given).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BufferState {
        self.state
    }

    /// True until the buffer is released.
    pub fn is_live(&self) -> bool {
        self.state == BufferState::Live
    }

    /// Bytes of element storage.
    pub fn data_bytes(&self) -> u64 {
        self.capacity as u64 * self.stride as u64
    }

    pub(crate) fn owner(&self) -> ContextId {
        self.owner
    }

    pub(crate) fn ensure_owner(&self, context: ContextId) -> ComputeResult<()> {
        if self.owner != context {
            return Err(ComputeError::ForeignBuffer {
                label: self.label.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn ensure_live(&self) -> ComputeResult<BufferId> {
        match self.state {
            BufferState::Live => Ok(self.id),
            BufferState::Released => Err(ComputeError::ReleasedBuffer {
                label: self.label.clone(),
            }),
        }
    }

    pub(crate) fn ensure_kind(&self, expected: BufferKind) -> ComputeResult<()> {
        if self.kind != expected {
            return Err(ComputeError::KindMismatch {
                label: self.label.clone(),
                expected,
                found: self.kind,
            });
        }
        Ok(())
    }

    pub(crate) fn ensure_stride<T>(&self) -> ComputeResult<()> {
        let expected = stride_of::<T>();
        if self.stride != expected {
            return Err(ComputeError::StrideMismatch {
                label: self.label.clone(),
                expected,
                found: self.stride,
            });
        }
        Ok(())
    }

    /// Flips the handle to released. Returns the id only on the first call.
    pub(crate) fn mark_released(&mut self) -> Option<BufferId> {
        match self.state {
            BufferState::Live => {
                self.state = BufferState::Released;
                Some(self.id)
            }
            BufferState::Released => None,
        }
    }
}
