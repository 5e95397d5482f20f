//! Error types shared by every compute backend.

use thiserror::Error;

use crate::buffer::BufferKind;

/// Failure of a device-to-host (or host-to-device) transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The backend reported the transfer as failed.
    #[error("device transfer failed: {0}")]
    Failed(String),
    /// The result channel closed before the transfer completed.
    #[error("readback channel closed before the transfer completed")]
    Disconnected,
    /// The returned byte count does not divide into whole elements.
    #[error("readback of {len} bytes is not a multiple of the {stride}-byte stride")]
    Misaligned {
        /// Bytes returned by the device.
        len: usize,
        /// Element stride the caller asked for.
        stride: usize,
    },
}

/// Errors surfaced by the compute layer.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// No kernel with this name is registered on the backend.
    #[error("kernel `{name}` is not registered on this backend")]
    KernelNotFound {
        /// Requested kernel name.
        name: String,
    },
    /// Group size was zero or negative.
    #[error("group size must be positive, got {0}")]
    InvalidGroupSize(i32),
    /// The device could not satisfy an allocation.
    #[error("out of device memory allocating {bytes} bytes for `{label}`")]
    OutOfMemory {
        /// Label of the buffer being created.
        label: String,
        /// Requested size in bytes.
        bytes: u64,
    },
    /// A released buffer handle was used.
    #[error("buffer `{label}` has been released")]
    ReleasedBuffer {
        /// Label of the released buffer.
        label: String,
    },
    /// The handle was created by a different context.
    #[error("buffer `{label}` belongs to another compute context")]
    ForeignBuffer {
        /// Label of the foreign buffer.
        label: String,
    },
    /// The buffer is of the wrong kind for this operation.
    #[error("buffer `{label}` is a {found} buffer, expected a {expected} buffer")]
    KindMismatch {
        /// Label of the offending buffer.
        label: String,
        /// Kind the operation requires.
        expected: BufferKind,
        /// Kind the buffer actually has.
        found: BufferKind,
    },
    /// The element type does not match the buffer's stride.
    #[error("buffer `{label}` has a {found}-byte stride, element type is {expected} bytes")]
    StrideMismatch {
        /// Label of the offending buffer.
        label: String,
        /// Size of the host element type.
        expected: u32,
        /// Stride the buffer was created with.
        found: u32,
    },
    /// More elements were supplied than the buffer can hold.
    #[error("buffer `{label}` holds {capacity} elements, {requested} supplied")]
    CapacityExceeded {
        /// Label of the offending buffer.
        label: String,
        /// Buffer capacity in elements.
        capacity: u32,
        /// Number of elements supplied.
        requested: usize,
    },
    /// A blocking transfer failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),
    /// Any other backend failure (launch, validation, lost device).
    #[error("backend error: {0}")]
    Backend(String),
}

/// Convenience alias used throughout the crate.
pub type ComputeResult<T> = Result<T, ComputeError>;
