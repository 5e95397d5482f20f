//! Device-to-host readback of append counts and buffer contents.
//!
//! Three flavours of every read:
//! - blocking (`append_count`, `buffer_contents`), which stall until the
//!   device is idle;
//! - callback (`*_async`), where the callback runs exactly once from inside
//!   [`ComputeContext::poll`];
//! - handle (`request_*`), which returns a [`ReadbackHandle`] resolved by
//!   the same polling.
//!
//! Append counts are clamped to the buffer's capacity: the device counter
//! keeps incrementing past capacity even though the extra writes are dropped.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use tracing::{debug, warn};

use crate::buffer::{BufferId, BufferKind, GpuBuffer, COUNT_BUFFER_BYTES};
use crate::context::ComputeContext;
use crate::device::{ComputeDevice, PollMode};
use crate::error::{ComputeResult, TransferError};

/// Result of an append-count readback.
pub type CountReadback = Result<u32, TransferError>;

/// Count reported to sentinel-style consumers when the transfer failed.
pub const COUNT_ERROR_SENTINEL: i64 = -1;

/// Flattens a count result into a single integer, `-1` on failure.
pub trait CountSentinel {
    /// The count, or [`COUNT_ERROR_SENTINEL`] if the read failed.
    fn sentinel(&self) -> i64;
}

impl CountSentinel for CountReadback {
    fn sentinel(&self) -> i64 {
        match self {
            Ok(count) => i64::from(*count),
            Err(_) => COUNT_ERROR_SENTINEL,
        }
    }
}

pub(crate) type Finish = Box<dyn FnOnce(Result<Vec<u8>, TransferError>) + Send>;

/// A readback the device has not answered yet.
pub(crate) struct PendingReadback {
    pub(crate) label: String,
    /// Count buffer created for this request alone, released on completion.
    pub(crate) transient: Option<GpuBuffer>,
    pub(crate) finish: Finish,
}

/// Handle to a readback issued with one of the `request_*` methods.
///
/// The value arrives when the owning context is polled. It can be taken
/// with [`try_take`](Self::try_take), awaited through
/// [`ComputeContext::wait`], or awaited as a future while something else
/// drives the context.
#[must_use = "a readback handle does nothing unless checked or awaited"]
#[derive(Debug)]
pub struct ReadbackHandle<T> {
    receiver: oneshot::Receiver<Result<T, TransferError>>,
}

impl<T> ReadbackHandle<T> {
    fn channel() -> (oneshot::Sender<Result<T, TransferError>>, Self) {
        let (sender, receiver) = oneshot::channel();
        (sender, Self { receiver })
    }

    /// Takes the result if it has arrived. A context dropped with the
    /// request still in flight yields `Disconnected`.
    pub fn try_take(&mut self) -> Option<Result<T, TransferError>> {
        match self.receiver.try_recv() {
            Ok(Some(result)) => Some(result),
            Ok(None) => None,
            Err(oneshot::Canceled) => Some(Err(TransferError::Disconnected)),
        }
    }
}

impl<T> Future for ReadbackHandle<T> {
    type Output = Result<T, TransferError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TransferError::Disconnected)))
    }
}

fn decode_count(bytes: &[u8]) -> Result<u32, TransferError> {
    let Some(raw) = bytes.get(..COUNT_BUFFER_BYTES as usize) else {
        return Err(TransferError::Misaligned {
            len: bytes.len(),
            stride: COUNT_BUFFER_BYTES as usize,
        });
    };
    Ok(bytemuck::pod_read_unaligned::<u32>(raw))
}

fn decode_elements<T: bytemuck::Pod>(bytes: &[u8], capacity: u32) -> Result<Vec<T>, TransferError> {
    let stride = std::mem::size_of::<T>();
    if stride == 0 || bytes.len() % stride != 0 {
        return Err(TransferError::Misaligned {
            len: bytes.len(),
            stride,
        });
    }
    Ok(bytes
        .chunks_exact(stride)
        .take(capacity as usize)
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

impl<D: ComputeDevice> ComputeContext<D> {
    /// Number of elements currently in `append`, clamped to its capacity.
    ///
    /// Blocks until every previously launched kernel has finished. When
    /// `count_buffer` is `None` a temporary one is created and released
    /// before returning, on success or failure.
    pub fn append_count(
        &mut self,
        append: &GpuBuffer,
        count_buffer: Option<&GpuBuffer>,
    ) -> ComputeResult<u32> {
        let source = self.checked(append)?;
        append.ensure_kind(BufferKind::Append)?;
        let (target, transient) = match count_buffer {
            Some(buffer) => (self.checked_count_target(buffer)?, None),
            None => {
                let buffer = self.create_count()?;
                (buffer.id(), Some(buffer))
            }
        };

        let result = self
            .device
            .copy_counter(source, target, 0)
            .and_then(|()| Ok(self.device.read(target)?))
            .and_then(|bytes| Ok(decode_count(&bytes)?));

        if let Some(mut buffer) = transient {
            self.release(&mut buffer);
        }
        let count = result?.min(append.capacity());
        debug!("Append count of {} read (blocking): {}", append.label(), count);
        Ok(count)
    }

    /// Reads the number of elements in `append` without blocking.
    ///
    /// `on_complete` runs exactly once, from a later [`poll`](Self::poll),
    /// with the clamped count or the transfer error; failures are also
    /// logged. A temporary count buffer (used when `count_buffer` is
    /// `None`) is released once the transfer completes either way.
    ///
    /// A caller-supplied count buffer is overwritten by the copy. Overlapping
    /// requests through one shared count buffer are not ordered by this
    /// layer: a backend that stages lazily can hand the first request the
    /// second one's value. Pass `None` for overlapping reads.
    pub fn append_count_async<F>(
        &mut self,
        append: &GpuBuffer,
        count_buffer: Option<&GpuBuffer>,
        on_complete: F,
    ) -> ComputeResult<()>
    where
        F: FnOnce(CountReadback) + Send + 'static,
    {
        let source = self.checked(append)?;
        append.ensure_kind(BufferKind::Append)?;
        let (target, transient) = match count_buffer {
            Some(buffer) => (self.checked_count_target(buffer)?, None),
            None => {
                let buffer = self.create_count()?;
                (buffer.id(), Some(buffer))
            }
        };

        if let Err(e) = self.device.copy_counter(source, target, 0) {
            if let Some(mut buffer) = transient {
                self.release(&mut buffer);
            }
            return Err(e);
        }

        let label = append.label().to_owned();
        let capacity = append.capacity();
        let log_label = label.clone();
        let finish: Finish = Box::new(move |result| {
            let count = result
                .and_then(|bytes| decode_count(&bytes))
                .map(|raw| raw.min(capacity));
            if let Err(e) = &count {
                warn!("Append count readback of {} failed: {}", log_label, e);
            }
            on_complete(count);
        });
        self.submit(target, label, transient, finish)
    }

    /// Handle-returning form of [`append_count_async`](Self::append_count_async).
    pub fn request_append_count(
        &mut self,
        append: &GpuBuffer,
        count_buffer: Option<&GpuBuffer>,
    ) -> ComputeResult<ReadbackHandle<u32>> {
        let (sender, handle) = ReadbackHandle::channel();
        self.append_count_async(append, count_buffer, move |count| {
            let _ = sender.send(count);
        })?;
        Ok(handle)
    }

    /// Every element of `buffer`, blocking until the device is idle.
    pub fn buffer_contents<T: bytemuck::Pod>(&mut self, buffer: &GpuBuffer) -> ComputeResult<Vec<T>> {
        let id = self.checked(buffer)?;
        buffer.ensure_stride::<T>()?;
        let bytes = self.device.read(id)?;
        Ok(decode_elements(&bytes, buffer.capacity())?)
    }

    /// Reads every element of `buffer` without blocking.
    ///
    /// `on_complete` runs exactly once from a later [`poll`](Self::poll),
    /// with the elements or the transfer error. Failures are also logged.
    pub fn buffer_contents_async<T, F>(&mut self, buffer: &GpuBuffer, on_complete: F) -> ComputeResult<()>
    where
        T: bytemuck::Pod + Send,
        F: FnOnce(Result<Vec<T>, TransferError>) + Send + 'static,
    {
        let id = self.checked(buffer)?;
        buffer.ensure_stride::<T>()?;
        let label = buffer.label().to_owned();
        let capacity = buffer.capacity();
        let log_label = label.clone();
        let finish: Finish = Box::new(move |result| {
            let contents = result.and_then(|bytes| decode_elements::<T>(&bytes, capacity));
            if let Err(e) = &contents {
                warn!("Buffer readback of {} failed: {}", log_label, e);
            }
            on_complete(contents);
        });
        self.submit(id, label, None, finish)
    }

    /// Handle-returning form of [`buffer_contents_async`](Self::buffer_contents_async).
    pub fn request_buffer_contents<T>(&mut self, buffer: &GpuBuffer) -> ComputeResult<ReadbackHandle<Vec<T>>>
    where
        T: bytemuck::Pod + Send,
    {
        let (sender, handle) = ReadbackHandle::channel();
        self.buffer_contents_async::<T, _>(buffer, move |contents| {
            let _ = sender.send(contents);
        })?;
        Ok(handle)
    }

    /// Polls (blocking) until `handle` resolves.
    pub fn wait<T>(&mut self, mut handle: ReadbackHandle<T>) -> ComputeResult<T> {
        loop {
            if let Some(result) = handle.try_take() {
                return Ok(result?);
            }
            self.ensure_pending()?;
            self.poll(PollMode::Wait)?;
        }
    }

    fn submit(
        &mut self,
        source: BufferId,
        label: String,
        transient: Option<GpuBuffer>,
        finish: Finish,
    ) -> ComputeResult<()> {
        let request = self.next_request_id();
        if let Err(e) = self.device.read_async(source, request) {
            if let Some(mut buffer) = transient {
                self.release(&mut buffer);
            }
            return Err(e);
        }
        debug!("Readback {} of {} issued", request.0, label);
        self.pending.insert(
            request,
            PendingReadback {
                label,
                transient,
                finish,
            },
        );
        Ok(())
    }

    fn checked_count_target(&self, buffer: &GpuBuffer) -> ComputeResult<BufferId> {
        let id = self.checked(buffer)?;
        buffer.ensure_kind(BufferKind::Count)?;
        Ok(id)
    }
}
