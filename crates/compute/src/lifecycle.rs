//! Buffer creation, host writes and release.

use tracing::{debug, warn};

use crate::buffer::{BufferDesc, BufferKind, GpuBuffer};
use crate::context::ComputeContext;
use crate::device::ComputeDevice;
use crate::error::{ComputeError, ComputeResult};

/// Outcome of a batch release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Buffers whose allocation was freed by this call.
    pub released: usize,
    /// Buffers (or empty slots) that had nothing left to free.
    pub skipped: usize,
}

impl<D: ComputeDevice> ComputeContext<D> {
    /// Allocates a buffer from a full descriptor. Append buffers start with
    /// their counter at zero.
    pub fn create_buffer(&mut self, desc: BufferDesc) -> ComputeResult<GpuBuffer> {
        let id = self.device.allocate(&desc)?;
        let buffer = GpuBuffer::new(self.id, id, desc);
        if buffer.kind() == BufferKind::Append {
            if let Err(e) = self.device.set_counter(id, 0) {
                self.device.free(id);
                return Err(e);
            }
        }
        debug!(
            "Created {} buffer {} ({} x {} bytes)",
            buffer.kind(),
            buffer.label(),
            buffer.capacity(),
            buffer.stride()
        );
        Ok(buffer)
    }

    /// A structured buffer of `count` elements of `T`. Zero is treated as one.
    pub fn create_structured<T: bytemuck::Pod>(&mut self, count: usize) -> ComputeResult<GpuBuffer> {
        self.create_buffer(BufferDesc::structured::<T>(count))
    }

    /// Like [`create_structured`](Self::create_structured), releasing any
    /// buffer already in `slot` first.
    pub fn create_structured_into<T: bytemuck::Pod>(
        &mut self,
        slot: &mut Option<GpuBuffer>,
        count: usize,
    ) -> ComputeResult<()> {
        self.release_slot(slot);
        *slot = Some(self.create_structured::<T>(count)?);
        Ok(())
    }

    /// A structured buffer sized to `data` and filled with it. Empty data
    /// yields a one-element buffer.
    pub fn create_structured_from<T: bytemuck::Pod>(&mut self, data: &[T]) -> ComputeResult<GpuBuffer> {
        let mut buffer = self.create_structured::<T>(data.len())?;
        if data.is_empty() {
            return Ok(buffer);
        }
        if let Err(e) = self.device.upload(buffer.id(), bytemuck::cast_slice(data)) {
            self.release(&mut buffer);
            return Err(e);
        }
        Ok(buffer)
    }

    /// Like [`create_structured_from`](Self::create_structured_from),
    /// releasing any buffer already in `slot` first.
    pub fn create_structured_from_into<T: bytemuck::Pod>(
        &mut self,
        slot: &mut Option<GpuBuffer>,
        data: &[T],
    ) -> ComputeResult<()> {
        self.release_slot(slot);
        *slot = Some(self.create_structured_from(data)?);
        Ok(())
    }

    /// An append buffer with room for `capacity` elements of `T` and its
    /// counter at zero. Zero capacity is treated as one.
    pub fn create_append<T: bytemuck::Pod>(&mut self, capacity: usize) -> ComputeResult<GpuBuffer> {
        self.create_buffer(BufferDesc::append::<T>(capacity))
    }

    /// Like [`create_append`](Self::create_append), releasing any buffer
    /// already in `slot` first.
    pub fn create_append_into<T: bytemuck::Pod>(
        &mut self,
        slot: &mut Option<GpuBuffer>,
        capacity: usize,
    ) -> ComputeResult<()> {
        self.release_slot(slot);
        *slot = Some(self.create_append::<T>(capacity)?);
        Ok(())
    }

    /// A single-integer count buffer. Its contents are undefined until a
    /// counter is copied into it.
    pub fn create_count(&mut self) -> ComputeResult<GpuBuffer> {
        self.create_buffer(BufferDesc::count())
    }

    /// Like [`create_count`](Self::create_count), releasing any buffer
    /// already in `slot` first.
    pub fn create_count_into(&mut self, slot: &mut Option<GpuBuffer>) -> ComputeResult<()> {
        self.release_slot(slot);
        *slot = Some(self.create_count()?);
        Ok(())
    }

    /// Overwrites the start of a buffer with `data`.
    pub fn write_buffer<T: bytemuck::Pod>(&mut self, buffer: &GpuBuffer, data: &[T]) -> ComputeResult<()> {
        let id = self.checked(buffer)?;
        buffer.ensure_stride::<T>()?;
        if data.len() > buffer.capacity() as usize {
            return Err(ComputeError::CapacityExceeded {
                label: buffer.label().to_owned(),
                capacity: buffer.capacity(),
                requested: data.len(),
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        self.device.upload(id, bytemuck::cast_slice(data))
    }

    /// Sets an append buffer's counter, typically back to zero before the
    /// kernel that fills it runs again.
    pub fn reset_counter(&mut self, buffer: &GpuBuffer, value: u32) -> ComputeResult<()> {
        let id = self.checked(buffer)?;
        buffer.ensure_kind(BufferKind::Append)?;
        self.device.set_counter(id, value)
    }

    /// Frees the buffer's allocation. Releasing twice is a no-op, and so is
    /// releasing a buffer created by another context (the handle stays live).
    pub fn release(&mut self, buffer: &mut GpuBuffer) -> bool {
        if !self.owns(buffer) {
            return false;
        }
        let Some(id) = buffer.mark_released() else {
            return false;
        };
        self.device.free(id);
        debug!("Released buffer {}", buffer.label());
        true
    }

    /// Releases and clears the buffer in `slot`, if any. A foreign buffer is
    /// left in place.
    pub fn release_slot(&mut self, slot: &mut Option<GpuBuffer>) -> bool {
        let Some(buffer) = slot.as_mut() else {
            return false;
        };
        if !self.owns(buffer) {
            return false;
        }
        let released = self.release(buffer);
        *slot = None;
        released
    }

    fn owns(&self, buffer: &GpuBuffer) -> bool {
        if buffer.owner() == self.id {
            return true;
        }
        warn!(
            "Buffer {} belongs to another compute context, release ignored",
            buffer.label()
        );
        false
    }

    /// Releases every buffer in `buffers`.
    pub fn release_all<'b>(
        &mut self,
        buffers: impl IntoIterator<Item = &'b mut GpuBuffer>,
    ) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        for buffer in buffers {
            if self.release(buffer) {
                report.released += 1;
            } else {
                report.skipped += 1;
            }
        }
        report
    }

    /// Releases and clears every slot in `slots`. Empty slots count as skipped.
    pub fn release_slots<'b>(
        &mut self,
        slots: impl IntoIterator<Item = &'b mut Option<GpuBuffer>>,
    ) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        for slot in slots {
            if self.release_slot(slot) {
                report.released += 1;
            } else {
                report.skipped += 1;
            }
        }
        report
    }
}
