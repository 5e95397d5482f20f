//! Kernel call descriptions.

use crate::buffer::GpuBuffer;

/// A kernel invocation: name, bound buffers in binding order, and an
/// optional uniform parameter block.
///
/// ```ignore
/// let call = KernelCall::new("integrate")
///     .bind(&particles)
///     .params(&StepParams { dt: 0.01, ..Default::default() });
/// ctx.dispatch(&call, particle_count, 64)?;
/// ```
#[derive(Debug, Clone)]
pub struct KernelCall<'a> {
    name: &'a str,
    bindings: Vec<&'a GpuBuffer>,
    params: Vec<u8>,
}

impl<'a> KernelCall<'a> {
    /// A call to the kernel registered as `name`, with nothing bound.
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            bindings: Vec::new(),
            params: Vec::new(),
        }
    }

    /// Binds `buffer` at the next binding slot.
    pub fn bind(mut self, buffer: &'a GpuBuffer) -> Self {
        self.bindings.push(buffer);
        self
    }

    /// Sets the uniform parameter block.
    pub fn params<T: bytemuck::Pod>(mut self, params: &T) -> Self {
        self.params = bytemuck::bytes_of(params).to_vec();
        self
    }

    /// Kernel name.
    pub fn name(&self) -> &str {
        self.name
    }

    /// Bound buffers in binding order.
    pub fn bindings(&self) -> &[&'a GpuBuffer] {
        &self.bindings
    }

    /// Raw parameter bytes.
    pub fn params_bytes(&self) -> &[u8] {
        &self.params
    }
}
