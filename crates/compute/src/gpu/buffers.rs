//! wgpu buffer and bind-group-layout helpers.

use wgpu::util::DeviceExt;

/// Minimum buffer size (wgpu requires non-zero buffers).
pub(crate) const MIN_BUF_SIZE: u64 = 4;

/// Uniform blocks are padded to this many bytes.
const UNIFORM_ALIGN: usize = 16;

/// Round `size` up to the copy alignment wgpu requires.
pub(crate) fn align_to_copy(size: u64) -> u64 {
    size.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT
}

/// Usage flags of every buffer the compute layer hands out.
pub(crate) fn storage_usage() -> wgpu::BufferUsages {
    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
}

/// Create a staging (MAP_READ) buffer for readback.
pub(crate) fn create_staging_buf(device: &wgpu::Device, label: &str, size: u64) -> wgpu::Buffer {
    let size = align_to_copy(size.max(MIN_BUF_SIZE));
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Create the uniform block for one dispatch. Empty params still produce a
/// zeroed 16-byte block so every kernel layout can carry a uniform slot.
pub(crate) fn create_params_buf(device: &wgpu::Device, label: &str, params: &[u8]) -> wgpu::Buffer {
    let padded_len = params.len().div_ceil(UNIFORM_ALIGN).max(1) * UNIFORM_ALIGN;
    let mut contents = vec![0u8; padded_len];
    contents[..params.len()].copy_from_slice(params);
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: &contents,
        usage: wgpu::BufferUsages::UNIFORM,
    })
}

// ---- Bind group layout entry helpers ----

pub(crate) fn bgl_uniform(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn bgl_storage_ro(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn bgl_storage_rw(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_alignment_rounds_up() {
        assert_eq!(align_to_copy(0), 0);
        assert_eq!(align_to_copy(1), 4);
        assert_eq!(align_to_copy(4), 4);
        assert_eq!(align_to_copy(18), 20);
    }
}
