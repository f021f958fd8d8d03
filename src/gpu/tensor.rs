//! Device-resident tensors with upload and download helpers.
//!
//! Activations, costs, gradients and the device workspace are all
//! [`GpuTensor`]s: a storage buffer of 32-bit words with a logical shape.

use crate::error::{RnntError, RnntResult};
use crate::gpu::{exceeds_vram_limit, MAX_VRAM_ALLOC};
use wgpu::util::DeviceExt;

const WORD: usize = std::mem::size_of::<f32>();

/// A storage buffer of 32-bit words with shape metadata.
///
/// Data is row-major, matching the host tensor layout.
pub struct GpuTensor {
    pub buffer: wgpu::Buffer,
    pub shape: Vec<usize>,
    pub capacity_bytes: u64,
}

impl GpuTensor {
    /// Creates a tensor initialized from host data.
    ///
    /// # Errors
    ///
    /// [`RnntError::ShapeMismatch`] if `data` does not match `shape`, and
    /// [`RnntError::BufferError`] if the allocation exceeds [`MAX_VRAM_ALLOC`].
    pub fn upload(device: &wgpu::Device, data: &[f32], shape: Vec<usize>) -> RnntResult<Self> {
        let expected_len: usize = shape.iter().product();
        if data.len() != expected_len {
            return Err(RnntError::shape_mismatch("GpuTensor", expected_len, data.len()));
        }
        let size_bytes = checked_size(data.len())?;

        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("GpuTensor"),
            contents: bytemuck::cast_slice(data),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        });

        Ok(Self {
            buffer,
            shape,
            capacity_bytes: size_bytes,
        })
    }

    /// Creates a tensor without host data.
    ///
    /// wgpu zero-fills new buffers, so the contents start at zero.
    pub fn uninit(
        device: &wgpu::Device,
        shape: Vec<usize>,
        usage: wgpu::BufferUsages,
    ) -> RnntResult<Self> {
        let num_elements: usize = shape.iter().product();
        let size_bytes = checked_size(num_elements)?;

        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GpuTensor (uninit)"),
            size: size_bytes,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC
                | usage,
            mapped_at_creation: false,
        });

        Ok(Self {
            buffer,
            shape,
            capacity_bytes: size_bytes,
        })
    }

    /// Creates a read-write storage tensor.
    pub fn storage_read_write(device: &wgpu::Device, shape: Vec<usize>) -> RnntResult<Self> {
        Self::uninit(device, shape, wgpu::BufferUsages::empty())
    }

    /// Creates a device workspace of `bytes` bytes (rounded up to whole words).
    pub fn workspace(device: &wgpu::Device, bytes: usize) -> RnntResult<Self> {
        Self::storage_read_write(device, vec![bytes.div_ceil(WORD)])
    }

    /// Copies the tensor back to the host.
    ///
    /// Blocks until every previously submitted command on `queue` has
    /// completed, which makes this the synchronization point for enqueued
    /// loss work.
    pub fn download(&self, device: &wgpu::Device, queue: &wgpu::Queue) -> RnntResult<Vec<f32>> {
        let size_bytes = self.size_bytes();
        if size_bytes == 0 {
            return Ok(Vec::new());
        }

        let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GpuTensor staging (download)"),
            size: size_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("GpuTensor download encoder"),
        });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging_buffer, 0, size_bytes);
        queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        device.poll(wgpu::Maintain::Wait);

        rx.recv()
            .map_err(|e| RnntError::buffer(format!("Failed to receive map result: {e}")))??;

        let data = {
            let mapped = buffer_slice.get_mapped_range();
            bytemuck::cast_slice(&mapped).to_vec()
        };
        staging_buffer.unmap();

        Ok(data)
    }

    /// Overwrites the tensor contents from host data.
    pub fn update(&self, queue: &wgpu::Queue, data: &[f32]) -> RnntResult<()> {
        let expected_len = self.num_elements();
        if data.len() != expected_len {
            return Err(RnntError::shape_mismatch("GpuTensor", expected_len, data.len()));
        }
        queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(data));
        Ok(())
    }

    /// Returns the total number of elements in the tensor.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Returns the size in bytes.
    pub fn size_bytes(&self) -> u64 {
        (self.num_elements() * WORD) as u64
    }

    /// Fails unless the tensor holds exactly `expected` elements.
    pub fn check_len(&self, what: &'static str, expected: usize) -> RnntResult<()> {
        let got = self.num_elements();
        if got != expected {
            return Err(RnntError::shape_mismatch(what, expected, got));
        }
        Ok(())
    }
}

fn checked_size(num_elements: usize) -> RnntResult<u64> {
    let size_bytes = num_elements
        .checked_mul(WORD)
        .ok_or_else(|| RnntError::overflow("GpuTensor size"))? as u64;
    if exceeds_vram_limit(size_bytes) {
        return Err(RnntError::buffer(format!(
            "allocation of {size_bytes} bytes exceeds the {MAX_VRAM_ALLOC} byte limit"
        )));
    }
    Ok(size_bytes)
}

impl std::fmt::Debug for GpuTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuTensor")
            .field("shape", &self.shape)
            .field("capacity_bytes", &self.capacity_bytes)
            .field("num_elements", &self.num_elements())
            .finish()
    }
}
