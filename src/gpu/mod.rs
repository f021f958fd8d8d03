//! GPU backend using wgpu.
//!
//! Only available with the `gpu` feature.
//!
//! # Architecture
//!
//! Every call records one compute pass of up to five kernels (see
//! [`shaders`]) on the queue of a [`GpuStream`]:
//!
//! 1. joint scores for every lattice cell
//! 2. forward variables, one workgroup per example
//! 3. backward variables (only when gradients are requested)
//! 4. gradients with respect to `trans_acts` and `pred_acts`
//!
//! The caller-provided workspace holds per-example metadata, the label
//! arena and the lattice tables; its size comes from
//! [`workspace_size`](crate::workspace_size) with [`Backend::Gpu`](crate::Backend::Gpu).
//!
//! # Example
//!
//! ```rust,no_run
//! use warprnnt::gpu::{GpuTensor, WgpuBackend, WgpuOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = WgpuBackend::init(WgpuOptions::default())?;
//! let stream = backend.stream();
//!
//! let data = vec![1.0f32; 1024];
//! let tensor = GpuTensor::upload(stream.device(), &data, vec![1024])?;
//! let result = tensor.download(stream.device(), stream.queue())?;
//! assert_eq!(result, data);
//! # Ok(())
//! # }
//! ```
//!
//! # Memory Management
//!
//! - Host-memory calls stage through a [`GpuWorkspace`] that grows but
//!   never shrinks.
//! - No single buffer may exceed [`MAX_VRAM_ALLOC`].

mod backend;
mod pipeline;
mod rnnt;
pub mod shaders;
mod tensor;
mod uniforms;
mod workspace;

pub use backend::{GpuStream, PowerPreference, WgpuBackend, WgpuOptions};
pub use pipeline::{grid_2d, workgroup_count, Kernel, PipelineCache, WORKGROUP_SIZE};
pub use rnnt::{GpuGradients, GpuLossInputs, GpuRnnt};
pub use shaders::RNNT_SHADER;
pub use tensor::GpuTensor;
pub use uniforms::RnntUniforms;
pub use workspace::{GpuWorkspace, StagingDims};

/// Maximum VRAM allocation per buffer (2GB).
pub const MAX_VRAM_ALLOC: u64 = 2 * 1024 * 1024 * 1024;

/// Checks if a size in bytes exceeds the maximum VRAM allocation limit.
#[inline]
pub fn exceeds_vram_limit(size_bytes: u64) -> bool {
    size_bytes > MAX_VRAM_ALLOC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vram_limit() {
        assert!(!exceeds_vram_limit(1024));
        assert!(!exceeds_vram_limit(MAX_VRAM_ALLOC));
        assert!(exceeds_vram_limit(MAX_VRAM_ALLOC + 1));
    }
}
