//! Reusable device buffers for host-memory GPU calls.
//!
//! When activations live in host memory, each call stages them through
//! device tensors. [`GpuWorkspace`] keeps those tensors between calls:
//!
//! - the lattice workspace grows when needed but never shrinks
//! - activation, cost and gradient tensors are reallocated only when the
//!   problem shape changes

use crate::error::RnntResult;
use crate::gpu::GpuTensor;

/// Device buffers reused across host-memory calls.
#[derive(Debug, Default)]
pub struct GpuWorkspace {
    pub workspace: Option<GpuTensor>,
    pub trans_acts: Option<GpuTensor>,
    pub pred_acts: Option<GpuTensor>,
    pub costs: Option<GpuTensor>,
    pub trans_grad: Option<GpuTensor>,
    pub pred_grad: Option<GpuTensor>,
    /// Bumped on every reallocation.
    generation: u64,
}

impl GpuWorkspace {
    /// Creates an empty workspace (lazy allocation).
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures the lattice workspace holds at least `bytes` bytes.
    pub fn ensure_workspace(&mut self, device: &wgpu::Device, bytes: usize) -> RnntResult<()> {
        let fits = self
            .workspace
            .as_ref()
            .is_some_and(|ws| ws.size_bytes() >= bytes as u64);
        if !fits {
            log::debug!("growing GPU workspace to {bytes} bytes");
            self.workspace = Some(GpuTensor::workspace(device, bytes)?);
            self.generation += 1;
        }
        Ok(())
    }

    /// Ensures `slot` holds a tensor of exactly `shape`.
    pub fn ensure_shape(
        slot: &mut Option<GpuTensor>,
        device: &wgpu::Device,
        shape: &[usize],
        generation: &mut u64,
    ) -> RnntResult<()> {
        if slot.as_ref().map(|t| t.shape.as_slice()) != Some(shape) {
            *slot = Some(GpuTensor::storage_read_write(device, shape.to_vec())?);
            *generation += 1;
        }
        Ok(())
    }

    /// Allocates every tensor a call with the given dimensions needs.
    pub fn prepare(
        &mut self,
        device: &wgpu::Device,
        dims: StagingDims,
        with_trans_grad: bool,
        with_pred_grad: bool,
    ) -> RnntResult<()> {
        let StagingDims {
            max_t,
            max_u,
            minibatch,
            alphabet_size,
            workspace_bytes,
        } = dims;
        let trans_shape = [max_t, minibatch, alphabet_size];
        let pred_shape = [max_u, minibatch, alphabet_size];

        self.ensure_workspace(device, workspace_bytes)?;
        let generation = &mut self.generation;
        Self::ensure_shape(&mut self.trans_acts, device, &trans_shape, generation)?;
        Self::ensure_shape(&mut self.pred_acts, device, &pred_shape, generation)?;
        Self::ensure_shape(&mut self.costs, device, &[minibatch], generation)?;
        if with_trans_grad {
            Self::ensure_shape(&mut self.trans_grad, device, &trans_shape, generation)?;
        }
        if with_pred_grad {
            Self::ensure_shape(&mut self.pred_grad, device, &pred_shape, generation)?;
        }
        Ok(())
    }

    /// Number of reallocations so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Total bytes currently allocated on the device.
    pub fn allocated_bytes(&self) -> u64 {
        [
            &self.workspace,
            &self.trans_acts,
            &self.pred_acts,
            &self.costs,
            &self.trans_grad,
            &self.pred_grad,
        ]
        .iter()
        .filter_map(|slot| slot.as_ref())
        .map(|t| t.size_bytes())
        .sum()
    }
}

/// Problem dimensions for [`GpuWorkspace::prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingDims {
    pub max_t: usize,
    pub max_u: usize,
    pub minibatch: usize,
    pub alphabet_size: usize,
    pub workspace_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_workspace() {
        let ws = GpuWorkspace::new();
        assert_eq!(ws.generation(), 0);
        assert_eq!(ws.allocated_bytes(), 0);
        assert!(ws.workspace.is_none());
    }
}
