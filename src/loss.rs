//! Host entry points.
//!
//! - [`compute_rnnt_loss`] - one call over caller-owned host buffers,
//!   including the workspace
//! - [`RnntLoss`] - owns its options and workspace and can be called
//!   repeatedly
//!
//! Both validate the whole call before any output is written and dispatch
//! on [`RnntOptions::location`].
//!
//! # Example
//!
//! ```rust
//! use warprnnt::{compute_rnnt_loss, workspace_size, Backend, Gradients, LossInputs, RnntOptions};
//!
//! let (max_t, max_u, minibatch, v) = (2, 2, 1, 3);
//! let trans = vec![0.0f32; max_t * minibatch * v];
//! let pred = vec![0.0f32; max_u * minibatch * v];
//! let inputs = LossInputs {
//!     trans_acts: &trans,
//!     pred_acts: &pred,
//!     labels: &[1],
//!     label_lengths: &[1],
//!     input_lengths: &[2],
//!     alphabet_size: v,
//!     minibatch,
//! };
//! let options = RnntOptions::cpu(max_t, max_u, 1);
//! let mut workspace = vec![0u32; workspace_size(max_t, max_u, minibatch, v, Backend::Cpu)? / 4];
//! let mut costs = vec![0.0f32; minibatch];
//!
//! compute_rnnt_loss(
//!     &inputs,
//!     Gradients::none(),
//!     &mut costs,
//!     bytemuck::cast_slice_mut(&mut workspace),
//!     &options,
//! )?;
//! // two alignments, each of probability (1/3)^3
//! assert!((costs[0] - (-(2.0f32 / 27.0).ln())).abs() < 1e-5);
//! # Ok::<(), warprnnt::RnntError>(())
//! ```

use crate::batch::{Batch, Gradients, LossInputs};
use crate::buffer::AlignedBuffer;
use crate::config::{ComputeLocation, RnntOptions};
use crate::cpu;
use crate::error::RnntResult;
use crate::workspace::WorkspaceLayout;

#[cfg(feature = "gpu")]
use crate::error::RnntError;
#[cfg(feature = "gpu")]
use crate::gpu::{GpuRnnt, GpuWorkspace};

/// Computes per-example costs and optional gradients over host memory.
///
/// `workspace` must hold at least
/// [`workspace_size`](crate::workspace_size) bytes for the call's maxima and
/// backend. The CPU backend also requires it to be 4-byte aligned. The GPU
/// backend checks the size but stages through device buffers of its own,
/// and returns only after the results have been copied back. Those buffers
/// and the compiled kernels are cached on the [`GpuStream`](crate::gpu::GpuStream),
/// so repeated calls on one stream pay for them once.
///
/// # Errors
///
/// Any validation error (nothing is written), then backend errors.
pub fn compute_rnnt_loss(
    inputs: &LossInputs<'_>,
    grads: Gradients<'_>,
    costs: &mut [f32],
    workspace: &mut [u8],
    options: &RnntOptions,
) -> RnntResult<()> {
    let batch = Batch::new(inputs, options)?;
    batch.check_outputs(costs.len(), &grads)?;

    match &options.location {
        ComputeLocation::Cpu { num_threads } => {
            cpu::compute(&batch, inputs, grads, costs, workspace, *num_threads)
        }
        #[cfg(feature = "gpu")]
        ComputeLocation::Gpu(stream) => {
            let required = layout_for(&batch)?.gpu_bytes()?;
            if workspace.len() < required {
                return Err(RnntError::workspace_too_small(required, workspace.len()));
            }
            GpuRnnt::compute_host_cached(stream, &batch, inputs, grads, costs)
        }
    }
}

fn layout_for(batch: &Batch<'_>) -> RnntResult<WorkspaceLayout> {
    WorkspaceLayout::new(batch.max_t, batch.max_u, batch.len(), batch.alphabet_size)
}

/// Reusable loss computation.
///
/// Owns the options and a cache-line aligned workspace that grows to the
/// largest call seen so far. With a GPU location it also keeps the compiled
/// pipelines and the device staging buffers between calls.
///
/// ```rust
/// use warprnnt::{Gradients, LossInputs, RnntLoss, RnntOptions};
///
/// let mut loss = RnntLoss::new(RnntOptions::cpu(1, 1, 1));
/// let trans = [0.0f32, 1.0];
/// let pred = [0.0f32, 0.0];
/// let inputs = LossInputs {
///     trans_acts: &trans,
///     pred_acts: &pred,
///     labels: &[],
///     label_lengths: &[0],
///     input_lengths: &[1],
///     alphabet_size: 2,
///     minibatch: 1,
/// };
/// let costs = loss.costs(&inputs)?;
/// // -log softmax([0, 1])[0]
/// assert!((costs[0] - (1.0f32 + 1.0f32.exp()).ln()).abs() < 1e-5);
/// # Ok::<(), warprnnt::RnntError>(())
/// ```
pub struct RnntLoss {
    options: RnntOptions,
    workspace: AlignedBuffer,
    #[cfg(feature = "gpu")]
    gpu: Option<(GpuRnnt, GpuWorkspace)>,
}

impl RnntLoss {
    pub fn new(options: RnntOptions) -> Self {
        Self {
            options,
            workspace: AlignedBuffer::new(),
            #[cfg(feature = "gpu")]
            gpu: None,
        }
    }

    #[inline]
    pub fn options(&self) -> &RnntOptions {
        &self.options
    }

    /// Bytes currently reserved for the host workspace.
    pub fn workspace_capacity(&self) -> usize {
        self.workspace.capacity()
    }

    /// Computes costs into `costs` and any requested gradients.
    pub fn compute(
        &mut self,
        inputs: &LossInputs<'_>,
        grads: Gradients<'_>,
        costs: &mut [f32],
    ) -> RnntResult<()> {
        let batch = Batch::new(inputs, &self.options)?;
        batch.check_outputs(costs.len(), &grads)?;

        match &self.options.location {
            ComputeLocation::Cpu { num_threads } => {
                let bytes = layout_for(&batch)?.cpu_bytes()?;
                self.workspace.resize(bytes)?;
                cpu::compute(
                    &batch,
                    inputs,
                    grads,
                    costs,
                    self.workspace.as_mut_slice(),
                    *num_threads,
                )
            }
            #[cfg(feature = "gpu")]
            ComputeLocation::Gpu(stream) => {
                let (engine, staging) = self
                    .gpu
                    .get_or_insert_with(|| (GpuRnnt::new(stream.clone()), GpuWorkspace::new()));
                engine.compute_host(&batch, inputs, grads, costs, staging)
            }
        }
    }

    /// Computes costs only and returns them.
    pub fn costs(&mut self, inputs: &LossInputs<'_>) -> RnntResult<Vec<f32>> {
        let mut costs = vec![0.0; inputs.minibatch];
        self.compute(inputs, Gradients::none(), &mut costs)?;
        Ok(costs)
    }
}

impl std::fmt::Debug for RnntLoss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RnntLoss")
            .field("options", &self.options)
            .field("workspace_capacity", &self.workspace.capacity())
            .finish()
    }
}
