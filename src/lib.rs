//! # warprnnt - RNN-Transducer loss on CPU and GPU
//!
//! Computes the RNNT sequence loss and its gradients for a minibatch of
//! variable-length examples. Each example's alignment lattice is scored,
//! walked forward and backward in the log domain, and turned into
//! per-activation gradients.
//!
//! ## Architecture
//! - Activations are split into a transcription tensor `(maxT, B, V)` and a
//!   prediction tensor `(maxU, B, V)`; the joint score of a lattice cell is
//!   their sum
//! - Scratch memory is a caller-owned workspace sized by [`workspace_size`]
//!   from the maxima alone
//! - CPU: one rayon task per example (see [`cpu`])
//! - GPU (`gpu` feature): wgpu compute kernels on a caller-provided stream
//!   (see [`gpu`])
//!
//! ## Usage
//! ```rust
//! use warprnnt::{Gradients, LossInputs, RnntLoss, RnntOptions};
//!
//! let (max_t, max_u, minibatch, v) = (3, 2, 1, 4);
//! let trans = vec![0.1f32; max_t * minibatch * v];
//! let pred = vec![0.2f32; max_u * minibatch * v];
//! let inputs = LossInputs {
//!     trans_acts: &trans,
//!     pred_acts: &pred,
//!     labels: &[2],
//!     label_lengths: &[1],
//!     input_lengths: &[3],
//!     alphabet_size: v,
//!     minibatch,
//! };
//!
//! let mut trans_grad = vec![0.0f32; trans.len()];
//! let mut pred_grad = vec![0.0f32; pred.len()];
//! let mut costs = vec![0.0f32; minibatch];
//!
//! let mut loss = RnntLoss::new(RnntOptions::cpu(max_t, max_u, 2));
//! loss.compute(&inputs, Gradients::both(&mut trans_grad, &mut pred_grad), &mut costs)?;
//! assert!(costs[0] > 0.0);
//! # Ok::<(), warprnnt::RnntError>(())
//! ```

pub mod batch;
pub mod buffer;
pub mod config;
pub mod cpu;
pub mod error;
pub mod ffi;
pub mod gradient;
pub mod joint;
pub mod lattice;
pub mod logmath;
pub mod loss;
pub mod workspace;

#[cfg(feature = "gpu")]
pub mod gpu;

// Re-exports
pub use batch::{Batch, ExampleDims, Gradients, LossInputs};
pub use buffer::{AlignedBuffer, CACHE_LINE};
pub use config::{Backend, ComputeLocation, ConfigError, RnntOptions};
pub use error::{RnntError, RnntResult, RnntStatus};
pub use loss::{compute_rnnt_loss, RnntLoss};
pub use workspace::{workspace_size, WorkspaceLayout};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the C interface, returned by `get_warprnnt_version`.
pub const API_VERSION: i32 = 1;

/// Returns [`API_VERSION`].
pub fn version() -> i32 {
    API_VERSION
}
