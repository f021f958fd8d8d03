//! Workspace sizing and partitioning.
//!
//! The caller allocates scratch memory once from the lattice maxima, before
//! any example-specific lengths are known. [`workspace_size`] returns that
//! upper bound and [`WorkspaceLayout`] knows where every table lives inside
//! it.
//!
//! # CPU layout
//!
//! One region per example, in `f32` words:
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┬──────────┬─────────┐
//! │ alphas   │ betas    │ denom    │ blank lp │ label lp │ logits  │
//! │ maxT·maxU│ maxT·maxU│ maxT·maxU│ maxT·maxU│ maxT·maxU│ V       │
//! └──────────┴──────────┴──────────┴──────────┴──────────┴─────────┘
//! ```
//!
//! # GPU layout
//!
//! One buffer of `u32` words: example metadata `(T, U, label offset, 0)`
//! for every example, the flat label arena padded to `B·(maxU-1)` words,
//! then per example the five lattice tables followed by a four-word
//! log-likelihood block `(forward, backward, 0, 0)`.
//!
//! ```rust
//! use warprnnt::{workspace_size, Backend};
//!
//! let cpu = workspace_size(50, 11, 8, 29, Backend::Cpu).unwrap();
//! assert_eq!(cpu, 4 * 8 * (5 * 50 * 11 + 29));
//! ```

use crate::config::Backend;
use crate::error::{RnntError, RnntResult};

/// Number of lattice tables kept per example.
pub const TABLES_PER_EXAMPLE: usize = 5;

/// Words of metadata per example in the GPU layout.
pub const GPU_META_WORDS: usize = 4;

/// Words of the per-example log-likelihood block in the GPU layout.
pub const GPU_LOGLIKE_WORDS: usize = 4;

/// Returns the number of workspace bytes required for one call.
///
/// # Errors
///
/// [`RnntError::InvalidDimension`] if any argument is zero and
/// [`RnntError::Overflow`] if the size does not fit in `usize`.
pub fn workspace_size(
    max_t: usize,
    max_u: usize,
    minibatch: usize,
    alphabet_size: usize,
    backend: Backend,
) -> RnntResult<usize> {
    let layout = WorkspaceLayout::new(max_t, max_u, minibatch, alphabet_size)?;
    match backend {
        Backend::Cpu => layout.cpu_bytes(),
        Backend::Gpu => layout.gpu_bytes(),
    }
}

/// Placement of every scratch table for a given set of maxima.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub max_t: usize,
    pub max_u: usize,
    pub minibatch: usize,
    pub alphabet_size: usize,
    lattice: usize,
}

impl WorkspaceLayout {
    /// Validates the maxima and precomputes the lattice area.
    pub fn new(
        max_t: usize,
        max_u: usize,
        minibatch: usize,
        alphabet_size: usize,
    ) -> RnntResult<Self> {
        for (name, value) in [
            ("max_t", max_t),
            ("max_u", max_u),
            ("minibatch", minibatch),
            ("alphabet_size", alphabet_size),
        ] {
            if value == 0 {
                return Err(RnntError::invalid_dimension(format!("{name} must be > 0")));
            }
        }
        let lattice = max_t
            .checked_mul(max_u)
            .ok_or_else(|| RnntError::overflow(format!("max_t ({max_t}) * max_u ({max_u})")))?;
        Ok(Self {
            max_t,
            max_u,
            minibatch,
            alphabet_size,
            lattice,
        })
    }

    /// `max_t * max_u`, the capacity of one lattice table.
    #[inline]
    pub fn lattice_len(&self) -> usize {
        self.lattice
    }

    /// Words of one CPU example region.
    pub fn cpu_example_words(&self) -> RnntResult<usize> {
        self.lattice
            .checked_mul(TABLES_PER_EXAMPLE)
            .and_then(|w| w.checked_add(self.alphabet_size))
            .ok_or_else(|| RnntError::overflow("CPU example region"))
    }

    /// Total CPU workspace size in bytes.
    pub fn cpu_bytes(&self) -> RnntResult<usize> {
        self.cpu_example_words()?
            .checked_mul(self.minibatch)
            .and_then(words_to_bytes)
            .ok_or_else(|| RnntError::overflow("CPU workspace size"))
    }

    /// Words of one GPU example region (tables plus log-likelihood block).
    pub fn gpu_example_words(&self) -> RnntResult<usize> {
        self.lattice
            .checked_mul(TABLES_PER_EXAMPLE)
            .and_then(|w| w.checked_add(GPU_LOGLIKE_WORDS))
            .ok_or_else(|| RnntError::overflow("GPU example region"))
    }

    /// Word offset of the label arena in the GPU layout.
    pub fn gpu_labels_offset(&self) -> RnntResult<usize> {
        self.minibatch
            .checked_mul(GPU_META_WORDS)
            .ok_or_else(|| RnntError::overflow("GPU metadata block"))
    }

    /// Capacity of the GPU label arena in words.
    pub fn gpu_label_capacity(&self) -> RnntResult<usize> {
        self.minibatch
            .checked_mul(self.max_u - 1)
            .ok_or_else(|| RnntError::overflow("GPU label arena"))
    }

    /// Word offset of the first example's tables in the GPU layout.
    pub fn gpu_tables_offset(&self) -> RnntResult<usize> {
        self.gpu_labels_offset()?
            .checked_add(self.gpu_label_capacity()?)
            .ok_or_else(|| RnntError::overflow("GPU table offset"))
    }

    /// Total GPU workspace size in words.
    pub fn gpu_words(&self) -> RnntResult<usize> {
        self.gpu_example_words()?
            .checked_mul(self.minibatch)
            .and_then(|w| w.checked_add(self.gpu_tables_offset().ok()?))
            .ok_or_else(|| RnntError::overflow("GPU workspace size"))
    }

    /// Total GPU workspace size in bytes.
    pub fn gpu_bytes(&self) -> RnntResult<usize> {
        words_to_bytes(self.gpu_words()?).ok_or_else(|| RnntError::overflow("GPU workspace size"))
    }

    /// Splits a CPU workspace into one scratch region per example.
    ///
    /// # Errors
    ///
    /// [`RnntError::WorkspaceTooSmall`] if `workspace` is shorter than
    /// [`cpu_bytes`](Self::cpu_bytes) and [`RnntError::MisalignedWorkspace`]
    /// if it is not 4-byte aligned.
    pub fn partition<'a>(&self, workspace: &'a mut [u8]) -> RnntResult<Vec<ExampleScratch<'a>>> {
        let required = self.cpu_bytes()?;
        if workspace.len() < required {
            return Err(RnntError::workspace_too_small(required, workspace.len()));
        }
        let words: &mut [f32] = bytemuck::try_cast_slice_mut(&mut workspace[..required])
            .map_err(|_| RnntError::MisalignedWorkspace)?;

        let lattice = self.lattice;
        Ok(words
            .chunks_exact_mut(self.cpu_example_words()?)
            .map(|region| ExampleScratch::split(region, lattice))
            .collect())
    }
}

fn words_to_bytes(words: usize) -> Option<usize> {
    words.checked_mul(std::mem::size_of::<f32>())
}

/// One example's slice of the CPU workspace.
///
/// Tables are sized for the maxima; an example with lengths `(T, U)` uses
/// the first `T·U` entries of each, row-major with stride `U`.
pub struct ExampleScratch<'a> {
    pub alphas: &'a mut [f32],
    pub betas: &'a mut [f32],
    /// Log-normalizer of the joint distribution at each cell.
    pub denom: &'a mut [f32],
    pub blank_lp: &'a mut [f32],
    pub label_lp: &'a mut [f32],
    /// Joint logits for the cell being evaluated.
    pub logits: &'a mut [f32],
}

impl<'a> ExampleScratch<'a> {
    fn split(region: &'a mut [f32], lattice: usize) -> Self {
        let (alphas, rest) = region.split_at_mut(lattice);
        let (betas, rest) = rest.split_at_mut(lattice);
        let (denom, rest) = rest.split_at_mut(lattice);
        let (blank_lp, rest) = rest.split_at_mut(lattice);
        let (label_lp, logits) = rest.split_at_mut(lattice);
        Self {
            alphas,
            betas,
            denom,
            blank_lp,
            label_lp,
            logits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_size_formula() {
        let bytes = workspace_size(3, 4, 2, 5, Backend::Cpu).unwrap();
        assert_eq!(bytes, 4 * 2 * (5 * 12 + 5));
    }

    #[test]
    fn test_gpu_size_formula() {
        let (t, u, b, v) = (3usize, 4usize, 2usize, 5usize);
        let bytes = workspace_size(t, u, b, v, Backend::Gpu).unwrap();
        assert_eq!(bytes, 4 * (4 * b + b * (u - 1) + b * (5 * t * u + 4)));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        for args in [(0, 1, 1, 1), (1, 0, 1, 1), (1, 1, 0, 1), (1, 1, 1, 0)] {
            let err = workspace_size(args.0, args.1, args.2, args.3, Backend::Cpu).unwrap_err();
            assert!(matches!(err, RnntError::InvalidDimension(_)));
        }
    }

    #[test]
    fn test_overflow_rejected() {
        let err = workspace_size(usize::MAX / 2, 3, 1, 1, Backend::Cpu).unwrap_err();
        assert!(matches!(err, RnntError::Overflow(_)));
        let err = workspace_size(1 << 20, 1 << 20, 1 << 20, 1, Backend::Gpu).unwrap_err();
        assert!(matches!(err, RnntError::Overflow(_)));
    }

    #[test]
    fn test_gpu_offsets() {
        let layout = WorkspaceLayout::new(3, 4, 2, 5).unwrap();
        assert_eq!(layout.gpu_labels_offset().unwrap(), 8);
        assert_eq!(layout.gpu_label_capacity().unwrap(), 6);
        assert_eq!(layout.gpu_tables_offset().unwrap(), 14);
        assert_eq!(layout.gpu_example_words().unwrap(), 64);
        assert_eq!(layout.gpu_words().unwrap(), 14 + 128);
    }

    #[test]
    fn test_partition_regions() {
        let layout = WorkspaceLayout::new(2, 3, 2, 4).unwrap();
        let mut bytes = vec![0u32; layout.cpu_bytes().unwrap() / 4];
        let ws: &mut [u8] = bytemuck::cast_slice_mut(&mut bytes);
        let regions = layout.partition(ws).unwrap();
        assert_eq!(regions.len(), 2);
        for region in &regions {
            assert_eq!(region.alphas.len(), 6);
            assert_eq!(region.betas.len(), 6);
            assert_eq!(region.denom.len(), 6);
            assert_eq!(region.blank_lp.len(), 6);
            assert_eq!(region.label_lp.len(), 6);
            assert_eq!(region.logits.len(), 4);
        }
    }

    #[test]
    fn test_partition_too_small() {
        let layout = WorkspaceLayout::new(2, 3, 2, 4).unwrap();
        let mut bytes = vec![0u32; layout.cpu_bytes().unwrap() / 4 - 1];
        let ws: &mut [u8] = bytemuck::cast_slice_mut(&mut bytes);
        assert!(matches!(
            layout.partition(ws),
            Err(RnntError::WorkspaceTooSmall { .. })
        ));
    }

    #[test]
    fn test_partition_misaligned() {
        let layout = WorkspaceLayout::new(1, 1, 1, 1).unwrap();
        let mut bytes = vec![0u32; 8];
        let ws: &mut [u8] = bytemuck::cast_slice_mut(&mut bytes);
        assert!(matches!(
            layout.partition(&mut ws[1..]),
            Err(RnntError::MisalignedWorkspace)
        ));
    }
}
