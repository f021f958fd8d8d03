//! Multi-threaded CPU backend.
//!
//! Each example is an independent task: score the lattice, run the forward
//! recursion, and when gradients are requested the backward recursion and
//! the gradient pass. Before fan-out the workspace and the gradient tensors
//! are split into per-example pieces, so tasks own disjoint `&mut` slices and
//! need neither locks nor `unsafe`.
//!
//! Tasks run on a rayon pool built for the call with exactly
//! `num_threads` workers. The call returns once every task has finished.

use rayon::prelude::*;

use crate::batch::{Batch, Gradients, LossInputs};
use crate::error::{RnntError, RnntResult};
use crate::gradient::{zero_rows, GradientAccumulator};
use crate::joint::{compute_joint_scores, ActivationView, JointScores};
use crate::lattice::{compute_alphas, compute_betas, likelihoods_agree};
use crate::workspace::{ExampleScratch, WorkspaceLayout};

/// Work item for one example.
struct ExampleTask<'w, 'g> {
    index: usize,
    scratch: ExampleScratch<'w>,
    cost: &'g mut f32,
    trans_rows: Option<Vec<&'g mut [f32]>>,
    pred_rows: Option<Vec<&'g mut [f32]>>,
}

/// CPU loss engine bound to one validated batch.
pub struct CpuRnnt<'a> {
    batch: &'a Batch<'a>,
    trans_acts: &'a [f32],
    pred_acts: &'a [f32],
    num_threads: usize,
}

impl<'a> CpuRnnt<'a> {
    pub fn new(batch: &'a Batch<'a>, inputs: &LossInputs<'a>, num_threads: usize) -> Self {
        Self {
            batch,
            trans_acts: inputs.trans_acts,
            pred_acts: inputs.pred_acts,
            num_threads,
        }
    }

    /// Computes per-example costs and, if present, gradients.
    ///
    /// `costs` and the gradient tensors must already have been checked
    /// against the batch shape.
    ///
    /// # Errors
    ///
    /// Workspace errors from [`WorkspaceLayout::partition`] and
    /// [`RnntError::ThreadPool`] if the pool cannot be built. In both cases
    /// no output has been written.
    pub fn compute(
        &self,
        costs: &mut [f32],
        grads: Gradients<'_>,
        workspace: &mut [u8],
    ) -> RnntResult<()> {
        let batch = self.batch;
        let minibatch = batch.len();
        let layout =
            WorkspaceLayout::new(batch.max_t, batch.max_u, minibatch, batch.alphabet_size)?;
        let regions = layout.partition(workspace)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads)
            .thread_name(|idx| format!("warprnnt-cpu-{idx}"))
            .build()?;

        let with_grads = grads.any();
        let mut trans_rows = split_rows(grads.trans_grad, minibatch, batch.alphabet_size);
        let mut pred_rows = split_rows(grads.pred_grad, minibatch, batch.alphabet_size);

        let tasks: Vec<ExampleTask<'_, '_>> = regions
            .into_iter()
            .zip(costs.iter_mut())
            .enumerate()
            .map(|(index, (scratch, cost))| ExampleTask {
                index,
                scratch,
                cost,
                trans_rows: trans_rows.as_mut().map(|rows| std::mem::take(&mut rows[index])),
                pred_rows: pred_rows.as_mut().map(|rows| std::mem::take(&mut rows[index])),
            })
            .collect();

        log::debug!(
            "cpu rnnt: {} examples, {} threads, gradients: {}",
            minibatch,
            self.num_threads,
            with_grads
        );

        pool.install(|| tasks.into_par_iter().for_each(|task| self.run_example(task)));
        Ok(())
    }

    fn run_example(&self, task: ExampleTask<'_, '_>) {
        let ExampleTask {
            index,
            scratch,
            cost,
            mut trans_rows,
            mut pred_rows,
        } = task;
        let batch = self.batch;
        let dims = batch.examples()[index];
        let labels = batch.labels(index);
        let acts = ActivationView::new(
            self.trans_acts,
            self.pred_acts,
            index,
            batch.len(),
            batch.alphabet_size,
        );

        let cells = dims.cells();
        let ExampleScratch {
            alphas,
            betas,
            denom,
            blank_lp,
            label_lp,
            logits,
        } = scratch;
        let (alphas, betas) = (&mut alphas[..cells], &mut betas[..cells]);
        let (denom, blank_lp, label_lp) =
            (&mut denom[..cells], &mut blank_lp[..cells], &mut label_lp[..cells]);

        compute_joint_scores(
            &acts,
            &dims,
            labels,
            batch.blank,
            JointScores {
                denom: &mut *denom,
                blank_lp: &mut *blank_lp,
                label_lp: &mut *label_lp,
            },
            logits,
        );
        let loglike = compute_alphas(&dims, blank_lp, label_lp, alphas);

        if !loglike.is_finite() {
            log::warn!("example {index}: log-likelihood is {loglike}, cost set to +inf");
            *cost = f32::INFINITY;
            zero_rows(trans_rows.as_deref_mut());
            zero_rows(pred_rows.as_deref_mut());
            return;
        }
        *cost = -loglike;

        if trans_rows.is_none() && pred_rows.is_none() {
            return;
        }

        let backward = compute_betas(&dims, blank_lp, label_lp, betas);
        if !likelihoods_agree(loglike, backward) {
            log::debug!(
                "example {index}: forward log-likelihood {loglike} differs from backward {backward}"
            );
        }

        GradientAccumulator {
            acts,
            dims,
            labels,
            blank: batch.blank,
            alphas,
            betas,
            denom,
            loglike,
        }
        .accumulate(trans_rows.as_deref_mut(), pred_rows.as_deref_mut(), logits);
    }
}

/// Splits a `(rows, minibatch, V)` gradient tensor into per-example row sets.
///
/// Row `r` belongs to example `r % minibatch`, so example `b` receives its
/// rows in order of the leading index.
fn split_rows(
    grad: Option<&mut [f32]>,
    minibatch: usize,
    alphabet_size: usize,
) -> Option<Vec<Vec<&mut [f32]>>> {
    let grad = grad?;
    let mut per_example: Vec<Vec<&mut [f32]>> = (0..minibatch).map(|_| Vec::new()).collect();
    for (r, row) in grad.chunks_exact_mut(alphabet_size).enumerate() {
        per_example[r % minibatch].push(row);
    }
    Some(per_example)
}

/// Runs the CPU backend for a validated batch.
pub(crate) fn compute(
    batch: &Batch<'_>,
    inputs: &LossInputs<'_>,
    grads: Gradients<'_>,
    costs: &mut [f32],
    workspace: &mut [u8],
    num_threads: usize,
) -> RnntResult<()> {
    if num_threads == 0 {
        return Err(RnntError::Config(crate::config::ConfigError::ZeroThreads));
    }
    CpuRnnt::new(batch, inputs, num_threads).compute(costs, grads, workspace)
}
