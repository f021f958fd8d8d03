//! Joint log-probabilities over the lattice.
//!
//! The joint network output at cell `(t, u)` of example `b` is
//! `z = trans[t, b, :] + pred[u, b, :]`. Each cell only needs two log
//! probabilities for the recursions (blank and the next label), plus the
//! log-normalizer, which the gradient pass reuses to recover the full
//! distribution without storing it.

use crate::batch::ExampleDims;
use crate::logmath::{log_div, log_sum_exp, NEG_INF};

/// Read-only view of one example's activation rows.
#[derive(Debug, Clone, Copy)]
pub struct ActivationView<'a> {
    trans_acts: &'a [f32],
    pred_acts: &'a [f32],
    example: usize,
    minibatch: usize,
    alphabet_size: usize,
}

impl<'a> ActivationView<'a> {
    pub fn new(
        trans_acts: &'a [f32],
        pred_acts: &'a [f32],
        example: usize,
        minibatch: usize,
        alphabet_size: usize,
    ) -> Self {
        Self {
            trans_acts,
            pred_acts,
            example,
            minibatch,
            alphabet_size,
        }
    }

    /// Transcription row `trans[t, b, :]`.
    #[inline]
    pub fn trans_row(&self, t: usize) -> &'a [f32] {
        let start = (t * self.minibatch + self.example) * self.alphabet_size;
        &self.trans_acts[start..start + self.alphabet_size]
    }

    /// Prediction row `pred[u, b, :]`.
    #[inline]
    pub fn pred_row(&self, u: usize) -> &'a [f32] {
        let start = (u * self.minibatch + self.example) * self.alphabet_size;
        &self.pred_acts[start..start + self.alphabet_size]
    }

    /// Writes the joint logits of cell `(t, u)` into `out`.
    #[inline]
    pub fn joint_logits(&self, t: usize, u: usize, out: &mut [f32]) {
        for ((o, &a), &b) in out.iter_mut().zip(self.trans_row(t)).zip(self.pred_row(u)) {
            *o = a + b;
        }
    }

    #[inline]
    pub fn alphabet_size(&self) -> usize {
        self.alphabet_size
    }
}

/// Per-cell outputs of [`compute_joint_scores`], each `T·U` row-major.
pub struct JointScores<'s> {
    pub denom: &'s mut [f32],
    pub blank_lp: &'s mut [f32],
    pub label_lp: &'s mut [f32],
}

/// Fills the log-normalizer, blank and label log-probabilities of every
/// cell of one example.
///
/// `label_lp` at `u = U - 1` is `-inf` (there is no label left to emit).
/// `logits` is scratch of length `alphabet_size`.
pub fn compute_joint_scores(
    acts: &ActivationView<'_>,
    dims: &ExampleDims,
    labels: &[i32],
    blank: usize,
    scores: JointScores<'_>,
    logits: &mut [f32],
) {
    let u_len = dims.u_len;
    for t in 0..dims.t_len {
        for u in 0..u_len {
            let idx = t * u_len + u;
            acts.joint_logits(t, u, logits);
            let denom = log_sum_exp(logits);
            scores.denom[idx] = denom;
            scores.blank_lp[idx] = log_div(logits[blank], denom);
            scores.label_lp[idx] = match labels.get(u) {
                Some(&label) => log_div(logits[label as usize], denom),
                None => NEG_INF,
            };
        }
    }
}
