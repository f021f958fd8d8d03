//! Gradients of the negative log-likelihood with respect to the activations.
//!
//! With `ll` the log-likelihood and `lp(t,u,v)` the joint log-softmax, the
//! derivative of the cost with respect to the joint logit `z(t,u,v)` is
//!
//! ```text
//! g(t,u,v) = exp(alpha(t,u) + beta(t,u) + lp(t,u,v) - ll)
//!          - [v = blank, t < T-1]          exp(alpha(t,u) + lp + beta(t+1,u) - ll)
//!          - [v = blank, (t,u) = (T-1,U-1)] exp(alpha(t,u) + lp - ll)
//!          - [v = y_u,   u < U-1]          exp(alpha(t,u) + lp + beta(t,u+1) - ll)
//! ```
//!
//! Since `z = trans[t] + pred[u]`, `trans_grad[t] = Σ_u g(t,u)` and
//! `pred_grad[u] = Σ_t g(t,u)`.

use crate::batch::ExampleDims;
use crate::joint::ActivationView;
use crate::logmath::log_div;

/// Rows of one example inside a gradient tensor, indexed by `t` or `u`.
pub type GradRows<'r, 'g> = &'r mut [&'g mut [f32]];

/// Lattice statistics needed to differentiate one example.
pub struct GradientAccumulator<'s> {
    pub acts: ActivationView<'s>,
    pub dims: ExampleDims,
    pub labels: &'s [i32],
    pub blank: usize,
    pub alphas: &'s [f32],
    pub betas: &'s [f32],
    pub denom: &'s [f32],
    /// Forward log-likelihood.
    pub loglike: f32,
}

impl GradientAccumulator<'_> {
    /// Overwrites the example's gradient rows.
    ///
    /// Every row is cleared first, so rows past the example's lengths end up
    /// zero. `logits` is scratch of length `alphabet_size`.
    pub fn accumulate(
        &self,
        mut trans_rows: Option<GradRows<'_, '_>>,
        mut pred_rows: Option<GradRows<'_, '_>>,
        logits: &mut [f32],
    ) {
        zero_rows(trans_rows.as_deref_mut());
        zero_rows(pred_rows.as_deref_mut());

        let (t_len, u_len) = (self.dims.t_len, self.dims.u_len);
        let idx = |t: usize, u: usize| t * u_len + u;

        for t in 0..t_len {
            for u in 0..u_len {
                let cell = idx(t, u);
                let log_occupancy = self.alphas[cell] + self.betas[cell] - self.loglike;
                let alpha_ll = self.alphas[cell] - self.loglike;

                let blank_next = if t + 1 < t_len {
                    Some(self.betas[idx(t + 1, u)])
                } else if u + 1 == u_len {
                    Some(0.0)
                } else {
                    None
                };
                let label_next = self
                    .labels
                    .get(u)
                    .map(|&y| (y as usize, self.betas[idx(t, u + 1)]));

                self.acts.joint_logits(t, u, logits);
                for (v, z) in logits.iter_mut().enumerate() {
                    let lp = log_div(*z, self.denom[cell]);
                    let mut g = (log_occupancy + lp).exp();
                    if v == self.blank {
                        if let Some(beta) = blank_next {
                            g -= (alpha_ll + lp + beta).exp();
                        }
                    }
                    if let Some((y, beta)) = label_next {
                        if v == y {
                            g -= (alpha_ll + lp + beta).exp();
                        }
                    }
                    *z = g;
                }

                if let Some(rows) = trans_rows.as_deref_mut() {
                    add_into(&mut rows[t][..], logits);
                }
                if let Some(rows) = pred_rows.as_deref_mut() {
                    add_into(&mut rows[u][..], logits);
                }
            }
        }
    }
}

/// Clears every row of an optional row set.
pub fn zero_rows(rows: Option<GradRows<'_, '_>>) {
    if let Some(rows) = rows {
        for row in rows.iter_mut() {
            row.fill(0.0);
        }
    }
}

#[inline]
fn add_into(dst: &mut [f32], src: &[f32]) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}
