//! Forward and backward recursions over the alignment lattice.
//!
//! Tables are row-major over `t ∈ [0, T)`, `u ∈ [0, U)` with stride `U`.
//! Moving down a row (`t → t+1`) emits a blank, moving right
//! (`u → u+1`) emits label `y_u`. Every complete alignment ends with a
//! blank emitted from `(T-1, U-1)`.

use crate::batch::ExampleDims;
use crate::logmath::log_add;

/// Fills `alphas` and returns the forward log-likelihood
/// `alpha(T-1, U-1) + blank(T-1, U-1)`.
pub fn compute_alphas(
    dims: &ExampleDims,
    blank_lp: &[f32],
    label_lp: &[f32],
    alphas: &mut [f32],
) -> f32 {
    let (t_len, u_len) = (dims.t_len, dims.u_len);
    let idx = |t: usize, u: usize| t * u_len + u;

    alphas[0] = 0.0;
    for t in 1..t_len {
        alphas[idx(t, 0)] = alphas[idx(t - 1, 0)] + blank_lp[idx(t - 1, 0)];
    }
    for u in 1..u_len {
        alphas[idx(0, u)] = alphas[idx(0, u - 1)] + label_lp[idx(0, u - 1)];
    }
    for t in 1..t_len {
        for u in 1..u_len {
            let no_emit = alphas[idx(t - 1, u)] + blank_lp[idx(t - 1, u)];
            let emit = alphas[idx(t, u - 1)] + label_lp[idx(t, u - 1)];
            alphas[idx(t, u)] = log_add(no_emit, emit);
        }
    }

    log_likelihood(dims, alphas, blank_lp)
}

/// Log-probability of the whole lattice, read from a filled alpha table.
///
/// The cost of the example is the negation of this value.
#[inline]
pub fn log_likelihood(dims: &ExampleDims, alphas: &[f32], blank_lp: &[f32]) -> f32 {
    let last = dims.cells() - 1;
    alphas[last] + blank_lp[last]
}

/// Fills `betas` and returns the backward log-likelihood `beta(0, 0)`.
pub fn compute_betas(
    dims: &ExampleDims,
    blank_lp: &[f32],
    label_lp: &[f32],
    betas: &mut [f32],
) -> f32 {
    let (t_len, u_len) = (dims.t_len, dims.u_len);
    let idx = |t: usize, u: usize| t * u_len + u;
    let (t_last, u_last) = (t_len - 1, u_len - 1);

    betas[idx(t_last, u_last)] = blank_lp[idx(t_last, u_last)];
    for t in (0..t_last).rev() {
        betas[idx(t, u_last)] = betas[idx(t + 1, u_last)] + blank_lp[idx(t, u_last)];
    }
    for u in (0..u_last).rev() {
        betas[idx(t_last, u)] = betas[idx(t_last, u + 1)] + label_lp[idx(t_last, u)];
    }
    for t in (0..t_last).rev() {
        for u in (0..u_last).rev() {
            let no_emit = betas[idx(t + 1, u)] + blank_lp[idx(t, u)];
            let emit = betas[idx(t, u + 1)] + label_lp[idx(t, u)];
            betas[idx(t, u)] = log_add(no_emit, emit);
        }
    }

    betas[0]
}

/// True when the two likelihoods agree to within `1e-3` relative.
pub fn likelihoods_agree(forward: f32, backward: f32) -> bool {
    let scale = forward.abs().max(backward.abs()).max(1.0);
    (forward - backward).abs() <= 1e-3 * scale
}
