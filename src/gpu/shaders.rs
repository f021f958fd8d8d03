//! WGSL source for the RNNT kernels.
//!
//! One module holds all five entry points so they share the binding layout
//! and the workspace accessors:
//!
//! | Entry point | Dispatch | Work item |
//! |-------------|----------|-----------|
//! | `score_main` | 2D grid over `minibatch · maxT · maxU` | one lattice cell |
//! | `alpha_main` | `minibatch` workgroups | one example, anti-diagonals in order |
//! | `beta_main` | `minibatch` workgroups | one example, anti-diagonals in reverse |
//! | `trans_grad_main` | 2D grid over `maxT · minibatch · V` | one gradient entry, sums over `u` |
//! | `pred_grad_main` | 2D grid over `maxU · minibatch · V` | one gradient entry, sums over `t` |
//!
//! # Bind Groups
//!
//! - Group 0:
//!   - Binding 0: params (uniform) - `RnntUniforms`
//!   - Binding 1: trans_acts (storage, read) - `[maxT, B, V]`
//!   - Binding 2: pred_acts (storage, read) - `[maxU, B, V]`
//!   - Binding 3: workspace (storage, read_write) - `u32` words
//!   - Binding 4: costs (storage, read_write) - `[B]`
//! - Group 1 (gradient kernels only):
//!   - Binding 0: grad (storage, read_write) - `[maxT | maxU, B, V]`
//!
//! WGSL has no portable infinities, so unreachable lattice cells hold
//! `NEG_BIG = -1e30` and anything below `UNREACHABLE` is treated as zero
//! probability.

/// Entry point names, in dispatch order.
pub const ENTRY_POINTS: [&str; 5] = [
    "score_main",
    "alpha_main",
    "beta_main",
    "trans_grad_main",
    "pred_grad_main",
];

/// RNNT loss and gradient kernels.
pub const RNNT_SHADER: &str = r#"
// Must match RnntUniforms in Rust
struct Params {
    minibatch: u32,
    alphabet_size: u32,
    blank: u32,
    max_t: u32,

    max_u: u32,
    lattice: u32,
    labels_offset: u32,
    tables_offset: u32,

    example_stride: u32,
    diagonals: u32,
    pos_inf_bits: u32,
    _pad: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> trans_acts: array<f32>;
@group(0) @binding(2) var<storage, read> pred_acts: array<f32>;
@group(0) @binding(3) var<storage, read_write> ws: array<u32>;
@group(0) @binding(4) var<storage, read_write> costs: array<f32>;

@group(1) @binding(0) var<storage, read_write> grad: array<f32>;

const WORKGROUP_SIZE: u32 = 64u;
const NEG_BIG: f32 = -1e30;
const UNREACHABLE: f32 = -5e29;

// Table indices inside one example's region
const ALPHAS: u32 = 0u;
const BETAS: u32 = 1u;
const DENOM: u32 = 2u;
const BLANK_LP: u32 = 3u;
const LABEL_LP: u32 = 4u;
const LOGLIKE: u32 = 5u;

fn ld(i: u32) -> f32 {
    return bitcast<f32>(ws[i]);
}

fn st(i: u32, x: f32) {
    ws[i] = bitcast<u32>(x);
}

// Example metadata: (T, U, label offset, 0)
fn ex_t(b: u32) -> u32 {
    return ws[b * 4u];
}

fn ex_u(b: u32) -> u32 {
    return ws[b * 4u + 1u];
}

fn label_at(b: u32, u: u32) -> u32 {
    return ws[params.labels_offset + ws[b * 4u + 2u] + u];
}

fn table(b: u32, k: u32) -> u32 {
    return params.tables_offset + b * params.example_stride + k * params.lattice;
}

fn log_add(a: f32, b: f32) -> f32 {
    let hi = max(a, b);
    if (hi <= UNREACHABLE) {
        return NEG_BIG;
    }
    return hi + log(1.0 + exp(min(a, b) - hi));
}

// z - denom, or NEG_BIG when the whole cell is unreachable
fn log_norm(z: f32, denom: f32) -> f32 {
    if (denom <= UNREACHABLE) {
        return NEG_BIG;
    }
    return z - denom;
}

fn linear_id(gid: vec3<u32>, nwg: vec3<u32>) -> u32 {
    return gid.y * nwg.x * WORKGROUP_SIZE + gid.x;
}

@compute @workgroup_size(64)
fn score_main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let idx = linear_id(gid, nwg);
    if (idx >= params.minibatch * params.lattice) {
        return;
    }
    let b = idx / params.lattice;
    let cell = idx % params.lattice;
    let T = ex_t(b);
    let U = ex_u(b);
    if (cell >= T * U) {
        return;
    }
    let t = cell / U;
    let u = cell % U;

    let V = params.alphabet_size;
    let trow = (t * params.minibatch + b) * V;
    let prow = (u * params.minibatch + b) * V;

    var hi = NEG_BIG;
    for (var v = 0u; v < V; v += 1u) {
        hi = max(hi, trans_acts[trow + v] + pred_acts[prow + v]);
    }
    var denom = NEG_BIG;
    if (hi > UNREACHABLE) {
        var sum = 0.0;
        for (var v = 0u; v < V; v += 1u) {
            sum += exp(trans_acts[trow + v] + pred_acts[prow + v] - hi);
        }
        denom = hi + log(sum);
    }

    st(table(b, DENOM) + cell, denom);
    st(
        table(b, BLANK_LP) + cell,
        log_norm(trans_acts[trow + params.blank] + pred_acts[prow + params.blank], denom),
    );
    var label_lp = NEG_BIG;
    if (u + 1u < U) {
        let y = label_at(b, u);
        label_lp = log_norm(trans_acts[trow + y] + pred_acts[prow + y], denom);
    }
    st(table(b, LABEL_LP) + cell, label_lp);
}

@compute @workgroup_size(64)
fn alpha_main(
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {
    let b = wid.x;
    let lane = lid.x;
    let T = ex_t(b);
    let U = ex_u(b);
    let alphas = table(b, ALPHAS);
    let blank_lp = table(b, BLANK_LP);
    let label_lp = table(b, LABEL_LP);

    for (var d = 0u; d < params.diagonals; d += 1u) {
        for (var k = 0u; k < params.max_t; k += WORKGROUP_SIZE) {
            let t = k + lane;
            if (t < T && t <= d && d - t < U) {
                let u = d - t;
                let cell = t * U + u;
                var a = 0.0;
                if (t == 0u && u == 0u) {
                    a = 0.0;
                } else if (t == 0u) {
                    a = ld(alphas + cell - 1u) + ld(label_lp + cell - 1u);
                } else if (u == 0u) {
                    a = ld(alphas + cell - U) + ld(blank_lp + cell - U);
                } else {
                    a = log_add(
                        ld(alphas + cell - U) + ld(blank_lp + cell - U),
                        ld(alphas + cell - 1u) + ld(label_lp + cell - 1u),
                    );
                }
                st(alphas + cell, max(a, NEG_BIG));
            }
        }
        storageBarrier();
        workgroupBarrier();
    }

    if (lane == 0u) {
        let last = T * U - 1u;
        let ll = ld(alphas + last) + ld(blank_lp + last);
        st(table(b, LOGLIKE), ll);
        if (ll > UNREACHABLE) {
            costs[b] = -ll;
        } else {
            costs[b] = bitcast<f32>(params.pos_inf_bits);
        }
    }
}

@compute @workgroup_size(64)
fn beta_main(
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
) {
    let b = wid.x;
    let lane = lid.x;
    let T = ex_t(b);
    let U = ex_u(b);
    let betas = table(b, BETAS);
    let blank_lp = table(b, BLANK_LP);
    let label_lp = table(b, LABEL_LP);

    for (var i = 0u; i < params.diagonals; i += 1u) {
        let d = params.diagonals - 1u - i;
        for (var k = 0u; k < params.max_t; k += WORKGROUP_SIZE) {
            let t = k + lane;
            if (t < T && t <= d && d - t < U) {
                let u = d - t;
                let cell = t * U + u;
                var beta = 0.0;
                if (t + 1u == T && u + 1u == U) {
                    beta = ld(blank_lp + cell);
                } else if (t + 1u == T) {
                    beta = ld(betas + cell + 1u) + ld(label_lp + cell);
                } else if (u + 1u == U) {
                    beta = ld(betas + cell + U) + ld(blank_lp + cell);
                } else {
                    beta = log_add(
                        ld(betas + cell + U) + ld(blank_lp + cell),
                        ld(betas + cell + 1u) + ld(label_lp + cell),
                    );
                }
                st(betas + cell, max(beta, NEG_BIG));
            }
        }
        storageBarrier();
        workgroupBarrier();
    }

    if (lane == 0u) {
        st(table(b, LOGLIKE) + 1u, ld(betas));
    }
}

// d cost / d z(t, u, v) for one lattice cell
fn grad_term(b: u32, t: u32, u: u32, v: u32, T: u32, U: u32, ll: f32, lp: f32) -> f32 {
    let cell = t * U + u;
    let betas = table(b, BETAS);
    let a = ld(table(b, ALPHAS) + cell) - ll;
    var g = exp(a + ld(betas + cell) + lp);
    if (v == params.blank) {
        if (t + 1u < T) {
            g -= exp(a + lp + ld(betas + cell + U));
        } else if (u + 1u == U) {
            g -= exp(a + lp);
        }
    }
    if (u + 1u < U) {
        if (v == label_at(b, u)) {
            g -= exp(a + lp + ld(betas + cell + 1u));
        }
    }
    return g;
}

@compute @workgroup_size(64)
fn trans_grad_main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let idx = linear_id(gid, nwg);
    let V = params.alphabet_size;
    if (idx >= params.max_t * params.minibatch * V) {
        return;
    }
    let v = idx % V;
    let row = idx / V;
    let b = row % params.minibatch;
    let t = row / params.minibatch;
    let T = ex_t(b);
    let U = ex_u(b);
    let ll = ld(table(b, LOGLIKE));
    if (t >= T || ll <= UNREACHABLE) {
        grad[idx] = 0.0;
        return;
    }

    let z_t = trans_acts[idx];
    let denom = table(b, DENOM);
    var acc = 0.0;
    for (var u = 0u; u < U; u += 1u) {
        let lp = log_norm(z_t + pred_acts[(u * params.minibatch + b) * V + v], ld(denom + t * U + u));
        acc += grad_term(b, t, u, v, T, U, ll, lp);
    }
    grad[idx] = acc;
}

@compute @workgroup_size(64)
fn pred_grad_main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let idx = linear_id(gid, nwg);
    let V = params.alphabet_size;
    if (idx >= params.max_u * params.minibatch * V) {
        return;
    }
    let v = idx % V;
    let row = idx / V;
    let b = row % params.minibatch;
    let u = row / params.minibatch;
    let T = ex_t(b);
    let U = ex_u(b);
    let ll = ld(table(b, LOGLIKE));
    if (u >= U || ll <= UNREACHABLE) {
        grad[idx] = 0.0;
        return;
    }

    let z_u = pred_acts[idx];
    let denom = table(b, DENOM);
    var acc = 0.0;
    for (var t = 0u; t < T; t += 1u) {
        let lp = log_norm(trans_acts[(t * params.minibatch + b) * V + v] + z_u, ld(denom + t * U + u));
        acc += grad_term(b, t, u, v, T, U, ll, lp);
    }
    grad[idx] = acc;
}
"#;
