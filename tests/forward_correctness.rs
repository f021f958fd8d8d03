//! Tests for loss numerical correctness.
//!
//! These tests verify:
//! - Costs match an explicit sum over every alignment path
//! - Closed-form single-cell and 2x2 lattices
//! - Batching, thread count and blank index do not change results
//! - Fully `-inf` activations give `+inf` costs without NaN anywhere

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use warprnnt::{
    compute_rnnt_loss, workspace_size, AlignedBuffer, Backend, Gradients, LossInputs, RnntLoss,
    RnntOptions, WorkspaceLayout,
};

/// One generated problem with owned buffers.
struct Problem {
    trans: Vec<f32>,
    pred: Vec<f32>,
    labels: Vec<i32>,
    label_lengths: Vec<i32>,
    input_lengths: Vec<i32>,
    alphabet_size: usize,
    minibatch: usize,
    max_t: usize,
    max_u: usize,
    blank: usize,
}

impl Problem {
    fn random(seed: u64, minibatch: usize, max_t: usize, max_u: usize, v: usize, blank: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let trans = (0..max_t * minibatch * v).map(|_| rng.gen_range(-2.0..2.0)).collect();
        let pred = (0..max_u * minibatch * v).map(|_| rng.gen_range(-2.0..2.0)).collect();

        let mut labels = Vec::new();
        let mut label_lengths = Vec::new();
        let mut input_lengths = Vec::new();
        for b in 0..minibatch {
            // first example always uses the full lattice
            let t_len = if b == 0 { max_t } else { rng.gen_range(1..=max_t) };
            let l_len = if b == 0 { max_u - 1 } else { rng.gen_range(0..max_u) };
            for _ in 0..l_len {
                let mut y = rng.gen_range(0..v);
                while y == blank {
                    y = rng.gen_range(0..v);
                }
                labels.push(y as i32);
            }
            label_lengths.push(l_len as i32);
            input_lengths.push(t_len as i32);
        }

        Self {
            trans,
            pred,
            labels,
            label_lengths,
            input_lengths,
            alphabet_size: v,
            minibatch,
            max_t,
            max_u,
            blank,
        }
    }

    fn inputs(&self) -> LossInputs<'_> {
        LossInputs {
            trans_acts: &self.trans,
            pred_acts: &self.pred,
            labels: &self.labels,
            label_lengths: &self.label_lengths,
            input_lengths: &self.input_lengths,
            alphabet_size: self.alphabet_size,
            minibatch: self.minibatch,
        }
    }

    fn options(&self, threads: usize) -> RnntOptions {
        RnntOptions::cpu(self.max_t, self.max_u, threads).with_blank(self.blank)
    }

    fn costs(&self, threads: usize) -> Vec<f32> {
        RnntLoss::new(self.options(threads))
            .costs(&self.inputs())
            .expect("loss computation failed")
    }

    fn label_offset(&self, b: usize) -> usize {
        self.label_lengths[..b].iter().map(|&l| l as usize).sum()
    }

    /// `log_softmax(trans[t,b,:] + pred[u,b,:])` in f64.
    fn log_softmax(&self, b: usize, t: usize, u: usize) -> Vec<f64> {
        let v = self.alphabet_size;
        let z: Vec<f64> = (0..v)
            .map(|k| {
                self.trans[(t * self.minibatch + b) * v + k] as f64
                    + self.pred[(u * self.minibatch + b) * v + k] as f64
            })
            .collect();
        let max = z.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let lse = max + z.iter().map(|x| (x - max).exp()).sum::<f64>().ln();
        z.iter().map(|x| x - lse).collect()
    }

    /// Negative log of the summed probability of every alignment path.
    fn brute_force_cost(&self, b: usize) -> f64 {
        let t_len = self.input_lengths[b] as usize;
        let u_len = self.label_lengths[b] as usize + 1;
        let offset = self.label_offset(b);
        let labels = &self.labels[offset..offset + u_len - 1];

        let mut path_logprobs = Vec::new();
        self.enumerate(b, labels, t_len, u_len, 0, 0, 0.0, &mut path_logprobs);
        let max = path_logprobs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let total = max + path_logprobs.iter().map(|p| (p - max).exp()).sum::<f64>().ln();
        -total
    }

    #[allow(clippy::too_many_arguments)]
    fn enumerate(
        &self,
        b: usize,
        labels: &[i32],
        t_len: usize,
        u_len: usize,
        t: usize,
        u: usize,
        acc: f64,
        out: &mut Vec<f64>,
    ) {
        let lp = self.log_softmax(b, t, u);
        if t == t_len - 1 && u == u_len - 1 {
            out.push(acc + lp[self.blank]);
            return;
        }
        if t + 1 < t_len {
            self.enumerate(b, labels, t_len, u_len, t + 1, u, acc + lp[self.blank], out);
        }
        if u + 1 < u_len {
            let y = labels[u] as usize;
            self.enumerate(b, labels, t_len, u_len, t, u + 1, acc + lp[y], out);
        }
    }
}

fn assert_close(actual: f32, expected: f64, rel: f64, what: &str) {
    let diff = (actual as f64 - expected).abs();
    let scale = expected.abs().max(1.0);
    assert!(
        diff <= rel * scale,
        "{what}: got {actual}, expected {expected}, diff={diff}"
    );
}

// =============================================================================
// Closed Forms
// =============================================================================

/// T = 1, U = 1: the only alignment emits a single blank.
#[test]
fn test_single_cell_is_negative_log_softmax_blank() {
    let trans = [0.2f32, -1.0, 0.7, 0.1];
    let pred = [0.5f32, 0.3, -0.2, 0.0];
    let inputs = LossInputs {
        trans_acts: &trans,
        pred_acts: &pred,
        labels: &[],
        label_lengths: &[0],
        input_lengths: &[1],
        alphabet_size: 4,
        minibatch: 1,
    };
    let costs = RnntLoss::new(RnntOptions::cpu(1, 1, 1))
        .costs(&inputs)
        .unwrap();

    let z: Vec<f64> = trans.iter().zip(&pred).map(|(a, b)| (a + b) as f64).collect();
    let lse = z.iter().map(|x| x.exp()).sum::<f64>().ln();
    assert_close(costs[0], lse - z[0], 1e-6, "single cell");
}

/// T = 2, U = 2 with one label: exactly two alignments.
#[test]
fn test_two_by_two_equals_two_path_sum() {
    let problem = Problem {
        trans: vec![0.1, 0.6, -0.3, -0.4, 0.2, 0.9],
        pred: vec![0.0, -0.5, 0.3, 0.8, 0.1, -0.2],
        labels: vec![2],
        label_lengths: vec![1],
        input_lengths: vec![2],
        alphabet_size: 3,
        minibatch: 1,
        max_t: 2,
        max_u: 2,
        blank: 0,
    };
    let lp = |t, u| problem.log_softmax(0, t, u);

    // blank, label, blank  and  label, blank, blank
    let path_a = lp(0, 0)[0] + lp(1, 0)[2] + lp(1, 1)[0];
    let path_b = lp(0, 0)[2] + lp(0, 1)[0] + lp(1, 1)[0];
    let expected = -(path_a.exp() + path_b.exp()).ln();

    let costs = problem.costs(1);
    assert_close(costs[0], expected, 1e-5, "2x2 lattice");
    assert_close(costs[0], problem.brute_force_cost(0), 1e-5, "2x2 brute force");
}

/// Uniform activations: every path has probability V^-(T+U-1).
#[test]
fn test_uniform_activations_count_paths() {
    let (t_len, u_len, v) = (4usize, 3usize, 5usize);
    let problem = Problem {
        trans: vec![0.0; t_len * v],
        pred: vec![0.0; u_len * v],
        labels: vec![1, 2],
        label_lengths: vec![2],
        input_lengths: vec![t_len as i32],
        alphabet_size: v,
        minibatch: 1,
        max_t: t_len,
        max_u: u_len,
        blank: 0,
    };
    // C(T-1 + U-1, U-1) paths of T+U-1 emissions each
    let paths = 10.0f64;
    let emissions = (t_len + u_len - 1) as f64;
    let expected = emissions * (v as f64).ln() - paths.ln();

    assert_close(problem.costs(1)[0], expected, 1e-5, "uniform");
}

// =============================================================================
// Brute-Force Agreement
// =============================================================================

#[test]
fn test_random_lattices_match_brute_force() {
    for seed in 0..8u64 {
        let problem = Problem::random(seed, 3, 4, 4, 5, 0);
        let costs = problem.costs(2);
        for b in 0..problem.minibatch {
            let expected = problem.brute_force_cost(b);
            assert_close(costs[b], expected, 1e-4, &format!("seed {seed} example {b}"));
        }
    }
}

#[test]
fn test_nonzero_blank_matches_brute_force() {
    let problem = Problem::random(99, 4, 3, 4, 6, 4);
    let costs = problem.costs(1);
    for b in 0..problem.minibatch {
        assert_close(costs[b], problem.brute_force_cost(b), 1e-4, &format!("example {b}"));
    }
}

#[test]
fn test_long_input_is_finite() {
    let problem = Problem::random(5, 2, 200, 20, 8, 0);
    let costs = problem.costs(2);
    assert!(costs.iter().all(|c| c.is_finite() && *c > 0.0), "{costs:?}");
}

// =============================================================================
// Batch Invariance
// =============================================================================

#[test]
fn test_thread_count_does_not_change_results() {
    let problem = Problem::random(11, 16, 6, 5, 7, 0);
    let single = problem.costs(1);
    let multi = problem.costs(4);
    assert_eq!(single, multi);
}

#[test]
fn test_batched_equals_individual() {
    let problem = Problem::random(21, 5, 5, 4, 6, 0);
    let batched = problem.costs(3);

    for b in 0..problem.minibatch {
        let v = problem.alphabet_size;
        let trans: Vec<f32> = (0..problem.max_t)
            .flat_map(|t| {
                let row = (t * problem.minibatch + b) * v;
                problem.trans[row..row + v].to_vec()
            })
            .collect();
        let pred: Vec<f32> = (0..problem.max_u)
            .flat_map(|u| {
                let row = (u * problem.minibatch + b) * v;
                problem.pred[row..row + v].to_vec()
            })
            .collect();
        let offset = problem.label_offset(b);
        let len = problem.label_lengths[b] as usize;
        let inputs = LossInputs {
            trans_acts: &trans,
            pred_acts: &pred,
            labels: &problem.labels[offset..offset + len],
            label_lengths: &problem.label_lengths[b..b + 1],
            input_lengths: &problem.input_lengths[b..b + 1],
            alphabet_size: v,
            minibatch: 1,
        };
        let single = RnntLoss::new(problem.options(1)).costs(&inputs).unwrap();
        assert_close(batched[b], single[0] as f64, 1e-6, &format!("example {b}"));
    }
}

#[test]
fn test_costs_only_and_with_gradients_agree() {
    let problem = Problem::random(31, 4, 5, 3, 4, 0);
    let costs_only = problem.costs(2);

    let mut trans_grad = vec![0.0f32; problem.trans.len()];
    let mut pred_grad = vec![0.0f32; problem.pred.len()];
    let mut costs = vec![0.0f32; problem.minibatch];
    let mut ws = AlignedBuffer::with_len(
        workspace_size(problem.max_t, problem.max_u, problem.minibatch, problem.alphabet_size, Backend::Cpu)
            .unwrap(),
    )
    .unwrap();
    compute_rnnt_loss(
        &problem.inputs(),
        Gradients::both(&mut trans_grad, &mut pred_grad),
        &mut costs,
        ws.as_mut_slice(),
        &problem.options(2),
    )
    .unwrap();

    assert_eq!(costs_only, costs);
}

// =============================================================================
// Degenerate Activations
// =============================================================================

/// A prediction row that is `-inf` everywhere makes its lattice column
/// unreachable: the cost is `+inf`, gradients are zero and no table holds NaN.
#[test]
fn test_all_neg_inf_row_gives_infinite_cost_without_nan() {
    let (max_t, max_u, v) = (2usize, 2usize, 3usize);
    let trans = vec![0.1f32, 0.6, -0.3, -0.4, 0.2, 0.9];
    let mut pred = vec![0.0f32, -0.5, 0.3, 0.0, 0.0, 0.0];
    pred[v..].fill(f32::NEG_INFINITY);
    let inputs = LossInputs {
        trans_acts: &trans,
        pred_acts: &pred,
        labels: &[2],
        label_lengths: &[1],
        input_lengths: &[2],
        alphabet_size: v,
        minibatch: 1,
    };

    let mut costs = vec![0.0f32; 1];
    let mut trans_grad = vec![f32::NAN; trans.len()];
    let mut pred_grad = vec![f32::NAN; pred.len()];
    let mut ws =
        AlignedBuffer::with_len(workspace_size(max_t, max_u, 1, v, Backend::Cpu).unwrap()).unwrap();
    compute_rnnt_loss(
        &inputs,
        Gradients::both(&mut trans_grad, &mut pred_grad),
        &mut costs,
        ws.as_mut_slice(),
        &RnntOptions::cpu(max_t, max_u, 1),
    )
    .unwrap();

    assert_eq!(costs[0], f32::INFINITY);
    assert!(trans_grad.iter().all(|&g| g == 0.0), "trans_grad: {trans_grad:?}");
    assert!(pred_grad.iter().all(|&g| g == 0.0), "pred_grad: {pred_grad:?}");

    let layout = WorkspaceLayout::new(max_t, max_u, 1, v).unwrap();
    let scratch = layout.partition(ws.as_mut_slice()).unwrap();
    let tables = [
        ("alphas", &scratch[0].alphas[..]),
        ("denom", &scratch[0].denom[..]),
        ("blank_lp", &scratch[0].blank_lp[..]),
        ("label_lp", &scratch[0].label_lp[..]),
    ];
    for (name, table) in tables {
        assert!(!table.iter().any(|x| x.is_nan()), "{name} has NaN: {table:?}");
    }
    // column u = 1 is unreachable from its own scores
    assert_eq!(scratch[0].blank_lp[1], f32::NEG_INFINITY);
    assert_eq!(scratch[0].blank_lp[3], f32::NEG_INFINITY);
}

/// A blank logit of `-inf` in the first prediction row leaves a single
/// alignment with finite probability; the cost and gradients stay finite.
#[test]
fn test_neg_inf_blank_logit_keeps_gradients_finite() {
    let mut problem = Problem {
        trans: vec![0.1, 0.6, -0.3, -0.4, 0.2, 0.9],
        pred: vec![0.0, -0.5, 0.3, 0.8, 0.1, -0.2],
        labels: vec![2],
        label_lengths: vec![1],
        input_lengths: vec![2],
        alphabet_size: 3,
        minibatch: 1,
        max_t: 2,
        max_u: 2,
        blank: 0,
    };
    problem.pred[0] = f32::NEG_INFINITY;
    let lp = |t, u| problem.log_softmax(0, t, u);

    // label, blank, blank is the only path left
    let expected = -(lp(0, 0)[2] + lp(0, 1)[0] + lp(1, 1)[0]);

    let mut costs = vec![0.0f32; 1];
    let mut trans_grad = vec![0.0f32; problem.trans.len()];
    let mut pred_grad = vec![0.0f32; problem.pred.len()];
    RnntLoss::new(problem.options(1))
        .compute(
            &problem.inputs(),
            Gradients::both(&mut trans_grad, &mut pred_grad),
            &mut costs,
        )
        .unwrap();

    assert_close(costs[0], expected, 1e-5, "single surviving path");
    assert!(trans_grad.iter().chain(&pred_grad).all(|g| g.is_finite()));
}
