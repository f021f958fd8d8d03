//! Call inputs and their validation.
//!
//! [`LossInputs`] borrows the caller's activation tensors, the flat label
//! arena and the per-example lengths. [`Batch::new`] checks every length and
//! label against the options and produces the per-example dimensions and
//! label offsets used by both backends. Nothing is computed until the whole
//! batch has been validated, so a malformed call never touches an output.

use crate::config::RnntOptions;
use crate::error::{RnntError, RnntResult};

/// Borrowed inputs of one loss computation.
///
/// Activations are row-major: element `(i, b, v)` of a `(rows, minibatch,
/// alphabet_size)` tensor lives at `(i * minibatch + b) * alphabet_size + v`.
#[derive(Debug, Clone, Copy)]
pub struct LossInputs<'a> {
    /// Transcription activations, `(max_t, minibatch, alphabet_size)`.
    pub trans_acts: &'a [f32],
    /// Prediction activations, `(max_u, minibatch, alphabet_size)`.
    pub pred_acts: &'a [f32],
    /// All label sequences concatenated.
    pub labels: &'a [i32],
    /// Label count of each example.
    pub label_lengths: &'a [i32],
    /// Input frame count of each example.
    pub input_lengths: &'a [i32],
    pub alphabet_size: usize,
    pub minibatch: usize,
}

/// Optional gradient outputs, shaped like their activation tensors.
#[derive(Debug, Default)]
pub struct Gradients<'a> {
    pub trans_grad: Option<&'a mut [f32]>,
    pub pred_grad: Option<&'a mut [f32]>,
}

impl<'a> Gradients<'a> {
    /// Requests no gradients (costs only).
    pub fn none() -> Self {
        Self::default()
    }

    /// Requests both gradients.
    pub fn both(trans_grad: &'a mut [f32], pred_grad: &'a mut [f32]) -> Self {
        Self {
            trans_grad: Some(trans_grad),
            pred_grad: Some(pred_grad),
        }
    }

    /// Returns true if any gradient output is present.
    pub fn any(&self) -> bool {
        self.trans_grad.is_some() || self.pred_grad.is_some()
    }

    pub(crate) fn validate(&self, max_t: usize, max_u: usize, row: usize) -> RnntResult<()> {
        if let Some(grad) = self.trans_grad.as_deref() {
            check_len("trans_grad", tensor_len(max_t, row)?, grad.len())?;
        }
        if let Some(grad) = self.pred_grad.as_deref() {
            check_len("pred_grad", tensor_len(max_u, row)?, grad.len())?;
        }
        Ok(())
    }
}

/// Validated lattice dimensions of one example.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExampleDims {
    /// Input frames `T`.
    pub t_len: usize,
    /// Lattice label positions `U = label_length + 1`.
    pub u_len: usize,
    /// Offset of the example's labels in the flat arena.
    pub label_offset: usize,
}

impl ExampleDims {
    /// Number of labels, `U - 1`.
    #[inline]
    pub fn label_len(&self) -> usize {
        self.u_len - 1
    }

    /// Number of lattice cells, `T * U`.
    #[inline]
    pub fn cells(&self) -> usize {
        self.t_len * self.u_len
    }
}

/// A validated minibatch: the label arena plus per-example dimensions.
#[derive(Debug, Clone)]
pub struct Batch<'a> {
    labels: &'a [i32],
    examples: Vec<ExampleDims>,
    pub alphabet_size: usize,
    pub blank: usize,
    pub max_t: usize,
    pub max_u: usize,
}

impl<'a> Batch<'a> {
    /// Validates `inputs` against `options`.
    ///
    /// # Errors
    ///
    /// Returns an error (all mapping to `InvalidValue`) if:
    /// - `minibatch` or `alphabet_size` is zero, or the options are invalid
    /// - a length array does not have `minibatch` entries
    /// - an input length is outside `1..=max_t`
    /// - a label length is negative or `label_length + 1 > max_u`
    /// - the label arena is shorter than the sum of label lengths
    /// - a label is outside `[0, alphabet_size)` or equals the blank
    /// - an activation tensor does not have the implied number of elements
    pub fn new(inputs: &LossInputs<'a>, options: &RnntOptions) -> RnntResult<Self> {
        let batch = Self::from_lengths(
            inputs.labels,
            inputs.label_lengths,
            inputs.input_lengths,
            inputs.alphabet_size,
            inputs.minibatch,
            options,
        )?;
        batch.check_activations(inputs.trans_acts.len(), inputs.pred_acts.len())?;
        Ok(batch)
    }

    /// Validates labels and lengths without looking at the activations.
    ///
    /// Used by the device path, where the activations are not host-visible.
    pub fn from_lengths(
        labels: &'a [i32],
        label_lengths: &[i32],
        input_lengths: &[i32],
        alphabet_size: usize,
        minibatch: usize,
        options: &RnntOptions,
    ) -> RnntResult<Self> {
        if minibatch == 0 {
            return Err(RnntError::invalid_dimension("minibatch must be > 0"));
        }
        if alphabet_size == 0 {
            return Err(RnntError::invalid_dimension("alphabet_size must be > 0"));
        }
        options.validate(alphabet_size)?;
        let (max_t, max_u, blank) = (options.max_t, options.max_u, options.blank_label);

        check_len("input_lengths", minibatch, input_lengths.len())?;
        check_len("label_lengths", minibatch, label_lengths.len())?;

        let mut examples = Vec::with_capacity(minibatch);
        let mut offset = 0usize;
        for b in 0..minibatch {
            let t_raw = input_lengths[b];
            let t_len = usize::try_from(t_raw).unwrap_or(0);
            if t_len == 0 || t_len > max_t {
                return Err(RnntError::invalid_length("input_lengths", b, t_raw.into(), max_t));
            }

            let l_raw = label_lengths[b];
            let label_len = usize::try_from(l_raw)
                .ok()
                .filter(|&l| l < max_u)
                .ok_or_else(|| {
                    RnntError::invalid_length("label_lengths", b, l_raw.into(), max_u - 1)
                })?;

            examples.push(ExampleDims {
                t_len,
                u_len: label_len + 1,
                label_offset: offset,
            });
            offset += label_len;
        }

        if labels.len() < offset {
            return Err(RnntError::shape_mismatch("labels", offset, labels.len()));
        }
        let labels = &labels[..offset];

        for (b, ex) in examples.iter().enumerate() {
            let seq = &labels[ex.label_offset..ex.label_offset + ex.label_len()];
            for (position, &label) in seq.iter().enumerate() {
                let valid = usize::try_from(label)
                    .map(|l| l < alphabet_size && l != blank)
                    .unwrap_or(false);
                if !valid {
                    return Err(RnntError::InvalidLabel {
                        example: b,
                        position,
                        label: label.into(),
                        alphabet_size,
                        blank,
                    });
                }
            }
        }

        Ok(Self {
            labels,
            examples,
            alphabet_size,
            blank,
            max_t,
            max_u,
        })
    }

    /// Checks activation element counts against `(max_t | max_u, minibatch, V)`.
    pub fn check_activations(&self, trans_len: usize, pred_len: usize) -> RnntResult<()> {
        let row = row_len(self.len(), self.alphabet_size)?;
        check_len("trans_acts", tensor_len(self.max_t, row)?, trans_len)?;
        check_len("pred_acts", tensor_len(self.max_u, row)?, pred_len)
    }

    /// Checks the cost buffer and any gradient tensors.
    pub fn check_outputs(&self, costs_len: usize, grads: &Gradients<'_>) -> RnntResult<()> {
        check_len("costs", self.len(), costs_len)?;
        grads.validate(self.max_t, self.max_u, row_len(self.len(), self.alphabet_size)?)
    }

    /// Number of examples.
    #[inline]
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Dimensions of every example, in batch order.
    #[inline]
    pub fn examples(&self) -> &[ExampleDims] {
        &self.examples
    }

    /// Label sequence of example `b`.
    pub fn labels(&self, b: usize) -> &'a [i32] {
        let ex = &self.examples[b];
        &self.labels[ex.label_offset..ex.label_offset + ex.label_len()]
    }

    /// The whole validated label arena.
    #[inline]
    pub fn label_arena(&self) -> &'a [i32] {
        self.labels
    }
}

pub(crate) fn row_len(minibatch: usize, alphabet_size: usize) -> RnntResult<usize> {
    minibatch
        .checked_mul(alphabet_size)
        .ok_or_else(|| RnntError::overflow("minibatch * alphabet_size"))
}

pub(crate) fn tensor_len(rows: usize, row: usize) -> RnntResult<usize> {
    rows.checked_mul(row)
        .ok_or_else(|| RnntError::overflow("activation tensor size"))
}

fn check_len(what: &'static str, expected: usize, got: usize) -> RnntResult<()> {
    if expected == got {
        Ok(())
    } else {
        Err(RnntError::shape_mismatch(what, expected, got))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs<'a>(
        trans: &'a [f32],
        pred: &'a [f32],
        labels: &'a [i32],
        label_lengths: &'a [i32],
        input_lengths: &'a [i32],
    ) -> LossInputs<'a> {
        LossInputs {
            trans_acts: trans,
            pred_acts: pred,
            labels,
            label_lengths,
            input_lengths,
            alphabet_size: 4,
            minibatch: 2,
        }
    }

    #[test]
    fn test_offsets_are_prefix_sums() {
        let trans = vec![0.0; 3 * 2 * 4];
        let pred = vec![0.0; 3 * 2 * 4];
        let labels = [1, 2, 3];
        let batch = Batch::new(
            &inputs(&trans, &pred, &labels, &[2, 1], &[3, 2]),
            &RnntOptions::cpu(3, 3, 1),
        )
        .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(
            batch.examples()[0],
            ExampleDims { t_len: 3, u_len: 3, label_offset: 0 }
        );
        assert_eq!(
            batch.examples()[1],
            ExampleDims { t_len: 2, u_len: 2, label_offset: 2 }
        );
        assert_eq!(batch.labels(0), &[1, 2]);
        assert_eq!(batch.labels(1), &[3]);
    }

    #[test]
    fn test_input_length_bounds() {
        let trans = vec![0.0; 3 * 2 * 4];
        let pred = vec![0.0; 2 * 2 * 4];
        let opts = RnntOptions::cpu(3, 2, 1);
        for bad in [[4, 1], [0, 1], [-1, 1]] {
            let err = Batch::new(&inputs(&trans, &pred, &[1, 1], &[1, 1], &bad), &opts).unwrap_err();
            assert!(matches!(err, RnntError::InvalidLength { what: "input_lengths", .. }));
        }
    }

    #[test]
    fn test_label_length_bounds() {
        let trans = vec![0.0; 3 * 2 * 4];
        let pred = vec![0.0; 2 * 2 * 4];
        let opts = RnntOptions::cpu(3, 2, 1);
        let err = Batch::new(&inputs(&trans, &pred, &[1, 1, 1], &[2, 1], &[3, 3]), &opts)
            .unwrap_err();
        assert!(matches!(
            err,
            RnntError::InvalidLength { what: "label_lengths", example: 0, .. }
        ));
    }

    #[test]
    fn test_blank_label_rejected() {
        let trans = vec![0.0; 3 * 2 * 4];
        let pred = vec![0.0; 2 * 2 * 4];
        let opts = RnntOptions::cpu(3, 2, 1).with_blank(2);
        let err = Batch::new(&inputs(&trans, &pred, &[1, 2], &[1, 1], &[3, 3]), &opts)
            .unwrap_err();
        assert!(matches!(
            err,
            RnntError::InvalidLabel { example: 1, position: 0, label: 2, .. }
        ));
    }

    #[test]
    fn test_out_of_range_label_rejected() {
        let trans = vec![0.0; 3 * 2 * 4];
        let pred = vec![0.0; 2 * 2 * 4];
        let opts = RnntOptions::cpu(3, 2, 1);
        for bad in [4, -3] {
            let labels = [1, bad];
            let err = Batch::new(&inputs(&trans, &pred, &labels, &[1, 1], &[3, 3]), &opts)
                .unwrap_err();
            assert!(matches!(err, RnntError::InvalidLabel { .. }));
        }
    }

    #[test]
    fn test_shape_mismatch() {
        let trans = vec![0.0; 3 * 2 * 4 - 1];
        let pred = vec![0.0; 2 * 2 * 4];
        let opts = RnntOptions::cpu(3, 2, 1);
        let err = Batch::new(&inputs(&trans, &pred, &[1, 1], &[1, 1], &[3, 3]), &opts)
            .unwrap_err();
        assert!(matches!(err, RnntError::ShapeMismatch { what: "trans_acts", .. }));
    }

    #[test]
    fn test_short_label_arena() {
        let trans = vec![0.0; 3 * 2 * 4];
        let pred = vec![0.0; 2 * 2 * 4];
        let opts = RnntOptions::cpu(3, 2, 1);
        let err = Batch::new(&inputs(&trans, &pred, &[1], &[1, 1], &[3, 3]), &opts).unwrap_err();
        assert!(matches!(err, RnntError::ShapeMismatch { what: "labels", .. }));
    }

    #[test]
    fn test_empty_label_sequence() {
        let trans = vec![0.0; 2 * 2 * 4];
        let pred = vec![0.0; 2 * 4];
        let batch = Batch::new(
            &inputs(&trans, &pred, &[], &[0, 0], &[2, 1]),
            &RnntOptions::cpu(2, 1, 1),
        )
        .unwrap();
        assert_eq!(batch.examples()[1].u_len, 1);
        assert!(batch.labels(1).is_empty());
    }
}
