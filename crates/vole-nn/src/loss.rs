// CrossEntropyLoss — softmax + negative log-likelihood in one step
//
// Consumes raw logits [batch, classes] and integer class indices, and
// returns the mean NLL as a scalar tensor. Working on logits (rather than
// probabilities) allows the numerically-stable log-sum-exp formulation:
//
//   loss_row = logsumexp(logits) - logits[target]
//   logsumexp(x) = max(x) + ln(Σ exp(x - max(x)))
//
// and gives the famously clean gradient:
//
//   dL/dlogits = (softmax(logits) - onehot(target)) / batch

use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;

use crate::activation::softmax_row;

/// Cross-entropy loss over logits and integer class targets.
#[derive(Default)]
pub struct CrossEntropyLoss {
    cache: Option<(Tensor, Vec<usize>)>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the mean negative log-likelihood.
    ///
    /// - `logits`: `[batch, classes]` raw scores (not softmax-ed)
    /// - `targets`: one class index per batch row, each `< classes`
    ///
    /// Returns a `[1]` scalar tensor.
    pub fn forward(&mut self, logits: &Tensor, targets: &[usize]) -> Result<Tensor> {
        if logits.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: logits.rank(),
            });
        }
        let (batch, classes) = (logits.dims()[0], logits.dims()[1]);
        if targets.len() != batch {
            return Err(Error::Msg(format!(
                "CrossEntropyLoss: {} targets for batch of {}",
                targets.len(),
                batch
            )));
        }
        if let Some(&bad) = targets.iter().find(|&&t| t >= classes) {
            return Err(Error::Msg(format!(
                "CrossEntropyLoss: target class {} out of range for {} classes",
                bad, classes
            )));
        }

        let x = logits.data();
        let mut loss_sum = 0.0;
        for (i, &target) in targets.iter().enumerate() {
            let row = &x[i * classes..(i + 1) * classes];
            let max_val = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let sum_exp: f64 = row.iter().map(|v| (v - max_val).exp()).sum();
            let log_sum_exp = sum_exp.ln() + max_val;
            loss_sum += log_sum_exp - row[target];
        }

        self.cache = Some((logits.clone(), targets.to_vec()));
        Tensor::from_vec(vec![loss_sum / batch as f64], (1,))
    }

    /// Gradient of the mean loss w.r.t. the logits:
    /// `(softmax(logits) - onehot(target)) / batch`.
    pub fn backward(&mut self) -> Result<Tensor> {
        let (logits, targets) = self.cache.take().ok_or(Error::MissingState {
            layer: "CrossEntropyLoss",
        })?;
        let (batch, classes) = (logits.dims()[0], logits.dims()[1]);

        let mut grad = logits.clone();
        for (i, row) in grad.data_mut().chunks_mut(classes).enumerate() {
            softmax_row(row);
            row[targets[i]] -= 1.0;
            for v in row.iter_mut() {
                *v /= batch as f64;
            }
        }
        Ok(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_logits_loss_is_ln_classes() {
        // All-zero logits over 3 classes: loss = ln(3) regardless of target
        let mut loss = CrossEntropyLoss::new();
        let logits = Tensor::zeros((1, 3));
        let l = loss.forward(&logits, &[0]).unwrap();
        assert!((l.data()[0] - 3.0_f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_backward_sums_to_zero_per_row() {
        let mut loss = CrossEntropyLoss::new();
        let logits = Tensor::from_vec(vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0], (2, 3)).unwrap();
        loss.forward(&logits, &[2, 0]).unwrap();
        let g = loss.backward().unwrap();
        // softmax sums to 1, onehot sums to 1 → each row's gradient sums to 0
        for row in g.data().chunks(3) {
            assert!(row.iter().sum::<f64>().abs() < 1e-12);
        }
    }

    #[test]
    fn test_target_out_of_range_rejected() {
        let mut loss = CrossEntropyLoss::new();
        let logits = Tensor::zeros((1, 3));
        assert!(loss.forward(&logits, &[3]).is_err());
        assert!(loss.forward(&logits, &[0, 1]).is_err());
    }
}
