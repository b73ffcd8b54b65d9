// Adam — adaptive moment estimation
//
// The standard update rule, applied element-wise to every parameter:
//
//   m = β1·m + (1-β1)·g             first moment (mean of gradients)
//   v = β2·v + (1-β2)·g²            second moment (uncentered variance)
//   m̂ = m / (1 - β1^t)              bias correction
//   v̂ = v / (1 - β2^t)
//   p -= lr · m̂ / (sqrt(v̂) + ε)
//
// The optimizer is agnostic to what the parameters mean: it consumes
// opaque (parameter, gradient) pairs and mutates the parameters in place.

use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;
use vole_nn::layer::Param;

/// Adam optimizer over [`Param`] pairs.
///
/// Moment buffers are created lazily on the first `step` call to match the
/// parameter list; the list's length and shapes must stay stable across
/// steps.
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    /// Timestep, incremented per `step`; drives bias correction.
    t: u32,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
}

impl Adam {
    /// Create an Adam optimizer with explicit hyperparameters.
    pub fn new(lr: f64, beta1: f64, beta2: f64, eps: f64) -> Self {
        Adam {
            lr,
            beta1,
            beta2,
            eps,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// The conventional defaults: β1 = 0.9, β2 = 0.999, ε = 1e-8.
    pub fn with_defaults(lr: f64) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8)
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    /// Apply one update to every parameter/gradient pair.
    pub fn step(&mut self, mut params: Vec<Param<'_>>) -> Result<()> {
        if self.m.is_empty() {
            self.m = params
                .iter()
                .map(|p| Tensor::zeros(p.value.shape().clone()))
                .collect();
            self.v = self.m.clone();
        }
        if params.len() != self.m.len() {
            return Err(Error::Msg(format!(
                "Adam: parameter list changed length ({} vs {})",
                params.len(),
                self.m.len()
            )));
        }

        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t as i32);
        let bias2 = 1.0 - self.beta2.powi(self.t as i32);

        for (i, param) in params.iter_mut().enumerate() {
            if param.value.elem_count() != self.m[i].elem_count() {
                return Err(Error::ShapeMismatch {
                    expected: self.m[i].shape().clone(),
                    got: param.value.shape().clone(),
                });
            }
            let g = param.grad.data();
            let m = self.m[i].data_mut();
            let v = self.v[i].data_mut();
            let p = param.value.data_mut();

            for j in 0..p.len() {
                let grad = g[j];
                m[j] = self.beta1 * m[j] + (1.0 - self.beta1) * grad;
                v[j] = self.beta2 * v[j] + (1.0 - self.beta2) * grad * grad;
                let m_hat = m[j] / bias1;
                let v_hat = v[j] / bias2;
                p[j] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quadratic {
        w: Tensor,
        dw: Tensor,
    }

    impl Quadratic {
        fn grads(&mut self) {
            // d/dw of 0.5 * w² is w
            self.dw = self.w.clone();
        }

        fn params(&mut self) -> Vec<Param<'_>> {
            vec![Param {
                value: &mut self.w,
                grad: &self.dw,
            }]
        }
    }

    #[test]
    fn test_adam_minimizes_quadratic() {
        let mut q = Quadratic {
            w: Tensor::from_vec(vec![5.0, -3.0], (2,)).unwrap(),
            dw: Tensor::zeros(2),
        };
        let mut adam = Adam::with_defaults(0.1);
        for _ in 0..200 {
            q.grads();
            adam.step(q.params()).unwrap();
        }
        for &w in q.w.data() {
            assert!(w.abs() < 0.1, "did not converge: {}", w);
        }
    }

    #[test]
    fn test_first_step_magnitude() {
        // With bias correction, the very first step is ≈ lr regardless of
        // the gradient's scale.
        let mut q = Quadratic {
            w: Tensor::from_vec(vec![100.0], (1,)).unwrap(),
            dw: Tensor::zeros(1),
        };
        q.grads();
        let mut adam = Adam::with_defaults(0.01);
        let before = q.w.data()[0];
        adam.step(q.params()).unwrap();
        let delta = before - q.w.data()[0];
        assert!((delta - 0.01).abs() < 1e-6, "first step was {}", delta);
    }

    #[test]
    fn test_changed_param_list_rejected() {
        let mut q = Quadratic {
            w: Tensor::zeros(2),
            dw: Tensor::zeros(2),
        };
        let mut adam = Adam::with_defaults(0.01);
        adam.step(q.params()).unwrap();
        assert!(adam.step(Vec::new()).is_err());
    }
}
