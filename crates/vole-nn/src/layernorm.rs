// LayerNorm — Layer Normalization
//
// Normalizes activations within each sample over the last dimension:
//
//   y = (x - mean(x)) / sqrt(var(x) + ε) * γ + β
//
// mean/var are computed per block of `normalized_size` consecutive values;
// γ and β are learnable. LayerNorm wraps every transformer sub-layer here
// (pre-norm style), so its backward has to be exact:
//
//   dγ[j] += Σ_blocks g * norm        dβ[j] += Σ_blocks g
//   dX = γ * invStd * (N*g - Σg - norm * Σ(g*norm)) / N   per block

use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;

use crate::layer::{Layer, Param};

struct LayerNormCache {
    input_shape: vole_core::Shape,
    /// Per-block mean and variance.
    mean: Vec<f64>,
    var: Vec<f64>,
    /// Normalized values (x - mean) * invStd, same size as the input.
    norm: Vec<f64>,
}

/// Layer Normalization over the last dimension.
///
/// # Example
/// ```ignore
/// let mut ln = LayerNorm::new(512, 1e-5)?;
/// let y = ln.forward(&x)?; // same shape, normalized per position
/// ```
pub struct LayerNorm {
    /// Learnable scale γ: [normalized_size], initialized to ones.
    gamma: Tensor,
    /// Learnable shift β: [normalized_size], initialized to zeros.
    beta: Tensor,
    d_gamma: Tensor,
    d_beta: Tensor,
    normalized_size: usize,
    eps: f64,
    cache: Option<LayerNormCache>,
}

impl LayerNorm {
    /// Create a new LayerNorm layer.
    ///
    /// # Arguments
    /// - `normalized_size`: size of the last dimension to normalize (> 0)
    /// - `eps`: numerical stability constant (typically 1e-5)
    pub fn new(normalized_size: usize, eps: f64) -> Result<Self> {
        if normalized_size == 0 {
            return Err(Error::config("LayerNorm: normalized_size must be > 0"));
        }
        Ok(LayerNorm {
            gamma: Tensor::ones(normalized_size),
            beta: Tensor::zeros(normalized_size),
            d_gamma: Tensor::zeros(normalized_size),
            d_beta: Tensor::zeros(normalized_size),
            normalized_size,
            eps,
            cache: None,
        })
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    pub fn normalized_size(&self) -> usize {
        self.normalized_size
    }

    fn block_count(&self, t: &Tensor) -> Result<usize> {
        let rank = t.rank();
        if rank == 0 || t.dims()[rank - 1] != self.normalized_size {
            return Err(Error::ShapeMismatch {
                expected: vole_core::Shape::from(self.normalized_size),
                got: t.shape().clone(),
            });
        }
        Ok(t.elem_count() / self.normalized_size)
    }
}

impl Layer for LayerNorm {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let blocks = self.block_count(input)?;
        let n = self.normalized_size;

        let mut out = Tensor::zeros(input.shape().clone());
        let mut mean = vec![0.0; blocks];
        let mut var = vec![0.0; blocks];
        let mut norm = vec![0.0; input.elem_count()];

        let x = input.data();
        let g = self.gamma.data();
        let bt = self.beta.data();
        let o = out.data_mut();

        for b in 0..blocks {
            let start = b * n;

            let mut mu = 0.0;
            for j in 0..n {
                mu += x[start + j];
            }
            mu /= n as f64;
            mean[b] = mu;

            let mut v = 0.0;
            for j in 0..n {
                let d = x[start + j] - mu;
                v += d * d;
            }
            v /= n as f64;
            var[b] = v;

            let inv_std = 1.0 / (v + self.eps).sqrt();
            for j in 0..n {
                let nm = (x[start + j] - mu) * inv_std;
                norm[start + j] = nm;
                o[start + j] = nm * g[j] + bt[j];
            }
        }

        self.cache = Some(LayerNormCache {
            input_shape: input.shape().clone(),
            mean,
            var,
            norm,
        });
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let cache = self
            .cache
            .take()
            .ok_or(Error::MissingState { layer: "LayerNorm" })?;
        if grad_out.shape() != &cache.input_shape {
            return Err(Error::ShapeMismatch {
                expected: cache.input_shape.clone(),
                got: grad_out.shape().clone(),
            });
        }
        let n = self.normalized_size;
        let blocks = cache.mean.len();

        self.d_gamma.zero();
        self.d_beta.zero();
        let mut grad_in = Tensor::zeros(cache.input_shape.clone());

        let g = grad_out.data();
        let gamma = self.gamma.data();
        let dg = self.d_gamma.data_mut();
        let db = self.d_beta.data_mut();
        let gi = grad_in.data_mut();

        for b in 0..blocks {
            let start = b * n;
            let inv_std = 1.0 / (cache.var[b] + self.eps).sqrt();

            let mut sum_g = 0.0;
            let mut sum_g_norm = 0.0;
            for j in 0..n {
                let go = g[start + j];
                let nm = cache.norm[start + j];
                dg[j] += go * nm;
                db[j] += go;
                sum_g += go;
                sum_g_norm += go * nm;
            }

            for j in 0..n {
                let go = g[start + j];
                let nm = cache.norm[start + j];
                let term = (go * n as f64 - sum_g - nm * sum_g_norm) / n as f64;
                gi[start + j] = gamma[j] * inv_std * term;
            }
        }
        Ok(grad_in)
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                value: &mut self.gamma,
                grad: &self.d_gamma,
            },
            Param {
                value: &mut self.beta,
                grad: &self.d_beta,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_normalizes() {
        let mut ln = LayerNorm::new(4, 1e-5).unwrap();
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], (1, 4)).unwrap();
        let y = ln.forward(&x).unwrap();
        let mean: f64 = y.data().iter().sum::<f64>() / 4.0;
        assert!(mean.abs() < 1e-10);
        let var: f64 = y.data().iter().map(|v| v * v).sum::<f64>() / 4.0;
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_wrong_last_dim_fails() {
        let mut ln = LayerNorm::new(4, 1e-5).unwrap();
        assert!(ln.forward(&Tensor::zeros((2, 3))).is_err());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(LayerNorm::new(0, 1e-5).is_err());
    }
}
