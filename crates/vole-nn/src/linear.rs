// Linear — Fully-connected (dense) layer
//
// y = x @ W^T + b, applied to the last dimension of any input [..., in].
// Leading dimensions are flattened into rows, so the same layer serves 2-D
// batches and [batch, seq, features] sequence tensors alike.
//
// PARAMETER SHAPES:
//
//   weight: [out_features, in_features]
//   bias:   [out_features]
//
// Backward (per row, accumulated over every row):
//   db[j]   += g[j]
//   dW[j,k] += g[j] * x[k]
//   dx[k]    = Σ_j g[j] * W[j,k]

use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;

use crate::init;
use crate::layer::{Layer, Param};

/// A fully-connected layer: `y = x W^T + b`.
///
/// # Examples
/// ```ignore
/// let mut linear = Linear::new(784, 128);
/// let y = linear.forward(&x)?; // [batch, 128]
/// let dx = linear.backward(&dy)?;
/// ```
pub struct Linear {
    /// Weight matrix: [out_features, in_features]
    weight: Tensor,
    /// Bias vector: [out_features]
    bias: Tensor,
    /// Gradient accumulators, same shapes as the parameters.
    d_weight: Tensor,
    d_bias: Tensor,
    in_features: usize,
    out_features: usize,
    last_input: Option<Tensor>,
}

impl Linear {
    /// Create a new Linear layer with U(-k, k), k = 1/sqrt(in_features)
    /// weight initialization and zero bias.
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Linear {
            weight: init::scaled_uniform((out_features, in_features), in_features),
            bias: Tensor::zeros(out_features),
            d_weight: Tensor::zeros((out_features, in_features)),
            d_bias: Tensor::zeros(out_features),
            in_features,
            out_features,
            last_input: None,
        }
    }

    /// Create a Linear layer from existing weight and bias tensors.
    /// Useful for tests and for loading known parameters.
    pub fn from_tensors(weight: Tensor, bias: Tensor) -> Result<Self> {
        let dims = weight.dims();
        if weight.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: weight.rank(),
            });
        }
        let (out_features, in_features) = (dims[0], dims[1]);
        if bias.elem_count() != out_features {
            return Err(Error::ShapeMismatch {
                expected: vole_core::Shape::from(out_features),
                got: bias.shape().clone(),
            });
        }
        Ok(Linear {
            d_weight: Tensor::zeros((out_features, in_features)),
            d_bias: Tensor::zeros(out_features),
            weight,
            bias,
            in_features,
            out_features,
            last_input: None,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    pub fn d_weight(&self) -> &Tensor {
        &self.d_weight
    }

    pub fn d_bias(&self) -> &Tensor {
        &self.d_bias
    }

    fn check_last_dim(&self, t: &Tensor, expected: usize) -> Result<usize> {
        let rank = t.rank();
        if rank == 0 || t.dims()[rank - 1] != expected {
            return Err(Error::ShapeMismatch {
                expected: vole_core::Shape::from(expected),
                got: t.shape().clone(),
            });
        }
        Ok(t.elem_count() / expected)
    }
}

impl Layer for Linear {
    /// Forward pass over input `[..., in_features]` → `[..., out_features]`.
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let rows = self.check_last_dim(input, self.in_features)?;
        self.last_input = Some(input.clone());

        let mut out_dims = input.dims().to_vec();
        let last = out_dims.len() - 1;
        out_dims[last] = self.out_features;
        let mut out = Tensor::zeros(out_dims);

        let x = input.data();
        let w = self.weight.data();
        let b = self.bias.data();
        let o = out.data_mut();
        let (in_f, out_f) = (self.in_features, self.out_features);

        for r in 0..rows {
            let base_x = r * in_f;
            let base_o = r * out_f;
            for j in 0..out_f {
                let mut sum = b[j];
                for k in 0..in_f {
                    sum += w[j * in_f + k] * x[base_x + k];
                }
                o[base_o + j] = sum;
            }
        }
        Ok(out)
    }

    /// Backward pass: zero and re-accumulate `dW`/`dB`, return `dX`.
    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let x = self
            .last_input
            .take()
            .ok_or(Error::MissingState { layer: "Linear" })?;
        let rows = self.check_last_dim(grad_out, self.out_features)?;
        if rows * self.in_features != x.elem_count() {
            return Err(Error::ShapeMismatch {
                expected: x.shape().clone(),
                got: grad_out.shape().clone(),
            });
        }

        self.d_weight.zero();
        self.d_bias.zero();
        let mut grad_in = Tensor::zeros(x.shape().clone());

        let xs = x.data();
        let w = self.weight.data();
        let g = grad_out.data();
        let dw = self.d_weight.data_mut();
        let db = self.d_bias.data_mut();
        let gi = grad_in.data_mut();
        let (in_f, out_f) = (self.in_features, self.out_features);

        for r in 0..rows {
            let base_x = r * in_f;
            let base_g = r * out_f;
            for j in 0..out_f {
                let gj = g[base_g + j];
                db[j] += gj;
                for k in 0..in_f {
                    dw[j * in_f + k] += gj * xs[base_x + k];
                    gi[base_x + k] += gj * w[j * in_f + k];
                }
            }
        }
        Ok(grad_in)
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                value: &mut self.weight,
                grad: &self.d_weight,
            },
            Param {
                value: &mut self.bias,
                grad: &self.d_bias,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_weight_forward_backward() {
        // weight [[1,0],[0,1],[1,1]], zero bias, input [[1,2]] → [[1,2,3]]
        let w = Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], (3, 2)).unwrap();
        let b = Tensor::zeros(3);
        let mut linear = Linear::from_tensors(w, b).unwrap();

        let x = Tensor::from_vec(vec![1.0, 2.0], (1, 2)).unwrap();
        let y = linear.forward(&x).unwrap();
        assert_eq!(y.data(), &[1.0, 2.0, 3.0]);

        let dy = Tensor::ones((1, 3));
        let dx = linear.backward(&dy).unwrap();
        assert_eq!(dx.data(), &[2.0, 2.0]);
        assert_eq!(
            linear.d_weight().data(),
            &[1.0, 2.0, 1.0, 2.0, 1.0, 2.0]
        );
        assert_eq!(linear.d_bias().data(), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_forward_3d_input() {
        let mut linear = Linear::new(4, 2);
        let x = Tensor::zeros((2, 5, 4));
        let y = linear.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 5, 2]);
    }

    #[test]
    fn test_wrong_last_dim_fails() {
        let mut linear = Linear::new(4, 2);
        let x = Tensor::zeros((2, 3));
        assert!(linear.forward(&x).is_err());
    }
}
