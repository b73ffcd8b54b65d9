// PositionalEncoding — fixed sinusoidal position signal
//
// Attention is permutation-invariant, so token order has to be injected
// explicitly. The classic fixed encoding:
//
//   angle(pos, i) = pos / 10000^(2*(i/2)/dim)
//   pe[pos, i] = sin(angle)  for even i,  cos(angle)  for odd i
//
// The table is precomputed once for max_len positions; forward adds the
// first `seq` rows to every batch element. The addition has derivative 1,
// so backward passes the gradient through unchanged.

use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;

use crate::layer::Layer;

/// Precomputed sinusoidal positional encoding.
pub struct PositionalEncoding {
    max_len: usize,
    dim: usize,
    /// [max_len, dim]
    encoding: Tensor,
}

impl PositionalEncoding {
    pub fn new(max_len: usize, dim: usize) -> Result<Self> {
        if max_len == 0 || dim == 0 {
            return Err(Error::config("PositionalEncoding: dims must be > 0"));
        }
        let mut encoding = Tensor::zeros((max_len, dim));
        let data = encoding.data_mut();
        for pos in 0..max_len {
            for i in 0..dim {
                let angle = pos as f64 / 10000f64.powf((2 * (i / 2)) as f64 / dim as f64);
                data[pos * dim + i] = if i % 2 == 0 { angle.sin() } else { angle.cos() };
            }
        }
        Ok(PositionalEncoding {
            max_len,
            dim,
            encoding,
        })
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl Layer for PositionalEncoding {
    /// Add the position signal to `[batch, seq, dim]`.
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        if input.rank() != 3 {
            return Err(Error::RankMismatch {
                expected: 3,
                got: input.rank(),
            });
        }
        let (batch, seq, dim) = (input.dims()[0], input.dims()[1], input.dims()[2]);
        if dim != self.dim {
            vole_core::bail!(
                "PositionalEncoding: expected dim {}, got input shape {}",
                self.dim,
                input.shape()
            );
        }
        if seq > self.max_len {
            vole_core::bail!(
                "PositionalEncoding: sequence length {} exceeds max_len {}",
                seq,
                self.max_len
            );
        }

        let mut out = input.clone();
        let pe = self.encoding.data();
        let o = out.data_mut();
        for b in 0..batch {
            for t in 0..seq {
                for k in 0..dim {
                    o[(b * seq + t) * dim + k] += pe[t * dim + k];
                }
            }
        }
        Ok(out)
    }

    /// The encoding is an additive constant; gradient passes through.
    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        Ok(grad_out.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_zero_pattern() {
        // pos 0: sin(0) = 0 on even indices, cos(0) = 1 on odd indices
        let pe = PositionalEncoding::new(4, 6).unwrap();
        let row = &pe.encoding.data()[..6];
        assert_eq!(row, &[0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_too_long_sequence_rejected() {
        let mut pe = PositionalEncoding::new(4, 2).unwrap();
        assert!(pe.forward(&Tensor::zeros((1, 5, 2))).is_err());
    }

    #[test]
    fn test_backward_is_identity() {
        let mut pe = PositionalEncoding::new(8, 2).unwrap();
        pe.forward(&Tensor::zeros((1, 3, 2))).unwrap();
        let g = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (1, 3, 2)).unwrap();
        let back = pe.backward(&g).unwrap();
        assert_eq!(back.data(), g.data());
    }
}
