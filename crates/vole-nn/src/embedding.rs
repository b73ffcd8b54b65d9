// Embedding — token lookup table
//
// Maps integer token ids to learned vectors. Forward is a row copy from the
// [vocab, embed] weight; backward scatter-adds the output gradient into the
// rows that were looked up. There is no gradient with respect to the input
// (token ids are not differentiable), so Embedding does not implement the
// Layer trait — its backward returns (), not a sentinel gradient.

use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;

use crate::init;
use crate::layer::Param;

/// Learned token embedding table.
pub struct Embedding {
    vocab_size: usize,
    embed_dim: usize,
    /// Lookup table: [vocab, embed]
    weight: Tensor,
    d_weight: Tensor,
    last_indices: Option<Vec<usize>>,
}

impl Embedding {
    pub fn new(vocab_size: usize, embed_dim: usize) -> Result<Self> {
        if vocab_size == 0 || embed_dim == 0 {
            return Err(Error::config("Embedding: dims must be > 0"));
        }
        Ok(Embedding {
            weight: init::scaled_uniform((vocab_size, embed_dim), vocab_size),
            d_weight: Tensor::zeros((vocab_size, embed_dim)),
            vocab_size,
            embed_dim,
            last_indices: None,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Look up every token id in `indices` (values must be non-negative
    /// integers below `vocab_size`). Output shape is the input shape with
    /// `embed_dim` appended.
    pub fn forward(&mut self, indices: &Tensor) -> Result<Tensor> {
        let mut tokens = Vec::with_capacity(indices.elem_count());
        for &raw in indices.data() {
            let token = raw as usize;
            if raw < 0.0 || raw.fract() != 0.0 || token >= self.vocab_size {
                vole_core::bail!(
                    "Embedding: token id {} out of range for vocab of {}",
                    raw,
                    self.vocab_size
                );
            }
            tokens.push(token);
        }

        let mut out_dims = indices.dims().to_vec();
        out_dims.push(self.embed_dim);
        let mut out = Tensor::zeros(out_dims);

        let w = self.weight.data();
        let o = out.data_mut();
        for (j, &token) in tokens.iter().enumerate() {
            let base_out = j * self.embed_dim;
            let base_w = token * self.embed_dim;
            o[base_out..base_out + self.embed_dim]
                .copy_from_slice(&w[base_w..base_w + self.embed_dim]);
        }

        self.last_indices = Some(tokens);
        Ok(out)
    }

    /// Scatter-add the output gradient into `dW` rows. Token ids have no
    /// input gradient, so there is nothing to return.
    pub fn backward(&mut self, grad_out: &Tensor) -> Result<()> {
        let tokens = self
            .last_indices
            .take()
            .ok_or(Error::MissingState { layer: "Embedding" })?;
        if grad_out.elem_count() != tokens.len() * self.embed_dim {
            return Err(Error::Msg(format!(
                "Embedding: gradient shape {} does not match {} cached lookups",
                grad_out.shape(),
                tokens.len()
            )));
        }

        self.d_weight.zero();
        let g = grad_out.data();
        let dw = self.d_weight.data_mut();
        for (j, &token) in tokens.iter().enumerate() {
            let base_g = j * self.embed_dim;
            let base_w = token * self.embed_dim;
            for k in 0..self.embed_dim {
                dw[base_w + k] += g[base_g + k];
            }
        }
        Ok(())
    }

    /// Parameter/gradient pair for the optimizer.
    pub fn parameters(&mut self) -> Vec<Param<'_>> {
        vec![Param {
            value: &mut self.weight,
            grad: &self.d_weight,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_shape() {
        let mut emb = Embedding::new(10, 4).unwrap();
        let idx = Tensor::from_vec(vec![1.0, 3.0, 1.0, 0.0, 2.0, 9.0], (2, 3)).unwrap();
        let y = emb.forward(&idx).unwrap();
        assert_eq!(y.dims(), &[2, 3, 4]);
    }

    #[test]
    fn test_out_of_range_token_rejected() {
        let mut emb = Embedding::new(4, 2).unwrap();
        let idx = Tensor::from_vec(vec![4.0], (1,)).unwrap();
        assert!(emb.forward(&idx).is_err());
        let idx = Tensor::from_vec(vec![1.5], (1,)).unwrap();
        assert!(emb.forward(&idx).is_err());
    }

    #[test]
    fn test_repeated_token_accumulates_gradient() {
        let mut emb = Embedding::new(4, 2).unwrap();
        let idx = Tensor::from_vec(vec![1.0, 1.0], (2,)).unwrap();
        emb.forward(&idx).unwrap();
        let g = Tensor::ones((2, 2));
        emb.backward(&g).unwrap();
        // Token 1 was looked up twice → its row accumulates both gradients
        assert_eq!(&emb.d_weight.data()[2..4], &[2.0, 2.0]);
        assert_eq!(&emb.d_weight.data()[0..2], &[0.0, 0.0]);
    }
}
