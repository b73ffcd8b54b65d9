// Transformer — encoder block, decoder block, and the full
// encoder/decoder model
//
// BLOCK ARCHITECTURE (pre-norm residual style):
//
//   encoder block:  x = x + SelfAttention(LayerNorm1(x))
//                   x = x + FeedForward(LayerNorm2(x))
//
//   decoder block:  x = x + MaskedSelfAttention(LayerNorm1(x))
//                   x = x + CrossAttention(LayerNorm2(x), encoder_out)
//                   x = x + FeedForward(LayerNorm3(x))
//
// GRADIENT ROUTING:
//
// Each residual sum splits the incoming gradient into two branches: the
// skip path receives it unchanged, the sub-layer path receives it through
// the sub-layer's backward, and the two are summed — in the exact reverse
// order of the forward stages. A decoder block additionally surfaces the
// gradient flowing into the encoder output (from its cross-attention
// key/value source); the model sums that contribution over all decoder
// blocks before walking the encoder stack backward.

use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;

use crate::activation::ReLU;
use crate::attention::MultiHeadAttention;
use crate::embedding::Embedding;
use crate::feedforward::FeedForward;
use crate::layer::{Layer, Param};
use crate::layernorm::LayerNorm;
use crate::linear::Linear;
use crate::loss::CrossEntropyLoss;
use crate::positional::PositionalEncoding;

const LAYER_NORM_EPS: f64 = 1e-5;

// TransformerEncoder

/// One transformer encoder block (pre-norm, ReLU feed-forward).
pub struct TransformerEncoder {
    ln1: LayerNorm,
    attn: MultiHeadAttention,
    ln2: LayerNorm,
    ff: FeedForward,
}

impl TransformerEncoder {
    /// # Arguments
    /// - `embed_dim`: model dimension (must be divisible by `num_heads`)
    /// - `num_heads`: attention heads
    /// - `ff_hidden_dim`: feed-forward inner dimension (typically 4×)
    pub fn new(embed_dim: usize, num_heads: usize, ff_hidden_dim: usize) -> Result<Self> {
        Ok(TransformerEncoder {
            ln1: LayerNorm::new(embed_dim, LAYER_NORM_EPS)?,
            attn: MultiHeadAttention::new(embed_dim, num_heads)?,
            ln2: LayerNorm::new(embed_dim, LAYER_NORM_EPS)?,
            ff: FeedForward::new(embed_dim, ff_hidden_dim, embed_dim, ReLU::new()),
        })
    }
}

impl Layer for TransformerEncoder {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        // Sub-layer 1: self-attention with residual
        let normed = self.ln1.forward(input)?;
        let attn_out = self.attn.forward(&normed)?;
        let after_attn = input.add(&attn_out)?;

        // Sub-layer 2: feed-forward with residual
        let normed = self.ln2.forward(&after_attn)?;
        let ff_out = self.ff.forward(&normed)?;
        after_attn.add(&ff_out)
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        // Reverse of sub-layer 2: skip path + ff branch
        let d_ff = self.ff.backward(grad_out)?;
        let d_norm2 = self.ln2.backward(&d_ff)?;
        let d_after_attn = grad_out.add(&d_norm2)?;

        // Reverse of sub-layer 1: skip path + attention branch
        let d_attn = self.attn.backward(&d_after_attn)?;
        let d_norm1 = self.ln1.backward(&d_attn)?;
        d_after_attn.add(&d_norm1)
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        let mut params = self.ln1.parameters();
        params.extend(self.attn.parameters());
        params.extend(self.ln2.parameters());
        params.extend(self.ff.parameters());
        params
    }
}

// TransformerDecoder

/// One transformer decoder block: masked self-attention, cross-attention to
/// the encoder output, then feed-forward — each pre-normed with a residual.
///
/// Not a [`Layer`]: forward takes two inputs, and backward hands back the
/// encoder-side gradient alongside the input gradient.
pub struct TransformerDecoder {
    ln1: LayerNorm,
    self_attn: MultiHeadAttention,
    ln2: LayerNorm,
    cross_attn: MultiHeadAttention,
    ln3: LayerNorm,
    ff: FeedForward,
}

impl TransformerDecoder {
    pub fn new(embed_dim: usize, num_heads: usize, ff_hidden_dim: usize) -> Result<Self> {
        Ok(TransformerDecoder {
            ln1: LayerNorm::new(embed_dim, LAYER_NORM_EPS)?,
            self_attn: MultiHeadAttention::new(embed_dim, num_heads)?.with_causal(true),
            ln2: LayerNorm::new(embed_dim, LAYER_NORM_EPS)?,
            cross_attn: MultiHeadAttention::new(embed_dim, num_heads)?,
            ln3: LayerNorm::new(embed_dim, LAYER_NORM_EPS)?,
            ff: FeedForward::new(embed_dim, ff_hidden_dim, embed_dim, ReLU::new()),
        })
    }

    /// Forward pass: `x` is the decoder-side sequence, `encoder_out` the
    /// encoder stack's output the cross-attention attends to.
    pub fn forward(&mut self, x: &Tensor, encoder_out: &Tensor) -> Result<Tensor> {
        // 1) Masked self-attention
        let normed = self.ln1.forward(x)?;
        let self_out = self.self_attn.forward(&normed)?;
        let after_self = x.add(&self_out)?;

        // 2) Cross-attention: queries from the decoder, keys/values from
        //    the encoder output
        let normed = self.ln2.forward(&after_self)?;
        let cross_out = self.cross_attn.forward_cross(&normed, encoder_out)?;
        let after_cross = after_self.add(&cross_out)?;

        // 3) Feed-forward
        let normed = self.ln3.forward(&after_cross)?;
        let ff_out = self.ff.forward(&normed)?;
        after_cross.add(&ff_out)
    }

    /// Backward pass. Returns `(d_x, d_encoder)`: the gradient w.r.t. the
    /// block input and the gradient flowing back into the encoder output.
    pub fn backward(&mut self, grad_out: &Tensor) -> Result<(Tensor, Tensor)> {
        // Reverse of 3) feed-forward residual
        let d_ff = self.ff.backward(grad_out)?;
        let d_norm3 = self.ln3.backward(&d_ff)?;
        let d_after_cross = grad_out.add(&d_norm3)?;

        // Reverse of 2) cross-attention residual; the key/value-side
        // gradient belongs to the encoder output
        let (d_query, d_encoder) = self.cross_attn.backward_cross(&d_after_cross)?;
        let d_norm2 = self.ln2.backward(&d_query)?;
        let d_after_self = d_after_cross.add(&d_norm2)?;

        // Reverse of 1) masked self-attention residual
        let d_self = self.self_attn.backward(&d_after_self)?;
        let d_norm1 = self.ln1.backward(&d_self)?;
        let d_x = d_after_self.add(&d_norm1)?;

        Ok((d_x, d_encoder))
    }

    pub fn parameters(&mut self) -> Vec<Param<'_>> {
        let mut params = self.ln1.parameters();
        params.extend(self.self_attn.parameters());
        params.extend(self.ln2.parameters());
        params.extend(self.cross_attn.parameters());
        params.extend(self.ln3.parameters());
        params.extend(self.ff.parameters());
        params
    }
}

// TransformerModel

/// Full encoder/decoder transformer for sequence-to-sequence training.
///
/// Source and target paths use separate embedding tables: the two forward
/// lookups would otherwise overwrite each other's cached indices before
/// backward gets to read them.
pub struct TransformerModel {
    src_embed: Embedding,
    tgt_embed: Embedding,
    pos_enc: PositionalEncoding,
    encoder_blocks: Vec<TransformerEncoder>,
    decoder_blocks: Vec<TransformerDecoder>,
    output_proj: Linear,
}

impl TransformerModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vocab_size: usize,
        embed_dim: usize,
        num_heads: usize,
        ff_hidden_dim: usize,
        num_encoder_layers: usize,
        num_decoder_layers: usize,
        max_seq_len: usize,
    ) -> Result<Self> {
        if num_encoder_layers == 0 || num_decoder_layers == 0 {
            return Err(Error::config(
                "TransformerModel: encoder and decoder stacks need at least one block",
            ));
        }
        let mut encoder_blocks = Vec::with_capacity(num_encoder_layers);
        for _ in 0..num_encoder_layers {
            encoder_blocks.push(TransformerEncoder::new(embed_dim, num_heads, ff_hidden_dim)?);
        }
        let mut decoder_blocks = Vec::with_capacity(num_decoder_layers);
        for _ in 0..num_decoder_layers {
            decoder_blocks.push(TransformerDecoder::new(embed_dim, num_heads, ff_hidden_dim)?);
        }
        Ok(TransformerModel {
            src_embed: Embedding::new(vocab_size, embed_dim)?,
            tgt_embed: Embedding::new(vocab_size, embed_dim)?,
            pos_enc: PositionalEncoding::new(max_seq_len, embed_dim)?,
            encoder_blocks,
            decoder_blocks,
            output_proj: Linear::new(embed_dim, vocab_size),
        })
    }

    /// Forward pass from token ids to vocabulary logits.
    ///
    /// - `src_tokens`: `[batch, src_seq]` source token ids
    /// - `tgt_tokens`: `[batch, tgt_seq]` target token ids
    ///
    /// Returns logits `[batch, tgt_seq, vocab]`.
    pub fn forward(&mut self, src_tokens: &Tensor, tgt_tokens: &Tensor) -> Result<Tensor> {
        // Encoder path
        let src = self.src_embed.forward(src_tokens)?;
        let mut enc_out = self.pos_enc.forward(&src)?;
        for block in self.encoder_blocks.iter_mut() {
            enc_out = block.forward(&enc_out)?;
        }

        // Decoder path, every block attending to the final encoder output
        let tgt = self.tgt_embed.forward(tgt_tokens)?;
        let mut dec_out = self.pos_enc.forward(&tgt)?;
        for block in self.decoder_blocks.iter_mut() {
            dec_out = block.forward(&dec_out, &enc_out)?;
        }

        self.output_proj.forward(&dec_out)
    }

    /// Backward pass from the logits gradient. All parameter gradients are
    /// accumulated; token ids have no gradient, so nothing is returned.
    pub fn backward(&mut self, grad_out: &Tensor) -> Result<()> {
        // 1) Final projection
        let mut d_dec = self.output_proj.backward(grad_out)?;

        // 2) Decoder stack in reverse, summing every block's gradient
        //    contribution to the encoder output
        let mut d_enc_accum: Option<Tensor> = None;
        for block in self.decoder_blocks.iter_mut().rev() {
            let (d_in, d_enc) = block.backward(&d_dec)?;
            d_dec = d_in;
            d_enc_accum = Some(match d_enc_accum {
                Some(acc) => acc.add(&d_enc)?,
                None => d_enc,
            });
        }
        // The constructor guarantees at least one decoder block.
        let mut d_enc = d_enc_accum.expect("decoder stack is never empty");

        // 3) Encoder stack in reverse
        for block in self.encoder_blocks.iter_mut().rev() {
            d_enc = block.backward(&d_enc)?;
        }

        // 4) Source path: positional encoding, then embedding
        let d_src = self.pos_enc.backward(&d_enc)?;
        self.src_embed.backward(&d_src)?;

        // 5) Target path
        let d_tgt = self.pos_enc.backward(&d_dec)?;
        self.tgt_embed.backward(&d_tgt)?;
        Ok(())
    }

    /// Every parameter/gradient pair in the model, for the optimizer.
    pub fn parameters(&mut self) -> Vec<Param<'_>> {
        let mut params = self.src_embed.parameters();
        params.extend(self.tgt_embed.parameters());
        for block in self.encoder_blocks.iter_mut() {
            params.extend(block.parameters());
        }
        for block in self.decoder_blocks.iter_mut() {
            params.extend(block.parameters());
        }
        params.extend(self.output_proj.parameters());
        params
    }

    /// One training step's loss: forward, cross-entropy against the target
    /// labels, and the full backward. Convenience wrapper for training loops.
    pub fn train_step(
        &mut self,
        src_tokens: &Tensor,
        tgt_tokens: &Tensor,
        labels: &[usize],
        loss_fn: &mut CrossEntropyLoss,
    ) -> Result<f64> {
        let logits = self.forward(src_tokens, tgt_tokens)?;
        let (batch, seq, vocab) = (logits.dims()[0], logits.dims()[1], logits.dims()[2]);
        let flat = logits.reshape((batch * seq, vocab))?;
        let loss = loss_fn.forward(&flat, labels)?;
        let d_logits = loss_fn.backward()?.reshape((batch, seq, vocab))?;
        self.backward(&d_logits)?;
        Ok(loss.data()[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_block_shape() {
        let mut block = TransformerEncoder::new(8, 2, 16).unwrap();
        let x = Tensor::zeros((2, 4, 8));
        let y = block.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 4, 8]);
        let dx = block.backward(&Tensor::ones((2, 4, 8))).unwrap();
        assert_eq!(dx.dims(), &[2, 4, 8]);
    }

    #[test]
    fn test_decoder_block_exposes_encoder_grad() {
        let mut block = TransformerDecoder::new(8, 2, 16).unwrap();
        let x = Tensor::zeros((1, 3, 8));
        let enc = Tensor::zeros((1, 5, 8));
        let y = block.forward(&x, &enc).unwrap();
        assert_eq!(y.dims(), &[1, 3, 8]);

        let (dx, d_enc) = block.backward(&Tensor::ones((1, 3, 8))).unwrap();
        assert_eq!(dx.dims(), &[1, 3, 8]);
        assert_eq!(d_enc.dims(), &[1, 5, 8]);
    }

    #[test]
    fn test_model_end_to_end() {
        let mut model = TransformerModel::new(11, 8, 2, 16, 1, 1, 16).unwrap();
        let src = Tensor::from_vec(vec![1.0, 2.0, 3.0], (1, 3)).unwrap();
        let tgt = Tensor::from_vec(vec![4.0, 5.0], (1, 2)).unwrap();
        let logits = model.forward(&src, &tgt).unwrap();
        assert_eq!(logits.dims(), &[1, 2, 11]);
        model.backward(&Tensor::ones((1, 2, 11))).unwrap();
        assert!(model.parameters().len() > 20);
    }

    #[test]
    fn test_empty_stacks_rejected() {
        assert!(TransformerModel::new(10, 8, 2, 16, 0, 1, 16).is_err());
        assert!(TransformerModel::new(10, 8, 2, 16, 1, 0, 16).is_err());
    }
}
