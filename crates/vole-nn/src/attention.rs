// Multi-Head Attention — scaled dot-product attention with learned
// Q/K/V/output projections, differentiated by hand.
//
// MATHEMATICS (forward):
//
//   Q = q_input @ Wq^T + bq          [batch, qSeq,  E]
//   K = kv_input @ Wk^T + bk         [batch, kvSeq, E]
//   V = kv_input @ Wv^T + bv         [batch, kvSeq, E]
//
//   Heads are contiguous slices of the embedding dimension:
//   head h owns columns h*D .. (h+1)*D, with D = E / num_heads.
//
//   per head:  scores  = Q K^T / sqrt(D)       [batch, H, qSeq, kvSeq]
//              weights = softmax(scores, row-wise, stable)
//              out     = weights @ V
//   concat heads → output projection Wo.
//
// CAUSAL MASK: with `causal` enabled, every score with key index j greater
// than query index i receives a large negative additive constant before the
// softmax, driving its weight to zero — so output row i cannot depend on
// positions after i.
//
// BACKWARD walks the same pipeline in reverse:
//   1. through the output projection (accumulating dWo, dbo)
//   2. dSoftmax and dV from the attention-output gradient and cached
//      softmax/V
//   3. row-wise softmax Jacobian-vector product:
//        dScore_j = p_j * (dSoft_j - Σ_k dSoft_k p_k)
//   4. through the scaled dot product to dQ and dK
//   5. through the three input projections to their sources. Self-attention
//      sums the three source gradients (they share one source);
//      cross-attention returns the query-side gradient and the sum of the
//      K- and V-side gradients separately, the latter flowing back into the
//      encoder.
//
// SELF vs CROSS: `forward`/`backward` (the Layer impl) is self-attention —
// queries, keys and values all come from one input. `forward_cross` /
// `backward_cross` accept a separate key/value source (decoder queries
// attending to encoder output) and otherwise run the identical algorithm.

use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;

use crate::activation::softmax_row;
use crate::init;
use crate::layer::{Layer, Param};

/// Additive pre-softmax mask value; exp(-1e9 - max) underflows to exactly 0.
const MASK_VALUE: f64 = -1e9;

struct AttnCache {
    query_input: Tensor,
    /// None for self-attention (keys/values share `query_input`).
    kv_input: Option<Tensor>,
    q: Tensor,
    k: Tensor,
    v: Tensor,
    /// Per-head softmax rows: [batch * heads * qSeq * kvSeq].
    softmax: Vec<f64>,
    /// Head-concatenated attention output, before the output projection.
    attention: Tensor,
}

/// Multi-head scaled dot-product attention with learned projections.
///
/// # Examples
/// ```ignore
/// let mut attn = MultiHeadAttention::new(64, 8)?.with_causal(true);
/// let y = attn.forward(&x)?; // [batch, seq, 64]
/// ```
pub struct MultiHeadAttention {
    embed_dim: usize,
    num_heads: usize,
    head_dim: usize,
    causal: bool,

    w_q: Tensor,
    b_q: Tensor,
    w_k: Tensor,
    b_k: Tensor,
    w_v: Tensor,
    b_v: Tensor,
    w_o: Tensor,
    b_o: Tensor,

    d_w_q: Tensor,
    d_b_q: Tensor,
    d_w_k: Tensor,
    d_b_k: Tensor,
    d_w_v: Tensor,
    d_b_v: Tensor,
    d_w_o: Tensor,
    d_b_o: Tensor,

    cache: Option<AttnCache>,
}

impl MultiHeadAttention {
    /// Create a new attention module.
    ///
    /// Rejects `embed_dim` not evenly divisible by `num_heads` — silently
    /// flooring the head dimension would drop embedding width.
    pub fn new(embed_dim: usize, num_heads: usize) -> Result<Self> {
        if num_heads == 0 {
            return Err(Error::config("MultiHeadAttention: num_heads must be > 0"));
        }
        if !embed_dim.is_multiple_of(num_heads) {
            return Err(Error::config(format!(
                "MultiHeadAttention: embed_dim ({}) must be divisible by num_heads ({})",
                embed_dim, num_heads
            )));
        }
        let proj = || init::scaled_uniform((embed_dim, embed_dim), embed_dim);
        let grad = || Tensor::zeros((embed_dim, embed_dim));
        Ok(MultiHeadAttention {
            embed_dim,
            num_heads,
            head_dim: embed_dim / num_heads,
            causal: false,
            w_q: proj(),
            b_q: Tensor::zeros(embed_dim),
            w_k: proj(),
            b_k: Tensor::zeros(embed_dim),
            w_v: proj(),
            b_v: Tensor::zeros(embed_dim),
            w_o: proj(),
            b_o: Tensor::zeros(embed_dim),
            d_w_q: grad(),
            d_b_q: Tensor::zeros(embed_dim),
            d_w_k: grad(),
            d_b_k: Tensor::zeros(embed_dim),
            d_w_v: grad(),
            d_b_v: Tensor::zeros(embed_dim),
            d_w_o: grad(),
            d_b_o: Tensor::zeros(embed_dim),
            cache: None,
        })
    }

    /// Enable causal (autoregressive) masking.
    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Cross-attention forward: queries from `query`, keys and values from
    /// `context` (e.g. decoder input attending to encoder output).
    pub fn forward_cross(&mut self, query: &Tensor, context: &Tensor) -> Result<Tensor> {
        self.attend(query, Some(context))
    }

    /// Cross-attention backward. Returns `(d_query, d_context)`, where
    /// `d_context` is the sum of the gradients propagated through the K and
    /// V projections to their shared source.
    pub fn backward_cross(&mut self, grad_out: &Tensor) -> Result<(Tensor, Tensor)> {
        let (d_query, d_context) = self.backward_core(grad_out)?;
        d_context
            .map(|d| (d_query, d))
            .ok_or_else(|| Error::msg("backward_cross called after a self-attention forward"))
    }

    fn check_input(&self, name: &str, x: &Tensor) -> Result<(usize, usize)> {
        if x.rank() != 3 {
            return Err(Error::RankMismatch {
                expected: 3,
                got: x.rank(),
            });
        }
        if x.dims()[2] != self.embed_dim {
            vole_core::bail!(
                "{name}: expected embed dim {}, got input shape {}",
                self.embed_dim,
                x.shape()
            );
        }
        Ok((x.dims()[0], x.dims()[1]))
    }

    /// Shared forward for both attention modes.
    fn attend(&mut self, q_input: &Tensor, kv_input: Option<&Tensor>) -> Result<Tensor> {
        let (batch, q_seq) = self.check_input("MultiHeadAttention", q_input)?;
        let kv_seq = match kv_input {
            Some(kv) => {
                let (kv_batch, kv_seq) = self.check_input("MultiHeadAttention (context)", kv)?;
                if kv_batch != batch {
                    return Err(Error::ShapeMismatch {
                        expected: q_input.shape().clone(),
                        got: kv.shape().clone(),
                    });
                }
                kv_seq
            }
            None => q_seq,
        };
        let kv_src = kv_input.unwrap_or(q_input);
        let (e, h, d) = (self.embed_dim, self.num_heads, self.head_dim);

        let q = self.proj_forward(q_input, &self.w_q, &self.b_q);
        let k = self.proj_forward(kv_src, &self.w_k, &self.b_k);
        let v = self.proj_forward(kv_src, &self.w_v, &self.b_v);

        let mut softmax = vec![0.0; batch * h * q_seq * kv_seq];
        let mut attention = Tensor::zeros((batch, q_seq, e));
        let scale = 1.0 / (d as f64).sqrt();

        let qd = q.data();
        let kd = k.data();
        let vd = v.data();
        let att = attention.data_mut();

        for b in 0..batch {
            for head in 0..h {
                let q_base = b * q_seq * e + head * d;
                let kv_base = b * kv_seq * e + head * d;
                let s_base = (b * h + head) * q_seq * kv_seq;

                // scores = Q K^T / sqrt(D), masked, then softmax in place
                for i in 0..q_seq {
                    let row = &mut softmax[s_base + i * kv_seq..s_base + (i + 1) * kv_seq];
                    for (j, slot) in row.iter_mut().enumerate() {
                        let mut sum = 0.0;
                        for dd in 0..d {
                            sum += qd[q_base + i * e + dd] * kd[kv_base + j * e + dd];
                        }
                        *slot = sum * scale;
                        if self.causal && j > i {
                            *slot += MASK_VALUE;
                        }
                    }
                    softmax_row(row);
                }

                // attention = softmax @ V, written into this head's slice
                let out_base = b * q_seq * e + head * d;
                for i in 0..q_seq {
                    for dd in 0..d {
                        let mut sum = 0.0;
                        for j in 0..kv_seq {
                            sum += softmax[s_base + i * kv_seq + j] * vd[kv_base + j * e + dd];
                        }
                        att[out_base + i * e + dd] = sum;
                    }
                }
            }
        }

        let out = self.proj_forward(&attention, &self.w_o, &self.b_o);
        self.cache = Some(AttnCache {
            query_input: q_input.clone(),
            kv_input: kv_input.cloned(),
            q,
            k,
            v,
            softmax,
            attention,
        });
        Ok(out)
    }

    /// Shared backward. Returns the query-source gradient and, for
    /// cross-attention, the key/value-source gradient.
    fn backward_core(&mut self, grad_out: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        let cache = self.cache.take().ok_or(Error::MissingState {
            layer: "MultiHeadAttention",
        })?;
        let (e, h, d) = (self.embed_dim, self.num_heads, self.head_dim);
        let batch = cache.query_input.dims()[0];
        let q_seq = cache.query_input.dims()[1];
        let kv_seq = cache.k.dims()[1];
        if grad_out.dims() != &[batch, q_seq, e] {
            return Err(Error::ShapeMismatch {
                expected: vole_core::Shape::from((batch, q_seq, e)),
                got: grad_out.shape().clone(),
            });
        }

        self.d_w_q.zero();
        self.d_b_q.zero();
        self.d_w_k.zero();
        self.d_b_k.zero();
        self.d_w_v.zero();
        self.d_b_v.zero();
        self.d_w_o.zero();
        self.d_b_o.zero();

        // 1) Back through the output projection.
        let grad_att = proj_backward(
            &cache.attention,
            grad_out,
            &self.w_o,
            &mut self.d_w_o,
            &mut self.d_b_o,
        );

        let mut d_q = Tensor::zeros(cache.q.shape().clone());
        let mut d_k = Tensor::zeros(cache.k.shape().clone());
        let mut d_v = Tensor::zeros(cache.v.shape().clone());
        let mut d_soft = vec![0.0; batch * h * q_seq * kv_seq];
        let mut d_scores = vec![0.0; batch * h * q_seq * kv_seq];
        let scale = 1.0 / (d as f64).sqrt();

        {
            let ga = grad_att.data();
            let qd = cache.q.data();
            let kd = cache.k.data();
            let vd = cache.v.data();
            let dqd = d_q.data_mut();
            let dkd = d_k.data_mut();
            let dvd = d_v.data_mut();

            for b in 0..batch {
                for head in 0..h {
                    let q_base = b * q_seq * e + head * d;
                    let kv_base = b * kv_seq * e + head * d;
                    let s_base = (b * h + head) * q_seq * kv_seq;

                    // 2) attention = softmax @ V  →  dSoftmax, dV
                    for i in 0..q_seq {
                        for dd in 0..d {
                            let g = ga[q_base + i * e + dd];
                            for j in 0..kv_seq {
                                let w = cache.softmax[s_base + i * kv_seq + j];
                                d_soft[s_base + i * kv_seq + j] += g * vd[kv_base + j * e + dd];
                                dvd[kv_base + j * e + dd] += g * w;
                            }
                        }
                    }

                    // 3) softmax Jacobian-vector product, row-wise
                    for i in 0..q_seq {
                        let mut dot = 0.0;
                        for j in 0..kv_seq {
                            dot += d_soft[s_base + i * kv_seq + j]
                                * cache.softmax[s_base + i * kv_seq + j];
                        }
                        for j in 0..kv_seq {
                            let p = cache.softmax[s_base + i * kv_seq + j];
                            let g = d_soft[s_base + i * kv_seq + j];
                            d_scores[s_base + i * kv_seq + j] = (g - dot) * p;
                        }
                    }

                    // 4) scores = Q K^T / sqrt(D)  →  dQ, dK
                    for i in 0..q_seq {
                        for j in 0..kv_seq {
                            let ds = d_scores[s_base + i * kv_seq + j] * scale;
                            for dd in 0..d {
                                dqd[q_base + i * e + dd] += ds * kd[kv_base + j * e + dd];
                                dkd[kv_base + j * e + dd] += ds * qd[q_base + i * e + dd];
                            }
                        }
                    }
                }
            }
        }

        // 5) Back through the three input projections to their sources.
        let kv_src = cache.kv_input.as_ref().unwrap_or(&cache.query_input);
        let d_xq = proj_backward(
            &cache.query_input,
            &d_q,
            &self.w_q,
            &mut self.d_w_q,
            &mut self.d_b_q,
        );
        let d_xk = proj_backward(kv_src, &d_k, &self.w_k, &mut self.d_w_k, &mut self.d_b_k);
        let d_xv = proj_backward(kv_src, &d_v, &self.w_v, &mut self.d_w_v, &mut self.d_b_v);

        match cache.kv_input {
            // Self-attention: one shared source receives all three.
            None => Ok((d_xq.add(&d_xk)?.add(&d_xv)?, None)),
            // Cross-attention: the key/value source is the encoder's.
            Some(_) => Ok((d_xq, Some(d_xk.add(&d_xv)?))),
        }
    }

    /// `x @ W^T + b` over `[batch, seq, embed]`.
    fn proj_forward(&self, x: &Tensor, w: &Tensor, b: &Tensor) -> Tensor {
        let e = self.embed_dim;
        let rows = x.elem_count() / e;
        let mut out = Tensor::zeros(x.shape().clone());
        let xd = x.data();
        let wd = w.data();
        let bd = b.data();
        let od = out.data_mut();
        for r in 0..rows {
            for j in 0..e {
                let mut sum = bd[j];
                for k in 0..e {
                    sum += wd[j * e + k] * xd[r * e + k];
                }
                od[r * e + j] = sum;
            }
        }
        out
    }
}

/// Backward of a full-embedding projection: accumulates `dW`/`db`
/// (zeroed by the caller) and returns the input gradient.
fn proj_backward(x: &Tensor, grad_out: &Tensor, w: &Tensor, dw: &mut Tensor, db: &mut Tensor) -> Tensor {
    let e = db.elem_count();
    let rows = x.elem_count() / e;
    let mut grad_in = Tensor::zeros(x.shape().clone());
    let xd = x.data();
    let wd = w.data();
    let gd = grad_out.data();
    let dwd = dw.data_mut();
    let dbd = db.data_mut();
    let gid = grad_in.data_mut();
    for r in 0..rows {
        for j in 0..e {
            let g = gd[r * e + j];
            dbd[j] += g;
            for k in 0..e {
                dwd[j * e + k] += g * xd[r * e + k];
                gid[r * e + k] += g * wd[j * e + k];
            }
        }
    }
    grad_in
}

impl Layer for MultiHeadAttention {
    /// Self-attention over `[batch, seq, embed_dim]`.
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.attend(input, None)
    }

    /// Self-attention backward: the summed gradient of all three
    /// projections w.r.t. the shared input.
    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let (d_input, d_context) = self.backward_core(grad_out)?;
        if d_context.is_some() {
            return Err(Error::msg(
                "backward called after a cross-attention forward; use backward_cross",
            ));
        }
        Ok(d_input)
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                value: &mut self.w_q,
                grad: &self.d_w_q,
            },
            Param {
                value: &mut self.b_q,
                grad: &self.d_b_q,
            },
            Param {
                value: &mut self.w_k,
                grad: &self.d_w_k,
            },
            Param {
                value: &mut self.b_k,
                grad: &self.d_b_k,
            },
            Param {
                value: &mut self.w_v,
                grad: &self.d_w_v,
            },
            Param {
                value: &mut self.b_v,
                grad: &self.d_b_v,
            },
            Param {
                value: &mut self.w_o,
                grad: &self.d_w_o,
            },
            Param {
                value: &mut self.b_o,
                grad: &self.d_b_o,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divisibility_enforced() {
        assert!(MultiHeadAttention::new(10, 3).is_err());
        assert!(MultiHeadAttention::new(12, 3).is_ok());
        assert!(MultiHeadAttention::new(4, 0).is_err());
    }

    #[test]
    fn test_self_attention_shape() {
        let mut attn = MultiHeadAttention::new(8, 2).unwrap();
        let x = Tensor::zeros((2, 5, 8));
        let y = attn.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 5, 8]);
    }

    #[test]
    fn test_cross_attention_shape() {
        let mut attn = MultiHeadAttention::new(8, 2).unwrap();
        let q = Tensor::zeros((2, 3, 8));
        let kv = Tensor::zeros((2, 7, 8));
        let y = attn.forward_cross(&q, &kv).unwrap();
        // Output follows the query sequence length
        assert_eq!(y.dims(), &[2, 3, 8]);
    }

    #[test]
    fn test_backward_mode_mismatch_rejected() {
        let mut attn = MultiHeadAttention::new(4, 1).unwrap();
        let q = Tensor::zeros((1, 2, 4));
        let kv = Tensor::zeros((1, 3, 4));
        attn.forward_cross(&q, &kv).unwrap();
        assert!(attn.backward(&Tensor::zeros((1, 2, 4))).is_err());
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let mut attn = MultiHeadAttention::new(4, 2).unwrap();
        let x = Tensor::from_vec((0..24).map(|i| i as f64 * 0.1).collect(), (2, 3, 4)).unwrap();
        attn.forward(&x).unwrap();
        let cache = attn.cache.as_ref().unwrap();
        for row in cache.softmax.chunks(3) {
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12);
        }
    }
}
