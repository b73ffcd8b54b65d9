// Recurrent layers — RNN, LSTM, GRU
//
// This module implements the three fundamental recurrent architectures,
// each trained by backpropagation-through-time (BPTT):
//
//   1. RNN  — Vanilla Elman network: h_t = tanh(Wxh x_t + Whh h_{t-1} + b)
//   2. LSTM — input/forget/output gates plus a cell state
//   3. GRU  — update/reset gates with a candidate hidden state
//
// SHAPES (batch_first convention):
//   input:  [batch, seq, input_dim]
//   output: [batch, seq, hidden_dim]   — every timestep's hidden state
//
// CACHING DISCIPLINE:
//
// Backward needs every gate activation and every hidden (and, for LSTM,
// cell) state intact. Gate activations are cached as flat buffers indexed
// by (batch, time, hidden): length batch*seq*hidden. Hidden/cell histories
// carry one extra leading time slot holding the zero-initialized h0/c0:
// length batch*(seq+1)*hidden, so h_{t-1} for t = 0 is a real read, not a
// special case.
//
// BPTT:
//
// The backward pass iterates timesteps in reverse — the time loop is the
// outer loop, the batch loop sits inside it, because the gradient carried
// across time (dHnext, dCnext) must be fully formed at step t+1 before any
// batch element of step t consumes it. At each step the gradient arriving
// from the output position is combined with the carried gradient, pushed
// through the gate nonlinearities' local derivatives (sigmoid: s(1-s),
// tanh: 1-t²), accumulated into every weight and bias via outer products
// with the cached input and previous hidden state, and finally projected
// into dX and the next carried gradient. All parameter gradients accumulate
// additively across all timesteps and batch elements.

use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;

use crate::activation::sigmoid;
use crate::init;
use crate::layer::{Layer, Param};

/// Check a `[batch, seq, features]` input and return (batch, seq).
fn check_seq_input(name: &str, x: &Tensor, features: usize) -> Result<(usize, usize)> {
    if x.rank() != 3 {
        return Err(Error::RankMismatch {
            expected: 3,
            got: x.rank(),
        });
    }
    if x.dims()[2] != features {
        vole_core::bail!(
            "{name}: expected feature dim {}, got input shape {}",
            features,
            x.shape()
        );
    }
    Ok((x.dims()[0], x.dims()[1]))
}

// RNN

struct RnnCache {
    input: Tensor,
    /// Hidden history incl. h0: [batch * (seq+1) * hidden].
    h: Vec<f64>,
    batch: usize,
    seq: usize,
}

/// Vanilla recurrent layer: `h_t = tanh(Wxh x_t + Whh h_{t-1} + b)`.
pub struct RNN {
    input_dim: usize,
    hidden_dim: usize,
    /// Input-to-hidden: [hidden, input]
    w_xh: Tensor,
    /// Hidden-to-hidden: [hidden, hidden]
    w_hh: Tensor,
    /// Bias: [hidden]
    b: Tensor,
    d_w_xh: Tensor,
    d_w_hh: Tensor,
    d_b: Tensor,
    cache: Option<RnnCache>,
}

impl RNN {
    pub fn new(input_dim: usize, hidden_dim: usize) -> Result<Self> {
        if input_dim == 0 || hidden_dim == 0 {
            return Err(Error::config("RNN: dims must be > 0"));
        }
        Ok(RNN {
            w_xh: init::scaled_uniform((hidden_dim, input_dim), input_dim),
            w_hh: init::scaled_uniform((hidden_dim, hidden_dim), hidden_dim),
            b: Tensor::zeros(hidden_dim),
            d_w_xh: Tensor::zeros((hidden_dim, input_dim)),
            d_w_hh: Tensor::zeros((hidden_dim, hidden_dim)),
            d_b: Tensor::zeros(hidden_dim),
            input_dim,
            hidden_dim,
            cache: None,
        })
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }
}

impl Layer for RNN {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let (batch, seq) = check_seq_input("RNN", input, self.input_dim)?;
        let (in_dim, h_dim) = (self.input_dim, self.hidden_dim);

        let mut out = Tensor::zeros((batch, seq, h_dim));
        // One leading slot per batch element for h0 = 0
        let mut h_hist = vec![0.0; batch * (seq + 1) * h_dim];

        let x = input.data();
        let w_xh = self.w_xh.data();
        let w_hh = self.w_hh.data();
        let b = self.b.data();
        let o = out.data_mut();

        for t in 0..seq {
            for bi in 0..batch {
                let base_x = (bi * seq + t) * in_dim;
                let base_hprev = (bi * (seq + 1) + t) * h_dim;
                let base_hcur = (bi * (seq + 1) + t + 1) * h_dim;

                for j in 0..h_dim {
                    let mut sum = b[j];
                    for k in 0..in_dim {
                        sum += w_xh[j * in_dim + k] * x[base_x + k];
                    }
                    for k in 0..h_dim {
                        sum += w_hh[j * h_dim + k] * h_hist[base_hprev + k];
                    }
                    let h = sum.tanh();
                    h_hist[base_hcur + j] = h;
                    o[(bi * seq + t) * h_dim + j] = h;
                }
            }
        }

        self.cache = Some(RnnCache {
            input: input.clone(),
            h: h_hist,
            batch,
            seq,
        });
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let cache = self
            .cache
            .take()
            .ok_or(Error::MissingState { layer: "RNN" })?;
        let (batch, seq) = (cache.batch, cache.seq);
        let (in_dim, h_dim) = (self.input_dim, self.hidden_dim);
        if grad_out.dims() != &[batch, seq, h_dim] {
            return Err(Error::ShapeMismatch {
                expected: vole_core::Shape::from((batch, seq, h_dim)),
                got: grad_out.shape().clone(),
            });
        }

        self.d_w_xh.zero();
        self.d_w_hh.zero();
        self.d_b.zero();
        let mut grad_in = Tensor::zeros(cache.input.shape().clone());

        let x = cache.input.data();
        let g = grad_out.data();
        let w_xh = self.w_xh.data();
        let w_hh = self.w_hh.data();
        let dw_xh = self.d_w_xh.data_mut();
        let dw_hh = self.d_w_hh.data_mut();
        let db = self.d_b.data_mut();
        let gi = grad_in.data_mut();

        let mut d_h_next = vec![0.0; batch * h_dim];
        let mut d_a = vec![0.0; h_dim];

        for t in (0..seq).rev() {
            for bi in 0..batch {
                let base_x = (bi * seq + t) * in_dim;
                let base_hprev = (bi * (seq + 1) + t) * h_dim;
                let base_hcur = (bi * (seq + 1) + t + 1) * h_dim;

                // dL/dh_t: gradient from this output position plus the
                // gradient carried back from timestep t+1.
                for j in 0..h_dim {
                    let dh = g[(bi * seq + t) * h_dim + j] + d_h_next[bi * h_dim + j];
                    let h = cache.h[base_hcur + j];
                    d_a[j] = dh * (1.0 - h * h);
                }

                for j in 0..h_dim {
                    db[j] += d_a[j];
                    for k in 0..in_dim {
                        dw_xh[j * in_dim + k] += d_a[j] * x[base_x + k];
                    }
                    for k in 0..h_dim {
                        dw_hh[j * h_dim + k] += d_a[j] * cache.h[base_hprev + k];
                    }
                }

                for j in 0..in_dim {
                    let mut sum = 0.0;
                    for k in 0..h_dim {
                        sum += d_a[k] * w_xh[k * in_dim + j];
                    }
                    gi[base_x + j] = sum;
                }

                // dHnext = Whh^T · dA, carried to timestep t-1
                for j in 0..h_dim {
                    let mut sum = 0.0;
                    for k in 0..h_dim {
                        sum += d_a[k] * w_hh[k * h_dim + j];
                    }
                    d_h_next[bi * h_dim + j] = sum;
                }
            }
        }
        Ok(grad_in)
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                value: &mut self.w_xh,
                grad: &self.d_w_xh,
            },
            Param {
                value: &mut self.w_hh,
                grad: &self.d_w_hh,
            },
            Param {
                value: &mut self.b,
                grad: &self.d_b,
            },
        ]
    }
}

// LSTM

struct LstmCache {
    input: Tensor,
    /// Gate activations: [batch * seq * hidden] each.
    i: Vec<f64>,
    f: Vec<f64>,
    o: Vec<f64>,
    c_tilde: Vec<f64>,
    /// Cell / hidden histories incl. c0/h0: [batch * (seq+1) * hidden].
    c: Vec<f64>,
    h: Vec<f64>,
    batch: usize,
    seq: usize,
}

/// Long Short-Term Memory layer.
///
/// Per timestep:
/// ```text
/// i = σ(Wi x + Ui h + bi)      f = σ(Wf x + Uf h + bf)
/// o = σ(Wo x + Uo h + bo)      c~ = tanh(Wc x + Uc h + bc)
/// c_t = f ⊙ c_{t-1} + i ⊙ c~
/// h_t = o ⊙ tanh(c_t)
/// ```
pub struct LSTM {
    input_dim: usize,
    hidden_dim: usize,
    // One (W, U, b) triple per gate: input, forget, output, candidate.
    w_i: Tensor,
    u_i: Tensor,
    b_i: Tensor,
    w_f: Tensor,
    u_f: Tensor,
    b_f: Tensor,
    w_o: Tensor,
    u_o: Tensor,
    b_o: Tensor,
    w_c: Tensor,
    u_c: Tensor,
    b_c: Tensor,
    d_w_i: Tensor,
    d_u_i: Tensor,
    d_b_i: Tensor,
    d_w_f: Tensor,
    d_u_f: Tensor,
    d_b_f: Tensor,
    d_w_o: Tensor,
    d_u_o: Tensor,
    d_b_o: Tensor,
    d_w_c: Tensor,
    d_u_c: Tensor,
    d_b_c: Tensor,
    cache: Option<LstmCache>,
}

impl LSTM {
    pub fn new(input_dim: usize, hidden_dim: usize) -> Result<Self> {
        if input_dim == 0 || hidden_dim == 0 {
            return Err(Error::config("LSTM: dims must be > 0"));
        }
        let w = || init::scaled_uniform((hidden_dim, input_dim), input_dim);
        let u = || init::scaled_uniform((hidden_dim, hidden_dim), hidden_dim);
        let dw = || Tensor::zeros((hidden_dim, input_dim));
        let du = || Tensor::zeros((hidden_dim, hidden_dim));
        Ok(LSTM {
            w_i: w(),
            u_i: u(),
            b_i: Tensor::zeros(hidden_dim),
            w_f: w(),
            u_f: u(),
            b_f: Tensor::zeros(hidden_dim),
            w_o: w(),
            u_o: u(),
            b_o: Tensor::zeros(hidden_dim),
            w_c: w(),
            u_c: u(),
            b_c: Tensor::zeros(hidden_dim),
            d_w_i: dw(),
            d_u_i: du(),
            d_b_i: Tensor::zeros(hidden_dim),
            d_w_f: dw(),
            d_u_f: du(),
            d_b_f: Tensor::zeros(hidden_dim),
            d_w_o: dw(),
            d_u_o: du(),
            d_b_o: Tensor::zeros(hidden_dim),
            d_w_c: dw(),
            d_u_c: du(),
            d_b_c: Tensor::zeros(hidden_dim),
            input_dim,
            hidden_dim,
            cache: None,
        })
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }
}

impl Layer for LSTM {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let (batch, seq) = check_seq_input("LSTM", input, self.input_dim)?;
        let (in_dim, h_dim) = (self.input_dim, self.hidden_dim);

        let mut out = Tensor::zeros((batch, seq, h_dim));
        let gate_len = batch * seq * h_dim;
        let hist_len = batch * (seq + 1) * h_dim;
        let mut i_gate = vec![0.0; gate_len];
        let mut f_gate = vec![0.0; gate_len];
        let mut o_gate = vec![0.0; gate_len];
        let mut c_tilde = vec![0.0; gate_len];
        let mut c_hist = vec![0.0; hist_len];
        let mut h_hist = vec![0.0; hist_len];

        let x = input.data();
        let o = out.data_mut();

        for t in 0..seq {
            for bi in 0..batch {
                let base_x = (bi * seq + t) * in_dim;
                let base_prev = (bi * (seq + 1) + t) * h_dim;
                let base_cur = (bi * (seq + 1) + t + 1) * h_dim;
                let base_gate = (bi * seq + t) * h_dim;

                for j in 0..h_dim {
                    // All four pre-activations share the same input reads.
                    let mut sum_i = self.b_i.data()[j];
                    let mut sum_f = self.b_f.data()[j];
                    let mut sum_o = self.b_o.data()[j];
                    let mut sum_c = self.b_c.data()[j];

                    for k in 0..in_dim {
                        let xv = x[base_x + k];
                        sum_i += self.w_i.data()[j * in_dim + k] * xv;
                        sum_f += self.w_f.data()[j * in_dim + k] * xv;
                        sum_o += self.w_o.data()[j * in_dim + k] * xv;
                        sum_c += self.w_c.data()[j * in_dim + k] * xv;
                    }
                    for k in 0..h_dim {
                        let hv = h_hist[base_prev + k];
                        sum_i += self.u_i.data()[j * h_dim + k] * hv;
                        sum_f += self.u_f.data()[j * h_dim + k] * hv;
                        sum_o += self.u_o.data()[j * h_dim + k] * hv;
                        sum_c += self.u_c.data()[j * h_dim + k] * hv;
                    }

                    let ig = sigmoid(sum_i);
                    let fg = sigmoid(sum_f);
                    let og = sigmoid(sum_o);
                    let ct = sum_c.tanh();

                    i_gate[base_gate + j] = ig;
                    f_gate[base_gate + j] = fg;
                    o_gate[base_gate + j] = og;
                    c_tilde[base_gate + j] = ct;

                    let c_prev = c_hist[base_prev + j];
                    let c_cur = fg * c_prev + ig * ct;
                    c_hist[base_cur + j] = c_cur;

                    let h_cur = og * c_cur.tanh();
                    h_hist[base_cur + j] = h_cur;
                    o[(bi * seq + t) * h_dim + j] = h_cur;
                }
            }
        }

        self.cache = Some(LstmCache {
            input: input.clone(),
            i: i_gate,
            f: f_gate,
            o: o_gate,
            c_tilde,
            c: c_hist,
            h: h_hist,
            batch,
            seq,
        });
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let cache = self
            .cache
            .take()
            .ok_or(Error::MissingState { layer: "LSTM" })?;
        let (batch, seq) = (cache.batch, cache.seq);
        let (in_dim, h_dim) = (self.input_dim, self.hidden_dim);
        if grad_out.dims() != &[batch, seq, h_dim] {
            return Err(Error::ShapeMismatch {
                expected: vole_core::Shape::from((batch, seq, h_dim)),
                got: grad_out.shape().clone(),
            });
        }

        for t in [
            &mut self.d_w_i,
            &mut self.d_u_i,
            &mut self.d_b_i,
            &mut self.d_w_f,
            &mut self.d_u_f,
            &mut self.d_b_f,
            &mut self.d_w_o,
            &mut self.d_u_o,
            &mut self.d_b_o,
            &mut self.d_w_c,
            &mut self.d_u_c,
            &mut self.d_b_c,
        ] {
            t.zero();
        }
        let mut grad_in = Tensor::zeros(cache.input.shape().clone());

        let x = cache.input.data();
        let g = grad_out.data();
        let gi = grad_in.data_mut();

        let mut d_h_next = vec![0.0; batch * h_dim];
        let mut d_c_next = vec![0.0; batch * h_dim];
        let mut d_h = vec![0.0; h_dim];
        let mut d_c = vec![0.0; h_dim];
        let mut d_i = vec![0.0; h_dim];
        let mut d_f = vec![0.0; h_dim];
        let mut d_o = vec![0.0; h_dim];
        let mut d_ct = vec![0.0; h_dim];

        for t in (0..seq).rev() {
            for bi in 0..batch {
                let base_x = (bi * seq + t) * in_dim;
                let base_prev = (bi * (seq + 1) + t) * h_dim;
                let base_cur = (bi * (seq + 1) + t + 1) * h_dim;
                let base_gate = (bi * seq + t) * h_dim;

                for j in 0..h_dim {
                    d_h[j] = g[(bi * seq + t) * h_dim + j] + d_h_next[bi * h_dim + j];
                }

                // dL/dc_t flows in through h_t = o · tanh(c_t) and from the
                // carried cell gradient.
                for j in 0..h_dim {
                    let og = cache.o[base_gate + j];
                    let tc = cache.c[base_cur + j].tanh();
                    d_c[j] = d_h[j] * og * (1.0 - tc * tc) + d_c_next[bi * h_dim + j];
                }

                // Pre-activation gradients for all four gates.
                for j in 0..h_dim {
                    let ig = cache.i[base_gate + j];
                    let fg = cache.f[base_gate + j];
                    let og = cache.o[base_gate + j];
                    let ct = cache.c_tilde[base_gate + j];
                    let c_prev = cache.c[base_prev + j];
                    let tc = cache.c[base_cur + j].tanh();

                    d_i[j] = d_c[j] * ct * ig * (1.0 - ig);
                    d_f[j] = d_c[j] * c_prev * fg * (1.0 - fg);
                    d_o[j] = d_h[j] * tc * og * (1.0 - og);
                    d_ct[j] = d_c[j] * ig * (1.0 - ct * ct);
                }

                // Outer products with x_t and h_{t-1} for every gate.
                for (d_gate, dw, du, db) in [
                    (&d_i, &mut self.d_w_i, &mut self.d_u_i, &mut self.d_b_i),
                    (&d_f, &mut self.d_w_f, &mut self.d_u_f, &mut self.d_b_f),
                    (&d_o, &mut self.d_w_o, &mut self.d_u_o, &mut self.d_b_o),
                    (&d_ct, &mut self.d_w_c, &mut self.d_u_c, &mut self.d_b_c),
                ] {
                    let dw = dw.data_mut();
                    let du = du.data_mut();
                    let db = db.data_mut();
                    for j in 0..h_dim {
                        db[j] += d_gate[j];
                        for k in 0..in_dim {
                            dw[j * in_dim + k] += d_gate[j] * x[base_x + k];
                        }
                        for k in 0..h_dim {
                            du[j * h_dim + k] += d_gate[j] * cache.h[base_prev + k];
                        }
                    }
                }

                // dX: every gate's W^T contribution.
                for j in 0..in_dim {
                    let mut sum = 0.0;
                    for k in 0..h_dim {
                        sum += d_i[k] * self.w_i.data()[k * in_dim + j];
                        sum += d_f[k] * self.w_f.data()[k * in_dim + j];
                        sum += d_o[k] * self.w_o.data()[k * in_dim + j];
                        sum += d_ct[k] * self.w_c.data()[k * in_dim + j];
                    }
                    gi[base_x + j] = sum;
                }

                // Carry gradients to timestep t-1.
                for j in 0..h_dim {
                    d_c_next[bi * h_dim + j] = d_c[j] * cache.f[base_gate + j];

                    let mut sum = 0.0;
                    for k in 0..h_dim {
                        sum += d_i[k] * self.u_i.data()[k * h_dim + j];
                        sum += d_f[k] * self.u_f.data()[k * h_dim + j];
                        sum += d_o[k] * self.u_o.data()[k * h_dim + j];
                        sum += d_ct[k] * self.u_c.data()[k * h_dim + j];
                    }
                    d_h_next[bi * h_dim + j] = sum;
                }
            }
        }
        Ok(grad_in)
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                value: &mut self.w_i,
                grad: &self.d_w_i,
            },
            Param {
                value: &mut self.u_i,
                grad: &self.d_u_i,
            },
            Param {
                value: &mut self.b_i,
                grad: &self.d_b_i,
            },
            Param {
                value: &mut self.w_f,
                grad: &self.d_w_f,
            },
            Param {
                value: &mut self.u_f,
                grad: &self.d_u_f,
            },
            Param {
                value: &mut self.b_f,
                grad: &self.d_b_f,
            },
            Param {
                value: &mut self.w_o,
                grad: &self.d_w_o,
            },
            Param {
                value: &mut self.u_o,
                grad: &self.d_u_o,
            },
            Param {
                value: &mut self.b_o,
                grad: &self.d_b_o,
            },
            Param {
                value: &mut self.w_c,
                grad: &self.d_w_c,
            },
            Param {
                value: &mut self.u_c,
                grad: &self.d_u_c,
            },
            Param {
                value: &mut self.b_c,
                grad: &self.d_b_c,
            },
        ]
    }
}

// GRU

struct GruCache {
    input: Tensor,
    z: Vec<f64>,
    r: Vec<f64>,
    h_tilde: Vec<f64>,
    /// Hidden history incl. h0.
    h: Vec<f64>,
    batch: usize,
    seq: usize,
}

/// Gated Recurrent Unit layer.
///
/// Per timestep:
/// ```text
/// z = σ(Wz x + Uz h + bz)           — update gate
/// r = σ(Wr x + Ur h + br)           — reset gate
/// h~ = tanh(Wh x + Uh (r ⊙ h) + bh) — candidate
/// h_t = (1 - z) ⊙ h_{t-1} + z ⊙ h~
/// ```
pub struct GRU {
    input_dim: usize,
    hidden_dim: usize,
    w_z: Tensor,
    u_z: Tensor,
    b_z: Tensor,
    w_r: Tensor,
    u_r: Tensor,
    b_r: Tensor,
    w_h: Tensor,
    u_h: Tensor,
    b_h: Tensor,
    d_w_z: Tensor,
    d_u_z: Tensor,
    d_b_z: Tensor,
    d_w_r: Tensor,
    d_u_r: Tensor,
    d_b_r: Tensor,
    d_w_h: Tensor,
    d_u_h: Tensor,
    d_b_h: Tensor,
    cache: Option<GruCache>,
}

impl GRU {
    pub fn new(input_dim: usize, hidden_dim: usize) -> Result<Self> {
        if input_dim == 0 || hidden_dim == 0 {
            return Err(Error::config("GRU: dims must be > 0"));
        }
        let w = || init::scaled_uniform((hidden_dim, input_dim), input_dim);
        let u = || init::scaled_uniform((hidden_dim, hidden_dim), hidden_dim);
        let dw = || Tensor::zeros((hidden_dim, input_dim));
        let du = || Tensor::zeros((hidden_dim, hidden_dim));
        Ok(GRU {
            w_z: w(),
            u_z: u(),
            b_z: Tensor::zeros(hidden_dim),
            w_r: w(),
            u_r: u(),
            b_r: Tensor::zeros(hidden_dim),
            w_h: w(),
            u_h: u(),
            b_h: Tensor::zeros(hidden_dim),
            d_w_z: dw(),
            d_u_z: du(),
            d_b_z: Tensor::zeros(hidden_dim),
            d_w_r: dw(),
            d_u_r: du(),
            d_b_r: Tensor::zeros(hidden_dim),
            d_w_h: dw(),
            d_u_h: du(),
            d_b_h: Tensor::zeros(hidden_dim),
            input_dim,
            hidden_dim,
            cache: None,
        })
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }
}

impl Layer for GRU {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let (batch, seq) = check_seq_input("GRU", input, self.input_dim)?;
        let (in_dim, h_dim) = (self.input_dim, self.hidden_dim);

        let mut out = Tensor::zeros((batch, seq, h_dim));
        let gate_len = batch * seq * h_dim;
        let mut z_gate = vec![0.0; gate_len];
        let mut r_gate = vec![0.0; gate_len];
        let mut h_tilde = vec![0.0; gate_len];
        let mut h_hist = vec![0.0; batch * (seq + 1) * h_dim];

        let x = input.data();
        let o = out.data_mut();

        for t in 0..seq {
            for bi in 0..batch {
                let base_x = (bi * seq + t) * in_dim;
                let base_prev = (bi * (seq + 1) + t) * h_dim;
                let base_cur = (bi * (seq + 1) + t + 1) * h_dim;
                let base_gate = (bi * seq + t) * h_dim;

                // Update gate z_t
                for j in 0..h_dim {
                    let mut sum = self.b_z.data()[j];
                    for k in 0..in_dim {
                        sum += self.w_z.data()[j * in_dim + k] * x[base_x + k];
                    }
                    for k in 0..h_dim {
                        sum += self.u_z.data()[j * h_dim + k] * h_hist[base_prev + k];
                    }
                    z_gate[base_gate + j] = sigmoid(sum);
                }

                // Reset gate r_t
                for j in 0..h_dim {
                    let mut sum = self.b_r.data()[j];
                    for k in 0..in_dim {
                        sum += self.w_r.data()[j * in_dim + k] * x[base_x + k];
                    }
                    for k in 0..h_dim {
                        sum += self.u_r.data()[j * h_dim + k] * h_hist[base_prev + k];
                    }
                    r_gate[base_gate + j] = sigmoid(sum);
                }

                // Candidate h~_t — the reset gate scales the previous hidden
                // state before the recurrent projection.
                for j in 0..h_dim {
                    let mut sum = self.b_h.data()[j];
                    for k in 0..in_dim {
                        sum += self.w_h.data()[j * in_dim + k] * x[base_x + k];
                    }
                    for k in 0..h_dim {
                        let gated = r_gate[base_gate + k] * h_hist[base_prev + k];
                        sum += self.u_h.data()[j * h_dim + k] * gated;
                    }
                    h_tilde[base_gate + j] = sum.tanh();
                }

                // h_t = (1-z) h_{t-1} + z h~
                for j in 0..h_dim {
                    let z = z_gate[base_gate + j];
                    let h = (1.0 - z) * h_hist[base_prev + j] + z * h_tilde[base_gate + j];
                    h_hist[base_cur + j] = h;
                    o[(bi * seq + t) * h_dim + j] = h;
                }
            }
        }

        self.cache = Some(GruCache {
            input: input.clone(),
            z: z_gate,
            r: r_gate,
            h_tilde,
            h: h_hist,
            batch,
            seq,
        });
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let cache = self
            .cache
            .take()
            .ok_or(Error::MissingState { layer: "GRU" })?;
        let (batch, seq) = (cache.batch, cache.seq);
        let (in_dim, h_dim) = (self.input_dim, self.hidden_dim);
        if grad_out.dims() != &[batch, seq, h_dim] {
            return Err(Error::ShapeMismatch {
                expected: vole_core::Shape::from((batch, seq, h_dim)),
                got: grad_out.shape().clone(),
            });
        }

        for t in [
            &mut self.d_w_z,
            &mut self.d_u_z,
            &mut self.d_b_z,
            &mut self.d_w_r,
            &mut self.d_u_r,
            &mut self.d_b_r,
            &mut self.d_w_h,
            &mut self.d_u_h,
            &mut self.d_b_h,
        ] {
            t.zero();
        }
        let mut grad_in = Tensor::zeros(cache.input.shape().clone());

        let x = cache.input.data();
        let g = grad_out.data();
        let gi = grad_in.data_mut();

        let mut d_h_next = vec![0.0; batch * h_dim];
        let mut d_h = vec![0.0; h_dim];
        let mut d_hprev = vec![0.0; h_dim];
        let mut d_a_z = vec![0.0; h_dim];
        let mut d_a_r = vec![0.0; h_dim];
        let mut d_a_h = vec![0.0; h_dim];

        for t in (0..seq).rev() {
            for bi in 0..batch {
                let base_x = (bi * seq + t) * in_dim;
                let base_prev = (bi * (seq + 1) + t) * h_dim;
                let base_gate = (bi * seq + t) * h_dim;

                for j in 0..h_dim {
                    d_h[j] = g[(bi * seq + t) * h_dim + j] + d_h_next[bi * h_dim + j];
                }

                // h_t = (1-z) h_{t-1} + z h~ splits dH three ways; the
                // direct h_{t-1} share seeds dHprev, and the candidate and
                // update shares go through their nonlinearities.
                for j in 0..h_dim {
                    let z = cache.z[base_gate + j];
                    let h_prev = cache.h[base_prev + j];
                    let ht = cache.h_tilde[base_gate + j];

                    let d_z = d_h[j] * (ht - h_prev);
                    let d_ht = d_h[j] * z;
                    d_hprev[j] = d_h[j] * (1.0 - z);

                    d_a_h[j] = d_ht * (1.0 - ht * ht);
                    d_a_z[j] = d_z * z * (1.0 - z);
                }

                // The reset gate only acts inside the candidate's recurrent
                // term, so its gradient arrives through Uh^T · dA_h.
                for j in 0..h_dim {
                    let mut sum = 0.0;
                    for k in 0..h_dim {
                        sum += d_a_h[k] * self.u_h.data()[k * h_dim + j];
                    }
                    let r = cache.r[base_gate + j];
                    let h_prev = cache.h[base_prev + j];
                    d_a_r[j] = sum * h_prev * r * (1.0 - r);
                }

                // Candidate parameters: Uh sees the reset-gated hidden state.
                {
                    let dw = self.d_w_h.data_mut();
                    let du = self.d_u_h.data_mut();
                    let db = self.d_b_h.data_mut();
                    for j in 0..h_dim {
                        db[j] += d_a_h[j];
                        for k in 0..in_dim {
                            dw[j * in_dim + k] += d_a_h[j] * x[base_x + k];
                        }
                        for k in 0..h_dim {
                            let gated = cache.r[base_gate + k] * cache.h[base_prev + k];
                            du[j * h_dim + k] += d_a_h[j] * gated;
                        }
                    }
                }
                for (d_gate, dw, du, db) in [
                    (&d_a_z, &mut self.d_w_z, &mut self.d_u_z, &mut self.d_b_z),
                    (&d_a_r, &mut self.d_w_r, &mut self.d_u_r, &mut self.d_b_r),
                ] {
                    let dw = dw.data_mut();
                    let du = du.data_mut();
                    let db = db.data_mut();
                    for j in 0..h_dim {
                        db[j] += d_gate[j];
                        for k in 0..in_dim {
                            dw[j * in_dim + k] += d_gate[j] * x[base_x + k];
                        }
                        for k in 0..h_dim {
                            du[j * h_dim + k] += d_gate[j] * cache.h[base_prev + k];
                        }
                    }
                }

                for j in 0..in_dim {
                    let mut sum = 0.0;
                    for k in 0..h_dim {
                        sum += d_a_z[k] * self.w_z.data()[k * in_dim + j];
                        sum += d_a_r[k] * self.w_r.data()[k * in_dim + j];
                        sum += d_a_h[k] * self.w_h.data()[k * in_dim + j];
                    }
                    gi[base_x + j] = sum;
                }

                // Carry to t-1: the direct residual share plus every gate's
                // U^T contribution; the candidate's passes back through the
                // reset gate.
                for j in 0..h_dim {
                    let mut sum = d_hprev[j];
                    for k in 0..h_dim {
                        sum += d_a_z[k] * self.u_z.data()[k * h_dim + j];
                        sum += d_a_r[k] * self.u_r.data()[k * h_dim + j];
                        sum += d_a_h[k] * self.u_h.data()[k * h_dim + j] * cache.r[base_gate + j];
                    }
                    d_h_next[bi * h_dim + j] = sum;
                }
            }
        }
        Ok(grad_in)
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                value: &mut self.w_z,
                grad: &self.d_w_z,
            },
            Param {
                value: &mut self.u_z,
                grad: &self.d_u_z,
            },
            Param {
                value: &mut self.b_z,
                grad: &self.d_b_z,
            },
            Param {
                value: &mut self.w_r,
                grad: &self.d_w_r,
            },
            Param {
                value: &mut self.u_r,
                grad: &self.d_u_r,
            },
            Param {
                value: &mut self.b_r,
                grad: &self.d_b_r,
            },
            Param {
                value: &mut self.w_h,
                grad: &self.d_w_h,
            },
            Param {
                value: &mut self.u_h,
                grad: &self.d_u_h,
            },
            Param {
                value: &mut self.b_h,
                grad: &self.d_b_h,
            },
        ]
    }
}
