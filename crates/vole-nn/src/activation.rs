// Activations — elementwise nonlinearities with hand-written derivatives
//
// Each activation is a small stateful layer: forward caches the input
// (Softmax caches its output instead — its derivative is cheapest to express
// in terms of the probabilities), backward applies the pointwise local
// derivative to the incoming gradient.

use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;

use crate::layer::Layer;

/// Scalar logistic sigmoid, shared with the recurrent cells.
pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Rectified Linear Unit: `max(0, x)`.
#[derive(Default)]
pub struct ReLU {
    last_input: Option<Tensor>,
}

impl ReLU {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for ReLU {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.last_input = Some(input.clone());
        Ok(input.map(|v| if v > 0.0 { v } else { 0.0 }))
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let x = self
            .last_input
            .take()
            .ok_or(Error::MissingState { layer: "ReLU" })?;
        let data = x
            .data()
            .iter()
            .zip(grad_out.data().iter())
            .map(|(&x, &g)| if x > 0.0 { g } else { 0.0 })
            .collect();
        Tensor::from_vec(data, x.shape().clone())
    }
}

/// Logistic sigmoid: `1 / (1 + e^-x)`.
#[derive(Default)]
pub struct Sigmoid {
    last_input: Option<Tensor>,
}

impl Sigmoid {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for Sigmoid {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.last_input = Some(input.clone());
        Ok(input.map(sigmoid))
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let x = self
            .last_input
            .take()
            .ok_or(Error::MissingState { layer: "Sigmoid" })?;
        // d/dx sigmoid = s * (1 - s)
        let data = x
            .data()
            .iter()
            .zip(grad_out.data().iter())
            .map(|(&x, &g)| {
                let s = sigmoid(x);
                g * s * (1.0 - s)
            })
            .collect();
        Tensor::from_vec(data, x.shape().clone())
    }
}

/// Hyperbolic tangent.
#[derive(Default)]
pub struct Tanh {
    last_input: Option<Tensor>,
}

impl Tanh {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for Tanh {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.last_input = Some(input.clone());
        Ok(input.map(f64::tanh))
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let x = self
            .last_input
            .take()
            .ok_or(Error::MissingState { layer: "Tanh" })?;
        // d/dx tanh = 1 - tanh²
        let data = x
            .data()
            .iter()
            .zip(grad_out.data().iter())
            .map(|(&x, &g)| {
                let t = x.tanh();
                g * (1.0 - t * t)
            })
            .collect();
        Tensor::from_vec(data, x.shape().clone())
    }
}

/// GELU, tanh approximation:
/// `0.5 * x * (1 + tanh(sqrt(2/π) * (x + 0.044715 x³)))`.
#[derive(Default)]
pub struct Gelu {
    last_input: Option<Tensor>,
}

impl Gelu {
    pub fn new() -> Self {
        Self::default()
    }
}

const GELU_C: f64 = 0.044715;

impl Layer for Gelu {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.last_input = Some(input.clone());
        let k = (2.0 / std::f64::consts::PI).sqrt();
        Ok(input.map(|v| 0.5 * v * (1.0 + (k * (v + GELU_C * v * v * v)).tanh())))
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let x = self
            .last_input
            .take()
            .ok_or(Error::MissingState { layer: "Gelu" })?;
        let k = (2.0 / std::f64::consts::PI).sqrt();
        let data = x
            .data()
            .iter()
            .zip(grad_out.data().iter())
            .map(|(&v, &g)| {
                let inner = k * (v + GELU_C * v * v * v);
                let t = inner.tanh();
                let sech2 = 1.0 - t * t;
                let inner_deriv = k * (1.0 + 3.0 * GELU_C * v * v);
                g * (0.5 * (1.0 + t) + 0.5 * v * sech2 * inner_deriv)
            })
            .collect();
        Tensor::from_vec(data, x.shape().clone())
    }
}

/// LeakyReLU with configurable negative slope.
pub struct LeakyReLU {
    alpha: f64,
    last_input: Option<Tensor>,
}

impl LeakyReLU {
    pub fn new(alpha: f64) -> Self {
        LeakyReLU {
            alpha,
            last_input: None,
        }
    }
}

impl Layer for LeakyReLU {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.last_input = Some(input.clone());
        let alpha = self.alpha;
        Ok(input.map(|v| if v > 0.0 { v } else { alpha * v }))
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let x = self
            .last_input
            .take()
            .ok_or(Error::MissingState { layer: "LeakyReLU" })?;
        let data = x
            .data()
            .iter()
            .zip(grad_out.data().iter())
            .map(|(&x, &g)| if x > 0.0 { g } else { self.alpha * g })
            .collect();
        Tensor::from_vec(data, x.shape().clone())
    }
}

/// Softplus: `ln(1 + e^x)`, a smooth ReLU. Its derivative is the sigmoid.
#[derive(Default)]
pub struct Softplus {
    last_input: Option<Tensor>,
}

impl Softplus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for Softplus {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.last_input = Some(input.clone());
        Ok(input.map(|v| (1.0 + v.exp()).ln()))
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let x = self
            .last_input
            .take()
            .ok_or(Error::MissingState { layer: "Softplus" })?;
        let data = x
            .data()
            .iter()
            .zip(grad_out.data().iter())
            .map(|(&x, &g)| g * sigmoid(x))
            .collect();
        Tensor::from_vec(data, x.shape().clone())
    }
}

// Softmax

/// Apply a numerically-stable softmax to one row of a flat buffer in place:
/// subtract the row max before exponentiating, then normalize.
pub(crate) fn softmax_row(data: &mut [f64]) {
    let mut max_val = f64::NEG_INFINITY;
    for &v in data.iter() {
        if v > max_val {
            max_val = v;
        }
    }
    let mut sum = 0.0;
    for v in data.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    for v in data.iter_mut() {
        *v /= sum;
    }
}

/// Softmax over the last dimension.
///
/// Forward caches the output probabilities; backward applies the closed-form
/// softmax Jacobian-vector product row-wise:
/// `dx_j = p_j * (g_j - Σ_k g_k p_k)`.
#[derive(Default)]
pub struct Softmax {
    last_output: Option<Tensor>,
}

impl Softmax {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for Softmax {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let rank = input.rank();
        if rank == 0 {
            return Err(Error::RankMismatch {
                expected: 1,
                got: 0,
            });
        }
        let last_dim = input.dims()[rank - 1];
        let mut out = input.clone();
        for row in out.data_mut().chunks_mut(last_dim) {
            softmax_row(row);
        }
        self.last_output = Some(out.clone());
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let probs = self
            .last_output
            .take()
            .ok_or(Error::MissingState { layer: "Softmax" })?;
        let last_dim = probs.dims()[probs.rank() - 1];
        let mut grad = Tensor::zeros(probs.shape().clone());
        for ((g_row, p_row), out_row) in grad_out
            .data()
            .chunks(last_dim)
            .zip(probs.data().chunks(last_dim))
            .zip(grad.data_mut().chunks_mut(last_dim))
        {
            let dot: f64 = g_row.iter().zip(p_row.iter()).map(|(g, p)| g * p).sum();
            for j in 0..last_dim {
                out_row[j] = p_row[j] * (g_row[j] - dot);
            }
        }
        Ok(grad)
    }
}
