// Dropout — regularization by random zeroing
//
// In training mode each element is kept with probability 1-p and scaled by
// 1/(1-p) (inverted dropout), so the expected activation magnitude matches
// eval mode and inference needs no rescaling. Backward reapplies the exact
// mask cached by forward.

use rand::Rng;
use vole_core::error::{Error, Result};
use vole_core::tensor::Tensor;

use crate::layer::Layer;

/// Inverted dropout layer.
pub struct Dropout {
    p: f64,
    training: bool,
    /// Keep mask of the last training-mode forward (1 = keep, 0 = drop).
    last_mask: Option<Vec<f64>>,
}

impl Dropout {
    /// Create a Dropout layer with drop probability `p` in [0, 1).
    pub fn new(p: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(Error::config(format!(
                "Dropout: p must be in [0, 1), got {}",
                p
            )));
        }
        Ok(Dropout {
            p,
            training: true,
            last_mask: None,
        })
    }

    pub fn p(&self) -> f64 {
        self.p
    }
}

impl Layer for Dropout {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        if !self.training {
            self.last_mask = None;
            return Ok(input.clone());
        }

        let mut rng = rand::thread_rng();
        let scale = 1.0 / (1.0 - self.p);
        let mut mask = vec![0.0; input.elem_count()];
        let mut out = input.clone();
        for (m, v) in mask.iter_mut().zip(out.data_mut().iter_mut()) {
            let keep = rng.gen::<f64>() > self.p;
            *m = if keep { 1.0 } else { 0.0 };
            *v *= *m * scale;
        }
        self.last_mask = Some(mask);
        Ok(out)
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        if !self.training {
            return Ok(grad_out.clone());
        }
        let mask = self
            .last_mask
            .take()
            .ok_or(Error::MissingState { layer: "Dropout" })?;
        let scale = 1.0 / (1.0 - self.p);
        let mut grad = grad_out.clone();
        for (g, m) in grad.data_mut().iter_mut().zip(mask.iter()) {
            *g *= m * scale;
        }
        Ok(grad)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}
