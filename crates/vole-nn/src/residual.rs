// Residual — y = x + f(x)
//
// The wrapped layer learns a correction on top of the identity, and the sum
// gives the gradient a direct path around it: both branches receive the
// incoming gradient, and backward returns their sum.

use vole_core::error::Result;
use vole_core::tensor::Tensor;

use crate::layer::{Layer, Param};

/// Residual connection around an inner layer.
pub struct Residual {
    inner: Box<dyn Layer>,
}

impl Residual {
    pub fn new<L: Layer + 'static>(inner: L) -> Self {
        Residual {
            inner: Box::new(inner),
        }
    }
}

impl Layer for Residual {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let out = self.inner.forward(input)?;
        input.add(&out)
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let grad_inner = self.inner.backward(grad_out)?;
        grad_out.add(&grad_inner)
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        self.inner.parameters()
    }

    fn set_training(&mut self, training: bool) {
        self.inner.set_training(training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::Linear;

    #[test]
    fn test_zero_inner_is_identity() {
        let linear = Linear::from_tensors(Tensor::zeros((3, 3)), Tensor::zeros(3)).unwrap();
        let mut res = Residual::new(linear);
        let x = Tensor::from_vec(vec![1.0, 2.0, 3.0], (1, 3)).unwrap();
        let y = res.forward(&x).unwrap();
        assert_eq!(y.data(), x.data());
    }
}
