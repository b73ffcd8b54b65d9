// Flatten — collapse everything after the batch dimension
//
// [batch, d1, d2, ...] → [batch, d1*d2*...]. The data is already flat in
// row-major order, so forward is a reshape; backward reshapes the gradient
// back to the remembered input shape.

use vole_core::error::{Error, Result};
use vole_core::shape::Shape;
use vole_core::tensor::Tensor;

use crate::layer::Layer;

/// Flattens all dimensions except the leading batch dimension.
#[derive(Default)]
pub struct Flatten {
    last_shape: Option<Shape>,
}

impl Flatten {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for Flatten {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        if input.rank() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: input.rank(),
            });
        }
        self.last_shape = Some(input.shape().clone());
        let batch = input.dims()[0];
        let flat: usize = input.dims()[1..].iter().product();
        input.reshape((batch, flat))
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let shape = self
            .last_shape
            .take()
            .ok_or(Error::MissingState { layer: "Flatten" })?;
        grad_out.reshape(shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_round_trip() {
        let mut flatten = Flatten::new();
        let x = Tensor::from_vec((0..24).map(|i| i as f64).collect(), (2, 3, 4)).unwrap();
        let y = flatten.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 12]);
        let g = flatten.backward(&y).unwrap();
        assert_eq!(g.dims(), &[2, 3, 4]);
        assert_eq!(g.data(), x.data());
    }
}
