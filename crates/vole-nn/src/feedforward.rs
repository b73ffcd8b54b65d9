// FeedForward — Linear → activation → Linear
//
// The position-wise MLP used inside transformer blocks: expand to a hidden
// dimension, apply a nonlinearity, compress back. Applied independently to
// every position.

use vole_core::error::Result;
use vole_core::tensor::Tensor;

use crate::layer::{Layer, Param};
use crate::linear::Linear;

/// Two-layer position-wise feed-forward network.
pub struct FeedForward {
    layer1: Linear,
    activation: Box<dyn Layer>,
    layer2: Linear,
}

impl FeedForward {
    /// Build `input_dim → hidden_dim → output_dim` around an activation.
    pub fn new<A: Layer + 'static>(
        input_dim: usize,
        hidden_dim: usize,
        output_dim: usize,
        activation: A,
    ) -> Self {
        FeedForward {
            layer1: Linear::new(input_dim, hidden_dim),
            activation: Box::new(activation),
            layer2: Linear::new(hidden_dim, output_dim),
        }
    }
}

impl Layer for FeedForward {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let h = self.layer1.forward(input)?;
        let h = self.activation.forward(&h)?;
        self.layer2.forward(&h)
    }

    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor> {
        let g = self.layer2.backward(grad_out)?;
        let g = self.activation.backward(&g)?;
        self.layer1.backward(&g)
    }

    fn parameters(&mut self) -> Vec<Param<'_>> {
        let mut params = self.layer1.parameters();
        params.extend(self.layer2.parameters());
        params
    }
}
