// nn::init — Parameter Initialization Utilities
//
// Standalone functions for creating initialized tensors. Every weight in the
// framework starts from the same zero-mean bounded scheme: U(-k, k) with
// k = 1/sqrt(fan_in), which keeps activation magnitudes roughly constant
// through linear-style layers. Biases start at zero.

use rand::Rng;
use vole_core::shape::Shape;
use vole_core::tensor::Tensor;

/// Initialize a tensor from a uniform distribution U(low, high).
pub fn uniform(shape: impl Into<Shape>, low: f64, high: f64) -> Tensor {
    let mut rng = rand::thread_rng();
    let mut t = Tensor::zeros(shape);
    for v in t.data_mut() {
        *v = rng.gen::<f64>() * (high - low) + low;
    }
    t
}

/// The default weight initialization: U(-k, k) with k = 1/sqrt(fan_in).
///
/// `fan_in` is the number of inputs feeding each output unit — the input
/// feature count for dense layers, `in_channels * kernel_volume` for
/// convolutions.
pub fn scaled_uniform(shape: impl Into<Shape>, fan_in: usize) -> Tensor {
    let k = 1.0 / (fan_in.max(1) as f64).sqrt();
    uniform(shape, -k, k)
}

/// Initialize a tensor with all zeros.
pub fn zeros(shape: impl Into<Shape>) -> Tensor {
    Tensor::zeros(shape)
}

/// Initialize a tensor with all ones.
pub fn ones(shape: impl Into<Shape>) -> Tensor {
    Tensor::ones(shape)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_range() {
        let t = uniform((1000,), -2.0, 3.0);
        for &x in t.data() {
            assert!(x >= -2.0 && x <= 3.0);
        }
    }

    #[test]
    fn test_scaled_uniform_bounds() {
        let t = scaled_uniform((50, 100), 100);
        let bound = 1.0 / 100.0_f64.sqrt();
        for &x in t.data() {
            assert!(
                x >= -bound && x <= bound,
                "value {} out of bounds [-{}, {}]",
                x,
                bound,
                bound
            );
        }
    }

    #[test]
    fn test_scaled_uniform_is_zero_mean_ish() {
        let t = scaled_uniform((10000,), 4);
        let mean: f64 = t.data().iter().sum::<f64>() / t.elem_count() as f64;
        assert!(mean.abs() < 0.05, "mean {} too far from 0", mean);
    }
}
