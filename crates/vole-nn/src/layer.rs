// Layer trait — The interface every neural network layer implements
//
// There is no autograd tape in this framework. Each layer pairs its forward
// transform with an explicit, hand-derived backward transform: `forward`
// caches whatever intermediate state the gradient math needs, and `backward`
// consumes that state to turn the gradient w.r.t. the output into the
// gradient w.r.t. the input, accumulating parameter gradients as a side
// effect.
//
// STATE CONTRACT (single forward, then single backward):
//
// A layer instance is not reentrant. Calling `forward` overwrites the cached
// state of any previous call, and `backward` consumes the cache it finds —
// so the only valid call pattern per instance is strict
// forward-then-backward alternation. Violations do not compute on stale
// data: `backward` without a cached forward returns
// `Error::MissingState`, including a second `backward` in a row.
//
// WHY A TRAIT?
//
// Composition containers (Sequential, the transformer blocks) need to hold
// heterogeneous layers and drive them through a fixed capability set:
// forward, backward, parameters. A closed trait replaces duck-typed layer
// lists probed for `weight`/`dW` fields.

use vole_core::error::Result;
use vole_core::tensor::Tensor;

/// A parameter tensor paired with its gradient accumulator.
///
/// The two always travel together so an optimizer can never mis-align a
/// parameter list against a separately collected gradient list. `value` is
/// mutable (optimizers update in place); `grad` is read-only — only the
/// owning layer's `backward` writes it.
pub struct Param<'a> {
    pub value: &'a mut Tensor,
    pub grad: &'a Tensor,
}

/// The fundamental trait for all neural network layers.
///
/// Every layer in Vole implements this trait, providing:
/// - `forward()`: compute output from input, caching state for backward
/// - `backward()`: consume the cached state, return the input gradient,
///   and accumulate parameter gradients (zeroed at the start of the call)
/// - `parameters()`: parameter/gradient pairs for optimizer updates
///
/// # Example
/// ```ignore
/// let mut layer = Linear::new(4, 2);
/// let y = layer.forward(&x)?;
/// let dx = layer.backward(&dy)?;
/// optimizer.step(layer.parameters())?;
/// ```
pub trait Layer {
    /// Compute the output tensor from the input tensor, caching whatever
    /// the backward pass will need.
    fn forward(&mut self, input: &Tensor) -> Result<Tensor>;

    /// Propagate the gradient w.r.t. this layer's output back to a gradient
    /// w.r.t. its input. Parameter gradients are zeroed and re-accumulated
    /// during the call.
    fn backward(&mut self, grad_out: &Tensor) -> Result<Tensor>;

    /// Parameter/gradient pairs of this layer, in a stable order.
    /// Layers without trainable parameters return an empty vec.
    fn parameters(&mut self) -> Vec<Param<'_>> {
        Vec::new()
    }

    /// Set training or evaluation mode. Default is a no-op; layers that
    /// behave differently per mode (Dropout) override it.
    fn set_training(&mut self, _training: bool) {}

    /// Total number of scalar parameters in this layer.
    fn num_parameters(&mut self) -> usize {
        self.parameters().iter().map(|p| p.value.elem_count()).sum()
    }
}
