//! # vole-core
//!
//! Core tensor primitives for Vole.
//!
//! This crate provides:
//! - [`Tensor`] — n-dimensional strided array with owned row-major storage
//! - [`Shape`] — shape, contiguous strides, and flat-index unraveling
//! - [`Matrix`] — the simplified 2-D representation and its conversion
//!   boundary with [`Tensor`]
//! - [`Error`] / [`Result`] — the single error type shared by the workspace
//!
//! Everything executes eagerly on the CPU in `f64`. Tensors never alias:
//! each operation returns a freshly allocated buffer, which is what lets
//! the hand-written backward passes in `vole-nn` mutate gradients in place.

pub mod error;
pub mod matrix;
pub mod shape;
pub mod tensor;

pub use error::{Error, Result};
pub use matrix::Matrix;
pub use shape::Shape;
pub use tensor::Tensor;
