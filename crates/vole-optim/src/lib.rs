//! # vole-optim
//!
//! Optimizers for Vole. The boundary contract is deliberately thin: an
//! optimizer consumes opaque `(parameter, gradient)` pairs — the [`Param`]
//! type from `vole-nn` — and mutates the parameters in place.
//!
//! [`Param`]: vole_nn::layer::Param

pub mod adam;

pub use adam::Adam;
