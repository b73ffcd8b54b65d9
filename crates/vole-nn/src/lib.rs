//! # vole-nn
//!
//! Neural network layers for Vole, each with an explicit, hand-derived
//! backward pass — there is no autodiff engine anywhere in this workspace.
//!
//! The building blocks:
//!
//! 1. **[`Layer`] trait** — `forward()` caches state, `backward()` consumes
//!    it and accumulates parameter gradients, `parameters()` exposes
//!    parameter/gradient pairs to the optimizer
//! 2. **Linear / LayerNorm / activations** — the dense primitives
//! 3. **ConvND / ConvTransposeND / AvgPoolND** — rank-generic spatial layers
//! 4. **RNN / LSTM / GRU** — recurrent layers trained through time
//! 5. **MultiHeadAttention** — self- and cross-attention
//! 6. **Sequential / Residual / Transformer blocks** — composition
//! 7. **CrossEntropyLoss** — the training objective
//!
//! Every layer instance follows a strict forward-then-backward contract:
//! a second `forward` replaces the cached state, and `backward` without a
//! fresh forward fails with [`vole_core::Error::MissingState`].

pub mod activation;
pub mod attention;
pub mod conv;
pub mod dropout;
pub mod embedding;
pub mod feedforward;
pub mod flatten;
pub mod init;
pub mod layer;
pub mod layernorm;
pub mod linear;
pub mod loss;
pub mod pool;
pub mod positional;
pub mod residual;
pub mod rnn;
pub mod sequential;
pub mod transformer;

pub use activation::{Gelu, LeakyReLU, ReLU, Sigmoid, Softmax, Softplus, Tanh};
pub use attention::MultiHeadAttention;
pub use conv::{ConvND, ConvTransposeND};
pub use dropout::Dropout;
pub use embedding::Embedding;
pub use feedforward::FeedForward;
pub use flatten::Flatten;
pub use layer::{Layer, Param};
pub use layernorm::LayerNorm;
pub use linear::Linear;
pub use loss::CrossEntropyLoss;
pub use pool::AvgPoolND;
pub use positional::PositionalEncoding;
pub use residual::Residual;
pub use rnn::{GRU, LSTM, RNN};
pub use sequential::Sequential;
pub use transformer::{TransformerDecoder, TransformerEncoder, TransformerModel};
