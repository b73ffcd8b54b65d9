//! # Vole
//!
//! A manually-differentiated neural network framework built from scratch in
//! Rust. Every layer computes a forward transform and an explicit,
//! hand-derived backward transform — reverse-mode differentiation by
//! composition, with no autograd engine.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use vole::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `vole-core`  | Tensor, Shape, Matrix (2-D form), errors |
//! | `vole-nn`    | Layers: Linear, LayerNorm, ConvND, RNN/LSTM/GRU, attention, transformers |
//! | `vole-optim` | Adam optimizer |

/// Re-export core types.
pub use vole_core::{Error, Matrix, Result, Shape, Tensor};

/// Re-export neural network layers.
pub mod nn {
    pub use vole_nn::*;
}

/// Re-export optimizers.
pub mod optim {
    pub use vole_optim::*;
}

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::nn::{
        AvgPoolND, ConvND, ConvTransposeND, CrossEntropyLoss, Dropout, Embedding, FeedForward,
        Flatten, Gelu, Layer, LayerNorm, LeakyReLU, Linear, MultiHeadAttention, Param,
        PositionalEncoding, ReLU, Residual, Sequential, Sigmoid, Softmax, Softplus, Tanh,
        TransformerDecoder, TransformerEncoder, TransformerModel, GRU, LSTM, RNN,
    };
    pub use crate::optim::Adam;
    pub use crate::{Error, Matrix, Result, Shape, Tensor};
}
