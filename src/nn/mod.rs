//! Neural network layers.
//!
//! - [`Linear`]: `y = x W^T + b` over the last dimension.
//! - [`RMSNorm`]: root-mean-square normalization with a learned per-channel scale.
//! - [`Activation`]: SiLU and the SwiGLU gate.
//! - [`Dropout`] and [`Mode`]: seeded inverted dropout, active only in training mode.
//! - [`transformer`]: rotary embeddings, grouped-query attention, the gated feed-forward
//!   network and the transformer block.

pub mod activation;
pub mod dropout;
pub mod linear;
pub mod module;
pub mod norm;
pub mod transformer;

pub use activation::Activation;
pub use dropout::{Dropout, DropoutSite, Mode};
pub use linear::Linear;
pub use module::Module;
pub use norm::RMSNorm;
