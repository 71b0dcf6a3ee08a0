//! # llama-blocks
//!
//! `llama-blocks` is a pure Rust CPU implementation of the forward pass of a decoder-only
//! transformer layer stack in the Llama family: RMS normalization, rotary grouped-query
//! self-attention with a causal mask, and a SwiGLU gated feed-forward network, composed into
//! pre-norm residual blocks.
//!
//! Weights are supplied by the caller; the crate never initializes or persists them.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: owned N-dimensional tensors and borrowed strided views.
//! - [`nn`]: layers (`Linear`, `RMSNorm`, `Dropout`) and the transformer components.
//! - [`model`]: configuration and the block stack entry point.
//! - [`error`]: the crate-wide error type.
//!
//! ## Example
//!
//! ```rust
//! use llama_blocks::model::{BlockStack, ModelConfig};
//! use llama_blocks::nn::{Mode, transformer::BlockWeights};
//! use llama_blocks::tensor::Tensor;
//!
//! let config = ModelConfig {
//!     dim: 8,
//!     n_layers: 1,
//!     n_heads: 2,
//!     n_kv_heads: Some(1),
//!     multiple_of: 4,
//!     max_seq_len: 16,
//!     ..ModelConfig::default()
//! };
//! let layers = vec![BlockWeights::<f32>::zeros(&config).unwrap()];
//! let stack = BlockStack::new(&config, layers).unwrap();
//!
//! let x = Tensor::<f32, 3>::ones([1, 3, 8]);
//! let y = stack.forward(&x, Mode::Inference).unwrap();
//! assert_eq!(y.shape(), x.shape());
//! ```

/// Creates a Tensor with compile-time shape checking.
///
/// ```rust
/// use llama_blocks::tensor;
///
/// let t = tensor!([1.0, 2.0, 3.0, 4.0], [2, 2]);
/// assert_eq!(t.shape(), &[2, 2]);
///
/// // Fails to compile:
/// // let t = tensor!([1.0, 2.0, 3.0], [2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($data:expr, $shape:expr) => {{
        const DATA_LEN: usize = $data.len();
        const SHAPE: [usize; $shape.len()] = $shape;
        const EXPECTED_SIZE: usize = {
            let mut size = 1;
            let mut i = 0;
            while i < SHAPE.len() {
                size *= SHAPE[i];
                i += 1;
            }
            size
        };

        const _: () = assert!(
            DATA_LEN == EXPECTED_SIZE,
            "Shape mismatch: data length does not match shape product"
        );

        match $crate::tensor::Tensor::new($data.to_vec(), SHAPE) {
            Ok(t) => t,
            Err(_) => unreachable!("length checked at compile time"),
        }
    }};
}

pub mod error;
pub mod model;
pub mod nn;
pub mod tensor;

pub use error::{Error, Result};
pub use model::{BlockStack, ModelConfig};
pub use nn::Mode;
pub use tensor::Tensor;

/// Re-export of `tracing` so callers can install a subscriber against the same version.
pub use tracing;
