//! Transformer components.
//!
//! - [`RotaryTable`]: precomputed rotary position tables.
//! - [`GroupedQueryAttention`]: causal self-attention with shared key/value heads, generic
//!   over an [`AttentionKernel`].
//! - [`GatedFeedForward`]: the SwiGLU network.
//! - [`TransformerBlock`]: pre-norm residual composition of the two.

pub mod attention;
pub mod block;
pub mod feed_forward;
pub mod kernels;
pub mod rope;

pub use attention::{GroupedQueryAttention, repeat_kv};
pub use block::{BlockWeights, TransformerBlock};
pub use feed_forward::{GatedFeedForward, ffn_hidden_dim};
pub use kernels::{
    AttendParams, AttentionKernel, DefaultAttention, ExplicitAttention, FusedAttention,
};
pub use rope::{RotaryTable, apply_rotary};
