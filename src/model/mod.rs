//! Model-level entry points: configuration and the block stack.

pub mod config;
pub mod stack;

pub use config::ModelConfig;
pub use stack::BlockStack;
