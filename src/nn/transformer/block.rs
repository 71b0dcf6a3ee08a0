use super::attention::GroupedQueryAttention;
use super::feed_forward::GatedFeedForward;
use super::kernels::{AttentionKernel, DefaultAttention};
use super::rope::RotaryTable;
use crate::error::{Error, Result};
use crate::model::ModelConfig;
use crate::nn::{Linear, Mode, Module, RMSNorm};
use crate::tensor::{Tensor, TensorElem};
use num_traits::Float;

/// Caller-supplied parameters of one transformer block, in `[out, in]` layout.
#[derive(Debug, Clone)]
pub struct BlockWeights<T: TensorElem> {
    /// `[dim]`
    pub attention_norm: Tensor<T, 1>,
    /// `[n_heads * head_dim, dim]`
    pub wq: Tensor<T, 2>,
    /// `[n_kv_heads * head_dim, dim]`
    pub wk: Tensor<T, 2>,
    /// `[n_kv_heads * head_dim, dim]`
    pub wv: Tensor<T, 2>,
    /// `[dim, n_heads * head_dim]`
    pub wo: Tensor<T, 2>,
    /// `[dim]`
    pub ffn_norm: Tensor<T, 1>,
    /// Gate, `[hidden, dim]`
    pub w1: Tensor<T, 2>,
    /// Down, `[dim, hidden]`
    pub w2: Tensor<T, 2>,
    /// Up, `[hidden, dim]`
    pub w3: Tensor<T, 2>,
}

impl<T: TensorElem> BlockWeights<T> {
    /// Zero projections and unit norm scales, shaped for `config`. Such a block is the
    /// identity map.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `config` is invalid.
    pub fn zeros(config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        let dim = config.dim;
        let q_dim = config.n_heads * config.head_dim();
        let kv_dim = config.n_kv_heads() * config.head_dim();
        let hidden = config.ffn_hidden_dim()?;
        Ok(Self {
            attention_norm: Tensor::ones([dim]),
            wq: Tensor::zeros([q_dim, dim]),
            wk: Tensor::zeros([kv_dim, dim]),
            wv: Tensor::zeros([kv_dim, dim]),
            wo: Tensor::zeros([dim, q_dim]),
            ffn_norm: Tensor::ones([dim]),
            w1: Tensor::zeros([hidden, dim]),
            w2: Tensor::zeros([dim, hidden]),
            w3: Tensor::zeros([hidden, dim]),
        })
    }
}

/// Pre-norm residual block:
///
/// ```text
/// h   = x + attention(attention_norm(x))
/// out = h + feed_forward(ffn_norm(h))
/// ```
#[derive(Debug, Clone)]
pub struct TransformerBlock<T: TensorElem, K: AttentionKernel = DefaultAttention> {
    pub attention: GroupedQueryAttention<T, K>,
    pub feed_forward: GatedFeedForward<T>,
    pub attention_norm: RMSNorm<T>,
    pub ffn_norm: RMSNorm<T>,
    layer_id: usize,
}

impl<T: TensorElem + Float> TransformerBlock<T, DefaultAttention> {
    pub fn new(config: &ModelConfig, layer_id: usize, weights: BlockWeights<T>) -> Result<Self> {
        Self::with_kernel(config, layer_id, weights, DefaultAttention::default())
    }
}

impl<T: TensorElem + Float, K: AttentionKernel> TransformerBlock<T, K> {
    /// Assembles block `layer_id` from `weights`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `config` is invalid or a weight does not have the
    /// shape `config` implies.
    pub fn with_kernel(
        config: &ModelConfig,
        layer_id: usize,
        weights: BlockWeights<T>,
        kernel: K,
    ) -> Result<Self> {
        config.validate()?;

        let BlockWeights {
            attention_norm,
            wq,
            wk,
            wv,
            wo,
            ffn_norm,
            w1,
            w2,
            w3,
        } = weights;

        let eps = config.norm_eps_as::<T>()?;
        let attention_norm = norm(attention_norm, eps, config.dim, "attention_norm")?;
        let ffn_norm = norm(ffn_norm, eps, config.dim, "ffn_norm")?;

        let attention = GroupedQueryAttention::with_kernel(
            config.n_heads,
            config.n_kv_heads(),
            Linear::new(wq, None)?,
            Linear::new(wk, None)?,
            Linear::new(wv, None)?,
            Linear::new(wo, None)?,
            kernel,
        )?
        .with_dropout(config.dropout, layer_id)?;
        if attention.dim() != config.dim {
            return Err(Error::InvalidConfig(format!(
                "wq takes {} channels, config.dim is {}",
                attention.dim(),
                config.dim
            )));
        }

        let feed_forward = GatedFeedForward::new(
            Linear::new(w1, None)?,
            Linear::new(w2, None)?,
            Linear::new(w3, None)?,
        )?
        .with_dropout(config.dropout, layer_id)?;
        let hidden = config.ffn_hidden_dim()?;
        if feed_forward.dim() != config.dim || feed_forward.hidden_dim() != hidden {
            return Err(Error::InvalidConfig(format!(
                "feed-forward is [{}, {}], config implies [{}, {}]",
                feed_forward.hidden_dim(),
                feed_forward.dim(),
                hidden,
                config.dim
            )));
        }

        Ok(Self {
            attention,
            feed_forward,
            attention_norm,
            ffn_norm,
            layer_id,
        })
    }

    pub fn layer_id(&self) -> usize {
        self.layer_id
    }

    /// Applies the block to `x` (`[batch, seq, dim]`).
    pub fn forward(
        &self,
        x: &Tensor<T, 3>,
        rope: &RotaryTable<T>,
        mode: Mode,
    ) -> Result<Tensor<T, 3>> {
        let attn = self
            .attention
            .forward(&self.attention_norm.forward(x)?, rope, mode)?;
        let h = (x + &attn)?;
        let ffn = self.feed_forward.forward(&self.ffn_norm.forward(&h)?, mode)?;
        &h + &ffn
    }
}

impl<T: TensorElem, K: AttentionKernel> Module<T> for TransformerBlock<T, K> {
    fn num_parameters(&self) -> usize {
        self.attention.num_parameters()
            + self.feed_forward.num_parameters()
            + self.attention_norm.num_parameters()
            + self.ffn_norm.num_parameters()
    }
}

fn norm<T: TensorElem + Float>(
    weight: Tensor<T, 1>,
    eps: T,
    dim: usize,
    name: &str,
) -> Result<RMSNorm<T>> {
    if weight.shape()[0] != dim {
        return Err(Error::InvalidConfig(format!(
            "{} must be [{}], got {:?}",
            name,
            dim,
            weight.shape()
        )));
    }
    Ok(RMSNorm::new(weight, eps))
}
