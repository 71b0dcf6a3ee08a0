use crate::error::{Error, Result};
use crate::model::ModelConfig;
use crate::nn::transformer::{
    AttentionKernel, BlockWeights, DefaultAttention, RotaryTable, TransformerBlock,
};
use crate::nn::{Mode, Module, RMSNorm};
use crate::tensor::{Tensor, TensorElem};
use num_traits::Float;
use tracing::{debug, trace, trace_span};

/// `n_layers` transformer blocks applied in order, sharing one rotary table.
///
/// An optional final RMSNorm can be attached with [`BlockStack::with_final_norm`]; without
/// it the stack returns the last block's residual stream unchanged.
#[derive(Debug, Clone)]
pub struct BlockStack<T: TensorElem, K: AttentionKernel = DefaultAttention> {
    config: ModelConfig,
    rope: RotaryTable<T>,
    layers: Vec<TransformerBlock<T, K>>,
    final_norm: Option<RMSNorm<T>>,
}

impl<T: TensorElem + Float> BlockStack<T, DefaultAttention> {
    /// Builds the stack with the default attention strategy.
    ///
    /// `layers[i]` holds the weights of block `i`.
    pub fn new(config: &ModelConfig, layers: Vec<BlockWeights<T>>) -> Result<Self> {
        Self::with_kernel(config, layers, DefaultAttention::default())
    }
}

impl<T: TensorElem + Float, K: AttentionKernel> BlockStack<T, K> {
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `config` is invalid, the number of weight sets is not
    /// `config.n_layers`, or any weight has the wrong shape.
    pub fn with_kernel(
        config: &ModelConfig,
        layers: Vec<BlockWeights<T>>,
        kernel: K,
    ) -> Result<Self> {
        config.validate()?;
        if layers.len() != config.n_layers {
            return Err(Error::InvalidConfig(format!(
                "expected {} layer weight sets, got {}",
                config.n_layers,
                layers.len()
            )));
        }

        let rope = RotaryTable::build(config.head_dim(), config.max_seq_len, config.rope_theta)?;
        let layers = layers
            .into_iter()
            .enumerate()
            .map(|(i, w)| TransformerBlock::with_kernel(config, i, w, kernel.clone()))
            .collect::<Result<Vec<_>>>()?;
        let hidden_dim = config.ffn_hidden_dim()?;

        debug!(
            n_layers = config.n_layers,
            dim = config.dim,
            n_heads = config.n_heads,
            n_kv_heads = config.n_kv_heads(),
            hidden_dim,
            strategy = K::NAME,
            "block stack built"
        );

        Ok(Self {
            config: config.clone(),
            rope,
            layers,
            final_norm: None,
        })
    }

    /// Attaches a final RMSNorm (`[dim]` scale) applied after the last block.
    pub fn with_final_norm(mut self, weight: Tensor<T, 1>) -> Result<Self> {
        if weight.shape()[0] != self.config.dim {
            return Err(Error::InvalidConfig(format!(
                "final norm must be [{}], got {:?}",
                self.config.dim,
                weight.shape()
            )));
        }
        let eps = self.config.norm_eps_as::<T>()?;
        self.final_norm = Some(RMSNorm::new(weight, eps));
        Ok(self)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn rope(&self) -> &RotaryTable<T> {
        &self.rope
    }

    pub fn layers(&self) -> &[TransformerBlock<T, K>] {
        &self.layers
    }

    /// Runs `x` (`[batch, seq, dim]`) through every block.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShapeMismatch` if the channel width is not `dim` or `seq` exceeds
    /// `max_seq_len`.
    pub fn forward(&self, x: &Tensor<T, 3>, mode: Mode) -> Result<Tensor<T, 3>> {
        self.forward_with_rotary(x, &self.rope, mode)
    }

    /// Like [`forward`](Self::forward) with a caller-provided rotary table, which must match
    /// the head width and cover the sequence.
    pub fn forward_with_rotary(
        &self,
        x: &Tensor<T, 3>,
        rope: &RotaryTable<T>,
        mode: Mode,
    ) -> Result<Tensor<T, 3>> {
        let [b, s, c] = *x.shape();
        if c != self.config.dim {
            return Err(Error::ShapeMismatch {
                expected: vec![b, s, self.config.dim],
                got: vec![b, s, c],
            });
        }
        if s > rope.max_seq_len() {
            return Err(Error::ShapeMismatch {
                expected: vec![b, rope.max_seq_len(), c],
                got: vec![b, s, c],
            });
        }
        trace!(batch = b, seq = s, training = mode.is_training(), "stack forward");

        let mut h = x.clone();
        for layer in &self.layers {
            let _span = trace_span!("block", layer = layer.layer_id()).entered();
            h = layer.forward(&h, rope, mode)?;
        }

        match &self.final_norm {
            Some(norm) => norm.forward(&h),
            None => Ok(h),
        }
    }
}

impl<T: TensorElem, K: AttentionKernel> Module<T> for BlockStack<T, K> {
    fn num_parameters(&self) -> usize {
        self.layers.iter().map(Module::num_parameters).sum::<usize>()
            + self.final_norm.as_ref().map_or(0, Module::num_parameters)
    }
}
