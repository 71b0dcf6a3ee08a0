use crate::error::{Error, Result};
use crate::nn::{Activation, Dropout, DropoutSite, Linear, Mode, Module};
use crate::tensor::{Tensor, TensorElem};
use num_traits::Float;

/// Hidden width of the gated feed-forward network for a requested width.
///
/// The requested width is shrunk to two thirds (integer floor), then rounded up to the next
/// multiple of `multiple_of`. Returns `None` if `multiple_of` is zero or the arithmetic
/// overflows.
///
/// ```rust
/// use llama_blocks::nn::transformer::ffn_hidden_dim;
///
/// // 4 * 4096 -> 10922 -> 11008
/// assert_eq!(ffn_hidden_dim(16384, 256), Some(11008));
/// assert_eq!(ffn_hidden_dim(32, 4), Some(24));
/// assert_eq!(ffn_hidden_dim(usize::MAX, 4), None);
/// ```
pub fn ffn_hidden_dim(requested: usize, multiple_of: usize) -> Option<usize> {
    let shrunk = requested.checked_mul(2)? / 3;
    shrunk.checked_next_multiple_of(multiple_of)
}

/// SwiGLU feed-forward network: `w2(silu(w1(x)) * w3(x))`.
///
/// `w1` (gate) and `w3` (up) are `[hidden, dim]`, `w2` (down) is `[dim, hidden]`.
#[derive(Debug, Clone)]
pub struct GatedFeedForward<T: TensorElem> {
    pub w1: Linear<T>,
    pub w2: Linear<T>,
    pub w3: Linear<T>,
    dropout: Dropout,
}

impl<T: TensorElem + Float> GatedFeedForward<T> {
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the three projections do not agree on `dim` and
    /// `hidden`.
    pub fn new(w1: Linear<T>, w2: Linear<T>, w3: Linear<T>) -> Result<Self> {
        let dim = w1.in_features();
        let hidden = w1.out_features();
        if w3.in_features() != dim
            || w3.out_features() != hidden
            || w2.in_features() != hidden
            || w2.out_features() != dim
        {
            return Err(Error::InvalidConfig(format!(
                "feed-forward weights disagree: w1 {:?}, w2 {:?}, w3 {:?}",
                w1.weight.shape(),
                w2.weight.shape(),
                w3.weight.shape()
            )));
        }
        Ok(Self {
            w1,
            w2,
            w3,
            dropout: Dropout::new(0.0, 0)?,
        })
    }

    /// Enables dropout with probability `p` on the output, using the stream of `layer_id`.
    pub fn with_dropout(mut self, p: f64, layer_id: usize) -> Result<Self> {
        self.dropout = Dropout::new(p, DropoutSite::FeedForward.id(layer_id))?;
        Ok(self)
    }

    pub fn dim(&self) -> usize {
        self.w1.in_features()
    }

    pub fn hidden_dim(&self) -> usize {
        self.w1.out_features()
    }

    /// Applies the network over the last dimension of `x`.
    pub fn forward<const RANK: usize>(
        &self,
        x: &Tensor<T, RANK>,
        mode: Mode,
    ) -> Result<Tensor<T, RANK>> {
        let gate = self.w1.forward(x)?;
        let up = self.w3.forward(x)?;
        let hidden = Activation::swiglu(&gate, &up)?;
        let out = self.w2.forward(&hidden)?;
        Ok(self.dropout.forward(out, mode))
    }
}

impl<T: TensorElem> Module<T> for GatedFeedForward<T> {
    fn num_parameters(&self) -> usize {
        self.w1.num_parameters() + self.w2.num_parameters() + self.w3.num_parameters()
    }
}
