use super::Module;
use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorElem};

use rayon::prelude::*;

/// Linear layer: `y = x W^T + b`.
///
/// Weights are stored `[out_features, in_features]`, the layout checkpoints use, and are
/// multiplied without a physical transpose through `cpu_matmul_nt`.
///
/// Any input rank is accepted; all leading dimensions are flattened into rows and only the
/// last dimension is contracted.
///
/// ```rust
/// use llama_blocks::nn::Linear;
/// use llama_blocks::tensor::Tensor;
///
/// let layer = Linear::<f32>::new(Tensor::zeros([5, 10]), Some(Tensor::zeros([5]))).unwrap();
/// assert_eq!(layer.in_features(), 10);
/// assert_eq!(layer.out_features(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct Linear<T: TensorElem> {
    /// Shape: `[out_features, in_features]`
    pub weight: Tensor<T, 2>,
    /// Shape: `[out_features]`
    pub bias: Option<Tensor<T, 1>>,
}

impl<T: TensorElem> Linear<T> {
    /// Creates a new Linear layer.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the bias length differs from `out_features`.
    pub fn new(weight: Tensor<T, 2>, bias: Option<Tensor<T, 1>>) -> Result<Self> {
        if let Some(b) = &bias
            && b.shape()[0] != weight.shape()[0]
        {
            return Err(Error::InvalidConfig(format!(
                "bias has {} entries but weight has {} output features",
                b.shape()[0],
                weight.shape()[0]
            )));
        }
        Ok(Self { weight, bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Applies the projection to the last dimension of `x`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShapeMismatch` if the last dimension of `x` is not `in_features`.
    pub fn forward<const RANK: usize>(&self, x: &Tensor<T, RANK>) -> Result<Tensor<T, RANK>> {
        const { assert!(RANK >= 1, "Linear requires rank >= 1") };

        let in_features = self.in_features();
        let out_features = self.out_features();
        if x.shape()[RANK - 1] != in_features {
            return Err(Error::ShapeMismatch {
                expected: vec![in_features],
                got: vec![x.shape()[RANK - 1]],
            });
        }

        let rows = x.size() / in_features.max(1);
        let mut out_data = llama_blocks_kernels::cpu_matmul_nt(
            x.data(),
            self.weight.data(),
            &[rows, in_features],
            &[out_features, in_features],
        )?;

        if let Some(bias) = &self.bias
            && out_features > 0
        {
            out_data.par_chunks_mut(out_features).for_each(|row| {
                for (r, b) in row.iter_mut().zip(bias.data()) {
                    *r += *b;
                }
            });
        }

        let mut out_shape = *x.shape();
        out_shape[RANK - 1] = out_features;
        Tensor::new(out_data, out_shape)
    }
}

impl<T: TensorElem> Module<T> for Linear<T> {
    fn num_parameters(&self) -> usize {
        self.weight.size() + self.bias.as_ref().map_or(0, |b| b.size())
    }
}
