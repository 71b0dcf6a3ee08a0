use super::Module;
use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorElem};
use num_traits::Float;
use rayon::prelude::*;

/// RMSNorm (Root Mean Square Layer Normalization).
///
/// `y = x / sqrt(mean(x^2) + eps) * weight`, over the last dimension only and independently
/// per row. There is no mean-centering and no bias.
///
/// The mean-square reduction and the rescale run in `f64` whatever `T` is; the normalized
/// value is cast back to `T` before the learned scale is applied.
#[derive(Debug, Clone)]
pub struct RMSNorm<T: TensorElem> {
    /// Shape: `[features]`
    pub weight: Tensor<T, 1>,
    pub eps: T,
}

impl<T: TensorElem + Float> RMSNorm<T> {
    /// Creates a new RMSNorm layer.
    ///
    /// * `weight` - The per-channel scale of shape `[features]`.
    /// * `eps` - Added to the mean square so all-zero rows stay finite.
    pub fn new(weight: Tensor<T, 1>, eps: T) -> Self {
        Self { weight, eps }
    }

    pub fn features(&self) -> usize {
        self.weight.shape()[0]
    }

    /// Normalizes the input over the last dimension.
    pub fn forward<const RANK: usize>(&self, x: &Tensor<T, RANK>) -> Result<Tensor<T, RANK>> {
        const { assert!(RANK >= 1, "RMSNorm requires rank >= 1") };

        let last_dim = x.shape()[RANK - 1];
        if last_dim != self.features() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.features()],
                got: vec![last_dim],
            });
        }

        let mut out = Tensor::zeros(*x.shape());
        if out.size() == 0 {
            return Ok(out);
        }

        let eps = self.eps.to_f64().unwrap_or(0.0);
        let weight = self.weight.data();

        out.data_mut()
            .par_chunks_mut(last_dim)
            .zip(x.data().par_chunks(last_dim))
            .for_each(|(out_row, in_row)| {
                let sum_sq: f64 = in_row
                    .iter()
                    .map(|v| {
                        let v = v.to_f64().unwrap_or(0.0);
                        v * v
                    })
                    .sum();
                let rsqrt = 1.0 / (sum_sq / last_dim as f64 + eps).sqrt();

                for ((o, &v), &w) in out_row.iter_mut().zip(in_row).zip(weight) {
                    let normed =
                        T::from_f64(v.to_f64().unwrap_or(0.0) * rsqrt).unwrap_or(T::zero());
                    *o = normed * w;
                }
            });

        Ok(out)
    }
}

impl<T: TensorElem> Module<T> for RMSNorm<T> {
    fn num_parameters(&self) -> usize {
        self.weight.size()
    }
}
