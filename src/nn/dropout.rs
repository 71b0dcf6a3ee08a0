//! Dropout and the execution mode flag.
//!
//! Dropout masks are drawn from a `StdRng` seeded per row from `(seed, site, row)`. A training
//! forward is therefore reproducible for a given seed and does not depend on how `rayon`
//! schedules the rows.

use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorElem};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Whether a forward call runs in inference or training mode.
///
/// Passed explicitly to every forward call; there is no global training flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Dropout is the identity.
    #[default]
    Inference,
    /// Dropout is active, driven by `seed`.
    Training { seed: u64 },
}

impl Mode {
    pub fn is_training(&self) -> bool {
        matches!(self, Mode::Training { .. })
    }
}

/// Where in a block a dropout is applied. Combined with the layer index it gives each dropout
/// its own random stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropoutSite {
    /// Post-softmax attention probabilities.
    AttentionProbs,
    /// Output of the attention projection, before the residual add.
    AttentionResidual,
    /// Output of the feed-forward down projection, before the residual add.
    FeedForward,
}

impl DropoutSite {
    /// Stream identifier unique to `(layer, self)`.
    pub fn id(self, layer: usize) -> u64 {
        let slot = match self {
            DropoutSite::AttentionProbs => 0,
            DropoutSite::AttentionResidual => 1,
            DropoutSite::FeedForward => 2,
        };
        (layer as u64) * 3 + slot
    }
}

/// Inverted dropout: zeroes each element with probability `p` and scales survivors by
/// `1 / (1 - p)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    p: f64,
    site: u64,
}

impl Dropout {
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` unless `0 <= p < 1`.
    pub fn new(p: f64, site: u64) -> Result<Self> {
        if !p.is_finite() || !(0.0..1.0).contains(&p) {
            return Err(Error::InvalidConfig(format!(
                "dropout probability must be in [0, 1), got {}",
                p
            )));
        }
        Ok(Self { p, site })
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    /// The seed to drive the masks with, or `None` when this dropout is the identity.
    pub fn active_seed(&self, mode: Mode) -> Option<u64> {
        match mode {
            Mode::Training { seed } if self.p > 0.0 => Some(seed),
            _ => None,
        }
    }

    fn row_rng(&self, seed: u64, row: usize) -> StdRng {
        let mixed = seed
            ^ self.site.wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (row as u64).wrapping_add(1).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
        StdRng::seed_from_u64(mixed)
    }

    /// Applies the mask for logical row `row` in place.
    ///
    /// Element `j` always consumes the `j`-th draw of the row stream, so a caller that only
    /// holds a prefix of the row (the unmasked keys of a causal attention row) sees the same
    /// mask on that prefix as a caller holding the whole row.
    pub fn apply_row<T: TensorElem>(&self, values: &mut [T], seed: u64, row: usize) {
        let mut rng = self.row_rng(seed, row);
        let scale = 1.0 / (1.0 - self.p);
        for v in values.iter_mut() {
            if rng.random::<f64>() < self.p {
                *v = T::zero();
            } else {
                *v = T::from_f64(v.to_f64().unwrap_or(0.0) * scale).unwrap_or(T::zero());
            }
        }
    }

    /// Applies dropout to consecutive rows of `row_len` elements, numbering rows from 0.
    pub fn apply_rows<T: TensorElem>(&self, data: &mut [T], row_len: usize, mode: Mode) {
        let Some(seed) = self.active_seed(mode) else {
            return;
        };
        if row_len == 0 {
            return;
        }
        data.par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(row, values)| self.apply_row(values, seed, row));
    }

    /// Applies dropout over the last dimension of `x`.
    pub fn forward<T: TensorElem, const RANK: usize>(
        &self,
        mut x: Tensor<T, RANK>,
        mode: Mode,
    ) -> Tensor<T, RANK> {
        let row_len = x.shape()[RANK - 1];
        self.apply_rows(x.data_mut(), row_len, mode);
        x
    }
}
