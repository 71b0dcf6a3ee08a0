use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorElem, TensorView};
use num_traits::Float;
use rayon::prelude::*;

/// Precomputed rotary positional embedding (RoPE) table.
///
/// For band `i` in `[0, head_dim / 2)` the frequency is `theta^(-2i / head_dim)`; position `p`
/// rotates band `i` by the angle `p * freq_i`. `cos` and `sin` hold those angles for every
/// `(p, i)` and have shape `[max_seq_len, head_dim / 2]`.
///
/// The table is immutable once built and is shared read-only by every layer and head.
///
/// Rotating the adjacent channel pair `(x0, x1)` by angle `a`:
///
/// ```text
/// x0' = x0 * cos(a) - x1 * sin(a)
/// x1' = x0 * sin(a) + x1 * cos(a)
/// ```
#[derive(Debug, Clone)]
pub struct RotaryTable<T: TensorElem> {
    cos: Tensor<T, 2>,
    sin: Tensor<T, 2>,
    head_dim: usize,
}

impl<T: TensorElem + Float> RotaryTable<T> {
    /// Builds the table. Angles are computed in `f64` and cast to `T`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `head_dim` is zero or odd, `max_seq_len` is zero, or
    /// `theta` is not a positive finite number.
    pub fn build(head_dim: usize, max_seq_len: usize, theta: f64) -> Result<Self> {
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "rotary head_dim must be even and > 0, got {}",
                head_dim
            )));
        }
        if max_seq_len == 0 {
            return Err(Error::InvalidConfig(
                "rotary max_seq_len must be > 0".into(),
            ));
        }
        if !theta.is_finite() || theta <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "rotary theta must be finite and > 0, got {}",
                theta
            )));
        }

        let half_dim = head_dim / 2;
        let freqs: Vec<f64> = (0..half_dim)
            .map(|i| theta.powf(-((2 * i) as f64) / head_dim as f64))
            .collect();

        let mut cos = Tensor::zeros([max_seq_len, half_dim]);
        let mut sin = Tensor::zeros([max_seq_len, half_dim]);

        cos.data_mut()
            .par_chunks_mut(half_dim)
            .zip(sin.data_mut().par_chunks_mut(half_dim))
            .enumerate()
            .for_each(|(pos, (cos_row, sin_row))| {
                for (i, freq) in freqs.iter().enumerate() {
                    let angle = pos as f64 * freq;
                    cos_row[i] = T::from_f64(angle.cos()).unwrap_or(T::zero());
                    sin_row[i] = T::from_f64(angle.sin()).unwrap_or(T::zero());
                }
            });

        Ok(Self { cos, sin, head_dim })
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn max_seq_len(&self) -> usize {
        self.cos.shape()[0]
    }

    /// Cosine table, `[max_seq_len, head_dim / 2]`.
    pub fn cos(&self) -> &Tensor<T, 2> {
        &self.cos
    }

    /// Sine table, `[max_seq_len, head_dim / 2]`.
    pub fn sin(&self) -> &Tensor<T, 2> {
        &self.sin
    }

    /// Selects positions `[0, seq_len)` and broadcasts them over `batch` and `heads`.
    ///
    /// Returns `(cos, sin)` views of shape `[batch, seq_len, heads, head_dim / 2]`, matching a
    /// head-partitioned `[batch, seq_len, heads, head_dim]` tensor pair-for-pair. Nothing is
    /// copied: batch and head axes have stride 0.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShapeMismatch` if `seq_len` exceeds `max_seq_len`.
    pub fn lookup(
        &self,
        batch: usize,
        seq_len: usize,
        heads: usize,
    ) -> Result<(TensorView<'_, T, 4>, TensorView<'_, T, 4>)> {
        if seq_len > self.max_seq_len() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.max_seq_len()],
                got: vec![seq_len],
            });
        }

        let target = [batch, seq_len, heads, self.head_dim / 2];
        Ok((
            broadcast_rows(&self.cos, target)?,
            broadcast_rows(&self.sin, target)?,
        ))
    }

    /// Rotates a head-partitioned `[batch, seq_len, heads, head_dim]` tensor.
    pub fn rotate(&self, x: &Tensor<T, 4>) -> Result<Tensor<T, 4>> {
        let [b, s, h, d] = *x.shape();
        if d != self.head_dim {
            return Err(Error::ShapeMismatch {
                expected: vec![self.head_dim],
                got: vec![d],
            });
        }
        let (cos, sin) = self.lookup(b, s, h)?;
        apply_rotary(x, &cos, &sin)
    }
}

/// Views rows `[0, target[1])` of a `[max_seq_len, half_dim]` table as `target`.
fn broadcast_rows<T: TensorElem>(
    table: &Tensor<T, 2>,
    target: [usize; 4],
) -> Result<TensorView<'_, T, 4>> {
    let [_, seq_len, _, half_dim] = target;
    table
        .view()
        .narrow(0, 0, seq_len)?
        .reshape([1, seq_len, 1, half_dim])?
        .expand(target)
}

/// Rotates adjacent channel pairs of `x` (`[batch, seq_len, heads, head_dim]`) by the angles in
/// `cos` / `sin` (`[batch, seq_len, heads, head_dim / 2]`, typically broadcast views).
///
/// The rotation is evaluated in `f64` and cast back to `T`. Pair `(2i, 2i + 1)` stays in place,
/// so the channel order of the output matches the input.
pub fn apply_rotary<T: TensorElem + Float>(
    x: &Tensor<T, 4>,
    cos: &TensorView<'_, T, 4>,
    sin: &TensorView<'_, T, 4>,
) -> Result<Tensor<T, 4>> {
    let [b, s, h, d] = *x.shape();
    let half_dim = d / 2;
    let expected = [b, s, h, half_dim];
    if d % 2 != 0 || cos.shape() != &expected || sin.shape() != &expected {
        return Err(Error::ShapeMismatch {
            expected: expected.to_vec(),
            got: cos.shape().to_vec(),
        });
    }

    let mut out = Tensor::zeros([b, s, h, d]);
    if out.size() == 0 {
        return Ok(out);
    }

    let cos_data = cos.raw();
    let sin_data = sin.raw();

    // One head vector per task.
    out.data_mut()
        .par_chunks_mut(d)
        .zip(x.data().par_chunks(d))
        .enumerate()
        .for_each(|(row, (out_vec, in_vec))| {
            let head = row % h;
            let pos = (row / h) % s;
            let batch = row / (h * s);
            for i in 0..half_dim {
                let idx = [batch, pos, head, i];
                let c = cos_data[cos.offset_of(&idx)].to_f64().unwrap_or(1.0);
                let sn = sin_data[sin.offset_of(&idx)].to_f64().unwrap_or(0.0);

                let x0 = in_vec[2 * i].to_f64().unwrap_or(0.0);
                let x1 = in_vec[2 * i + 1].to_f64().unwrap_or(0.0);

                out_vec[2 * i] = T::from_f64(x0 * c - x1 * sn).unwrap_or(T::zero());
                out_vec[2 * i + 1] = T::from_f64(x0 * sn + x1 * c).unwrap_or(T::zero());
            }
        });

    Ok(out)
}
