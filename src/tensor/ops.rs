//! Tensor operations.
//!
//! - **Element-wise arithmetic**: `&a + &b`, `-`, `*`, `/` on tensors of identical shape.
//! - **Matrix multiplication**: batched `matmul` and `matmul_nt` (right operand transposed),
//!   delegated to `llama-blocks-kernels`.
//! - **Axis permutation**: `transpose` (last two axes) and `transpose_axes` (any pair).
//!
//! Element-wise work is parallelised with `rayon`.
//!
//! ```rust
//! use llama_blocks::tensor::Tensor;
//!
//! let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
//! let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[4.0, 6.0]);
//! ```

use super::{Tensor, TensorElem, compute_strides};
use crate::error::{Error, Result};

use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};

/// Implements a binary arithmetic trait for `&Tensor`.
///
/// Shapes must match exactly; there is no implicit broadcasting.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK>
        where
            T: TensorElem,
        {
            type Output = Result<Tensor<T, RANK>>;

            fn $method(self, rhs: Self) -> Self::Output {
                if self.shape != rhs.shape {
                    return Err(Error::ShapeMismatch {
                        expected: self.shape.to_vec(),
                        got: rhs.shape.to_vec(),
                    });
                }

                let mut out = Tensor::zeros(self.shape);
                out.data
                    .par_iter_mut()
                    .zip(self.data.par_iter())
                    .zip(rhs.data.par_iter())
                    .for_each(|((o, a), b)| {
                        *o = a.$method(*b);
                    });

                Ok(out)
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Applies a function element-wise, returning a new tensor of the same shape.
    ///
    /// ```rust
    /// use llama_blocks::tensor::Tensor;
    /// let t = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
    /// let squared = t.map(|x| x * x);
    /// assert_eq!(squared.data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = Tensor::zeros(self.shape);
        out.data
            .par_iter_mut()
            .zip(self.data.par_iter())
            .for_each(|(o, i)| *o = f(*i));
        out
    }

    /// Batched matrix multiplication on the last two dimensions:
    /// `[..., M, K] x [..., K, N] -> [..., M, N]`.
    ///
    /// Leading dimensions are batch dimensions and must match.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };

        let mut out_shape = self.shape;
        out_shape[RANK - 1] = rhs.shape[RANK - 1];

        let out_data =
            llama_blocks_kernels::cpu_matmul(&self.data, &rhs.data, &self.shape, &rhs.shape)?;
        Tensor::new(out_data, out_shape)
    }

    /// Batched matrix multiplication against a transposed right operand:
    /// `[..., M, K] x [..., N, K]^T -> [..., M, N]`.
    ///
    /// Used for attention scores (`q @ k^T`) without materializing `k^T`.
    pub fn matmul_nt(&self, rhs: &Self) -> Result<Self> {
        const { assert!(RANK >= 2, "Matmul requires rank >= 2") };

        let mut out_shape = self.shape;
        out_shape[RANK - 1] = rhs.shape[RANK - 2];

        let out_data =
            llama_blocks_kernels::cpu_matmul_nt(&self.data, &rhs.data, &self.shape, &rhs.shape)?;
        Tensor::new(out_data, out_shape)
    }

    /// Swaps the last two dimensions.
    pub fn transpose(&self) -> Result<Self> {
        const { assert!(RANK >= 2, "Transpose requires rank >= 2") };

        let mut new_shape = self.shape;
        new_shape.swap(RANK - 1, RANK - 2);

        let out_data = llama_blocks_kernels::cpu_transpose(&self.data, &self.shape)?;
        Tensor::new(out_data, new_shape)
    }

    /// Swaps two arbitrary axes, physically permuting the data.
    ///
    /// The result is contiguous in the new layout. Attention uses this for
    /// `[B, S, H, D] <-> [B, H, S, D]`.
    ///
    /// # Errors
    ///
    /// Returns `Error::IndexOutOfBounds` if `ax1` or `ax2` is not a valid axis.
    pub fn transpose_axes(&self, ax1: usize, ax2: usize) -> Result<Self> {
        if ax1 >= RANK || ax2 >= RANK {
            return Err(Error::IndexOutOfBounds {
                index: vec![ax1, ax2],
                shape: self.shape.to_vec(),
            });
        }
        if ax1 == ax2 {
            return Ok(self.clone());
        }

        let mut new_shape = self.shape;
        new_shape.swap(ax1, ax2);

        // Input stride for each output axis.
        let mut mapped_strides = self.strides;
        mapped_strides.swap(ax1, ax2);

        let out_strides = compute_strides(&new_shape);
        let inner = new_shape[RANK - 1];
        let inner_stride = mapped_strides[RANK - 1];

        let mut out = Tensor::zeros(new_shape);
        if out.data.is_empty() {
            return Ok(out);
        }

        out.data
            .par_chunks_mut(inner)
            .enumerate()
            .for_each(|(row, chunk)| {
                let mut rem = row * inner;
                let mut base = 0;
                for d in 0..RANK - 1 {
                    base += (rem / out_strides[d]) * mapped_strides[d];
                    rem %= out_strides[d];
                }
                for (i, o) in chunk.iter_mut().enumerate() {
                    *o = self.data[base + i * inner_stride];
                }
            });

        Ok(out)
    }
}
