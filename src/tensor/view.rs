//! Borrowed, strided views over a tensor buffer.
//!
//! A [`TensorView`] carries its own shape, strides and starting offset over a borrowed slice.
//! This lets callers select a row range (`narrow`), reinterpret a contiguous range
//! (`reshape`) and broadcast size-1 axes (`expand`, via zero strides) without copying.

use super::{Tensor, TensorElem, compute_strides};
use crate::error::{Error, Result};

/// Read-only strided window over a flat buffer.
#[derive(Clone, Copy)]
pub struct TensorView<'a, T, const RANK: usize> {
    data: &'a [T],
    offset: usize,
    shape: [usize; RANK],
    strides: [usize; RANK],
}

impl<'a, T, const RANK: usize> TensorView<'a, T, RANK>
where
    T: TensorElem,
{
    pub(crate) fn from_parts(
        data: &'a [T],
        offset: usize,
        shape: [usize; RANK],
        strides: [usize; RANK],
    ) -> Self {
        Self {
            data,
            offset,
            shape,
            strides,
        }
    }

    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    pub const fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    /// True when the view walks its elements in row-major order with no gaps.
    pub fn is_contiguous(&self) -> bool {
        self.strides == compute_strides(&self.shape)
    }

    /// Restricts `axis` to `[start, start + len)`.
    ///
    /// # Errors
    ///
    /// Returns `Error::IndexOutOfBounds` if `axis` is invalid or the range exceeds the axis.
    pub fn narrow(self, axis: usize, start: usize, len: usize) -> Result<Self> {
        if axis >= RANK || start + len > self.shape[axis] {
            return Err(Error::IndexOutOfBounds {
                index: vec![axis, start + len],
                shape: self.shape.to_vec(),
            });
        }

        let mut shape = self.shape;
        shape[axis] = len;
        Ok(Self {
            data: self.data,
            offset: self.offset + start * self.strides[axis],
            shape,
            strides: self.strides,
        })
    }

    /// Reinterprets a contiguous view with a new shape of the same size.
    ///
    /// # Errors
    ///
    /// - `Error::ShapeMismatch` if the element counts differ.
    /// - `Error::Unsupported` if the view is not contiguous (e.g. after `expand`).
    pub fn reshape<const NEW_RANK: usize>(
        self,
        new_shape: [usize; NEW_RANK],
    ) -> Result<TensorView<'a, T, NEW_RANK>> {
        let current_size: usize = self.shape.iter().product();
        let new_size: usize = new_shape.iter().product();
        if current_size != new_size {
            return Err(Error::ShapeMismatch {
                expected: vec![current_size],
                got: vec![new_size],
            });
        }
        if !self.is_contiguous() {
            return Err(Error::Unsupported(format!(
                "reshape of non-contiguous view with strides {:?}",
                self.strides
            )));
        }

        Ok(TensorView {
            data: self.data,
            offset: self.offset,
            shape: new_shape,
            strides: compute_strides(&new_shape),
        })
    }

    /// Broadcasts size-1 axes to `shape` by giving them a zero stride.
    ///
    /// Axes that are not size 1 must already equal the target size.
    pub fn expand(self, shape: [usize; RANK]) -> Result<Self> {
        let mut strides = self.strides;
        for axis in 0..RANK {
            if self.shape[axis] == shape[axis] {
                continue;
            }
            if self.shape[axis] != 1 {
                return Err(Error::ShapeMismatch {
                    expected: self.shape.to_vec(),
                    got: shape.to_vec(),
                });
            }
            strides[axis] = 0;
        }

        Ok(Self {
            data: self.data,
            offset: self.offset,
            shape,
            strides,
        })
    }

    /// Reads one element by multi-dimensional index.
    pub fn get(&self, index: [usize; RANK]) -> Result<T> {
        if index.iter().zip(&self.shape).any(|(i, d)| i >= d) {
            return Err(Error::IndexOutOfBounds {
                index: index.to_vec(),
                shape: self.shape.to_vec(),
            });
        }
        Ok(self.data[self.offset_of(&index)])
    }

    /// Flat buffer offset of an index already known to be in bounds.
    #[inline]
    pub(crate) fn offset_of(&self, index: &[usize; RANK]) -> usize {
        self.offset
            + index
                .iter()
                .zip(&self.strides)
                .map(|(i, s)| i * s)
                .sum::<usize>()
    }

    /// Borrowed buffer the view indexes into.
    pub(crate) fn raw(&self) -> &'a [T] {
        self.data
    }

    /// Copies the viewed elements into a new contiguous tensor.
    pub fn to_tensor(&self) -> Tensor<T, RANK> {
        let size: usize = self.shape.iter().product();
        let mut out = Vec::with_capacity(size);
        if size > 0 {
            let mut index = [0usize; RANK];
            for _ in 0..size {
                out.push(self.data[self.offset_of(&index)]);
                // Odometer increment, last axis fastest.
                for axis in (0..RANK).rev() {
                    index[axis] += 1;
                    if index[axis] < self.shape[axis] {
                        break;
                    }
                    index[axis] = 0;
                }
            }
        }
        Tensor {
            shape: self.shape,
            strides: compute_strides(&self.shape),
            data: out,
        }
    }
}

impl<T, const RANK: usize> std::fmt::Debug for TensorView<'_, T, RANK> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorView")
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("offset", &self.offset)
            .finish()
    }
}
