//! Core Tensor implementation.
//!
//! A [`Tensor`] is a dense, row-major, owned N-dimensional array: a flat `Vec<T>` plus a
//! `shape` and the matching `strides`. Every tensor owns contiguous storage, so the layout is
//! always recoverable from the shape alone.
//!
//! Read-only strided windows over a tensor (row ranges, broadcasts with zero strides) are
//! expressed with [`TensorView`], which borrows the buffer instead of copying it.
//!
//! ```rust
//! use llama_blocks::tensor::Tensor;
//!
//! let tensor = Tensor::<f32, 2>::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]).unwrap();
//! assert_eq!(tensor.shape(), &[2, 3]);
//! assert_eq!(tensor.strides(), &[3, 1]);
//! ```

use crate::error::{Error, Result};
use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;

pub mod ops;
pub mod view;

pub use view::TensorView;

/// Trait bound for elements that can be stored in a Tensor.
///
/// - `Copy`: elements live in a flat `Vec<T>` and are read by value in hot loops.
/// - `Num + NumAssign`: arithmetic.
/// - `FromPrimitive + ToPrimitive`: widening to `f64` for reductions and back.
/// - `Send + Sync`: parallel execution via `rayon`.
pub trait TensorElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> TensorElem for T where
    T: Num
        + NumAssign
        + Copy
        + Clone
        + Debug
        + Send
        + Sync
        + FromPrimitive
        + ToPrimitive
        + PartialOrd
{
}

/// An owned, contiguous N-dimensional array.
///
/// `RANK` is a const generic: the number of dimensions is fixed by the type, the sizes are
/// not. Batch size and sequence length therefore vary freely between calls while a rank
/// mistake (passing a matrix where an activation is expected) fails to compile.
#[derive(Clone, PartialEq)]
pub struct Tensor<T, const RANK: usize>
where
    T: TensorElem,
{
    shape: [usize; RANK],
    strides: [usize; RANK],
    data: Vec<T>,
}

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Creates a new Tensor from a vector of data and a shape.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShapeMismatch` if the length of `data` does not match the product of
    /// `shape`.
    pub fn new(data: Vec<T>, shape: [usize; RANK]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(Error::ShapeMismatch {
                expected: vec![size],
                got: vec![data.len()],
            });
        }

        Ok(Self {
            shape,
            strides: compute_strides(&shape),
            data,
        })
    }

    /// Creates a new Tensor filled with zeros.
    pub fn zeros(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::zero())
    }

    /// Creates a new Tensor filled with ones.
    pub fn ones(shape: [usize; RANK]) -> Self {
        Self::full(shape, T::one())
    }

    /// Creates a new Tensor with every element set to `value`.
    pub fn full(shape: [usize; RANK], value: T) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape,
            strides: compute_strides(&shape),
            data: vec![value; size],
        }
    }

    /// Reinterprets the tensor with a new shape of the same size.
    ///
    /// Consumes `self` and reuses the buffer: no element is copied. This is how activations
    /// are split into heads (`[B, S, H*D] -> [B, S, H, D]`) and merged back.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShapeMismatch` if the element counts differ.
    pub fn reshape<const NEW_RANK: usize>(
        self,
        new_shape: [usize; NEW_RANK],
    ) -> Result<Tensor<T, NEW_RANK>> {
        let current_size: usize = self.shape.iter().product();
        let new_size: usize = new_shape.iter().product();

        if current_size != new_size {
            return Err(Error::ShapeMismatch {
                expected: vec![current_size],
                got: vec![new_size],
            });
        }

        Ok(Tensor {
            shape: new_shape,
            strides: compute_strides(&new_shape),
            data: self.data,
        })
    }

    /// Returns the shape of the tensor.
    pub const fn shape(&self) -> &[usize; RANK] {
        &self.shape
    }

    /// Returns the row-major strides of the tensor.
    pub const fn strides(&self) -> &[usize; RANK] {
        &self.strides
    }

    /// Returns the underlying data as a flat slice.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Returns the underlying data as a mutable flat slice.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Consumes the tensor and returns its buffer.
    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Returns the total number of elements in the tensor.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Reads one element by multi-dimensional index.
    ///
    /// # Errors
    ///
    /// Returns `Error::IndexOutOfBounds` if any coordinate exceeds its dimension.
    pub fn get(&self, index: [usize; RANK]) -> Result<T> {
        if index.iter().zip(&self.shape).any(|(i, d)| i >= d) {
            return Err(Error::IndexOutOfBounds {
                index: index.to_vec(),
                shape: self.shape.to_vec(),
            });
        }
        let offset: usize = index.iter().zip(&self.strides).map(|(i, s)| i * s).sum();
        Ok(self.data[offset])
    }

    /// Borrows the tensor as a strided view.
    pub fn view(&self) -> TensorView<'_, T, RANK> {
        TensorView::from_parts(&self.data, 0, self.shape, self.strides)
    }
}

impl<T, const RANK: usize> Debug for Tensor<T, RANK>
where
    T: TensorElem,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Computes row-major strides for a given shape.
///
/// The last dimension has stride 1; each earlier dimension steps over the product of all
/// later dimensions.
pub(crate) const fn compute_strides<const RANK: usize>(shape: &[usize; RANK]) -> [usize; RANK] {
    let mut strides = [0; RANK];
    let mut stride = 1;
    let mut i = RANK;
    while i > 0 {
        i -= 1;
        strides[i] = stride;
        stride *= shape[i];
    }
    strides
}
