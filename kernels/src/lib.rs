//! CPU kernels operating on flat, row-major slices.
//!
//! Nothing in this crate knows about the `Tensor` type of `llama-blocks`; every kernel takes
//! raw slices plus shape arrays and returns a freshly allocated `Vec<T>` (or writes in place).
//! This keeps the hot loops swappable (BLAS, SIMD) without touching the model code.

use num_traits::{FromPrimitive, Num, NumAssign, ToPrimitive};
use std::fmt::Debug;
use thiserror::Error;

pub mod cpu_matmul;
pub mod cpu_softmax;
pub mod cpu_transpose;

pub use cpu_matmul::{cpu_matmul, cpu_matmul_nt};
pub use cpu_softmax::{cpu_softmax_rows, softmax_f64_in_place};
pub use cpu_transpose::cpu_transpose;

#[derive(Error, Debug, PartialEq)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Element bound for kernel inputs.
///
/// Mirrors `TensorElem` in the main crate so the kernels stay independent of it.
pub trait KernelElem:
    Num + NumAssign + Copy + Clone + Debug + Send + Sync + FromPrimitive + ToPrimitive + PartialOrd
{
}

impl<T> KernelElem for T where
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

/// Checks that `data` holds exactly `shape.iter().product()` elements.
pub(crate) fn check_len<T>(data: &[T], shape: &[usize]) -> Result<()> {
    let size: usize = shape.iter().product();
    if data.len() != size {
        return Err(KernelError::ShapeMismatch {
            expected: vec![size],
            got: vec![data.len()],
        });
    }
    Ok(())
}
