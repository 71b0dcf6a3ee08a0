use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Numerically stable softmax over one row, in place, in `f64`.
///
/// The row maximum is subtracted before exponentiating. Entries equal to `-inf` map to exactly
/// zero. A row made only of `-inf` is left as all zeros instead of producing NaN.
pub fn softmax_f64_in_place(row: &mut [f64]) {
    let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        row.fill(0.0);
        return;
    }

    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in row.iter_mut() {
        *v /= sum;
    }
}

/// Row-wise softmax over a flat buffer made of consecutive rows of `row_len` elements.
///
/// Each row is widened to `f64`, normalized with [`softmax_f64_in_place`], and narrowed back,
/// so `f32` and `f16` callers get the same rounding behavior as the fused attention path.
pub fn cpu_softmax_rows<T: KernelElem>(data: &mut [T], row_len: usize) -> Result<()> {
    if row_len == 0 {
        return if data.is_empty() {
            Ok(())
        } else {
            Err(KernelError::ShapeMismatch {
                expected: vec![0],
                got: vec![data.len()],
            })
        };
    }
    if data.len() % row_len != 0 {
        return Err(KernelError::ShapeMismatch {
            expected: vec![data.len() / row_len + 1, row_len],
            got: vec![data.len()],
        });
    }

    data.par_chunks_mut(row_len).for_each_init(
        || Vec::with_capacity(row_len),
        |scratch: &mut Vec<f64>, row| {
            scratch.clear();
            scratch.extend(
                row.iter()
                    .map(|v| v.to_f64().unwrap_or(f64::NEG_INFINITY)),
            );
            softmax_f64_in_place(scratch);
            for (dst, &p) in row.iter_mut().zip(scratch.iter()) {
                *dst = T::from_f64(p).unwrap_or_else(T::zero);
            }
        },
    );

    Ok(())
}
