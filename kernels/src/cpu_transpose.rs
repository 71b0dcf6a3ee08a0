use crate::{KernelElem, Result, check_len};
use rayon::prelude::*;

/// Swaps the last two dimensions: `[..., M, N] -> [..., N, M]`.
///
/// Parallelised over output rows. Each output row gathers one input column, so reads are
/// strided and writes are sequential.
pub fn cpu_transpose<T, const RANK: usize>(data: &[T], shape: &[usize; RANK]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    const { assert!(RANK >= 2, "Transpose requires rank >= 2") };

    check_len(data, shape)?;

    let m = shape[RANK - 2];
    let n = shape[RANK - 1];

    let mut out_data = vec![T::zero(); data.len()];
    if out_data.is_empty() {
        return Ok(out_data);
    }

    out_data
        .par_chunks_mut(m)
        .enumerate()
        .for_each(|(row, out_row)| {
            let matrix_offset = (row / n) * m * n;
            let col = row % n;
            for (r, out_elem) in out_row.iter_mut().enumerate() {
                *out_elem = data[matrix_offset + r * n + col];
            }
        });

    Ok(out_data)
}
