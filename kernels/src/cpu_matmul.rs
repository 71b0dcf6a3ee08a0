use crate::{KernelElem, KernelError, Result, check_len, cpu_transpose};
use rayon::prelude::*;

/// Batched matrix multiplication: `[..., M, K] x [..., K, N] -> [..., M, N]`.
///
/// Leading dimensions are batch dimensions and must match exactly. The right-hand side is
/// transposed once up front so that the inner loop walks both operands sequentially, then the
/// work is handed to [`cpu_matmul_nt`].
pub fn cpu_matmul<T, const RANK: usize>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize; RANK],
    rhs_shape: &[usize; RANK],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    const { assert!(RANK >= 2, "Matmul requires rank >= 2") };

    let k = lhs_shape[RANK - 1];
    if rhs_shape[RANK - 2] != k {
        return Err(KernelError::ShapeMismatch {
            expected: vec![k],
            got: vec![rhs_shape[RANK - 2]],
        });
    }

    let rhs_t = cpu_transpose(rhs_data, rhs_shape)?;
    let mut rhs_t_shape = *rhs_shape;
    rhs_t_shape.swap(RANK - 1, RANK - 2);

    cpu_matmul_nt(lhs_data, &rhs_t, lhs_shape, &rhs_t_shape)
}

/// Batched matrix multiplication against a transposed right-hand side:
/// `[..., M, K] x [..., N, K]^T -> [..., M, N]`.
///
/// This is the natural layout for both `x @ W^T` (weights stored `[out, in]`) and
/// `q @ k^T` (keys stored `[seq, head_dim]`), so neither needs a physical transpose.
///
/// Rows of the output are computed in parallel with `rayon`.
pub fn cpu_matmul_nt<T, const RANK: usize>(
    lhs_data: &[T],
    rhs_data: &[T],
    lhs_shape: &[usize; RANK],
    rhs_shape: &[usize; RANK],
) -> Result<Vec<T>>
where
    T: KernelElem,
{
    const { assert!(RANK >= 2, "Matmul requires rank >= 2") };

    check_len(lhs_data, lhs_shape)?;
    check_len(rhs_data, rhs_shape)?;

    let m = lhs_shape[RANK - 2];
    let k = lhs_shape[RANK - 1];
    let n = rhs_shape[RANK - 2];

    if rhs_shape[RANK - 1] != k || lhs_shape[..RANK - 2] != rhs_shape[..RANK - 2] {
        return Err(KernelError::ShapeMismatch {
            expected: lhs_shape.to_vec(),
            got: rhs_shape.to_vec(),
        });
    }

    let batch: usize = lhs_shape[..RANK - 2].iter().product();
    let mut out_data = vec![T::zero(); batch * m * n];
    if out_data.is_empty() {
        return Ok(out_data);
    }

    // One output row per task; `row` runs over all batches.
    out_data
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(row, out_row)| {
            let rhs_offset = (row / m) * n * k;
            let a_row = &lhs_data[row * k..(row + 1) * k];

            for (j, out_elem) in out_row.iter_mut().enumerate() {
                let start = rhs_offset + j * k;
                let b_row = &rhs_data[start..start + k];

                let mut sum = T::zero();
                for (&a, &b) in a_row.iter().zip(b_row) {
                    sum += a * b;
                }
                *out_elem = sum;
            }
        });

    Ok(out_data)
}
