//! Attention inner-loop strategies.
//!
//! Both strategies compute causal scaled dot-product attention over rotated queries and keys
//! and agree to floating-point tolerance:
//!
//! - [`ExplicitAttention`] expands the key/value heads, materializes the
//!   `[batch, head, query, key]` score tensor, masks it, normalizes it and multiplies by the
//!   values. It is the reference behavior.
//! - [`FusedAttention`] walks one `(batch, head, query)` row at a time, reads the shared
//!   key/value head in place and only visits keys `<= query`, never building the score tensor
//!   unless weights are requested.
//!
//! The strategy is a type parameter of the attention layer, chosen at compile time;
//! [`DefaultAttention`] follows the `fused` cargo feature.

use super::attention::repeat_kv;
use crate::error::{Error, Result};
use crate::nn::{Dropout, Mode};
use crate::tensor::{Tensor, TensorElem};
use llama_blocks_kernels::{cpu_softmax_rows, softmax_f64_in_place};
use num_traits::Float;
use rayon::prelude::*;
use std::fmt::Debug;

/// Output of an attention kernel: `[batch, seq, heads, head_dim]` plus, when requested, the
/// probabilities applied to the values, `[batch, heads, query, key]`.
pub type AttendOutput<T> = (Tensor<T, 4>, Option<Tensor<T, 4>>);

/// Per-call parameters shared by every strategy.
#[derive(Debug, Clone, Copy)]
pub struct AttendParams {
    /// Multiplier applied to `q . k`, normally `1 / sqrt(head_dim)`.
    pub scale: f64,
    /// Dropout on the attention probabilities.
    pub dropout: Dropout,
    pub mode: Mode,
    pub return_weights: bool,
}

/// A strategy for the attention inner loop.
///
/// Inputs are head-partitioned and already rotated:
/// - `q`: `[batch, seq, n_heads, head_dim]`
/// - `k`, `v`: `[batch, seq, n_kv_heads, head_dim]`, with `n_heads % n_kv_heads == 0`
///
/// Query head `h` attends with key/value head `h / (n_heads / n_kv_heads)`. Query position `i`
/// sees key positions `0..=i` only.
pub trait AttentionKernel: Debug + Default + Clone + Send + Sync {
    /// Name used in diagnostics.
    const NAME: &'static str;

    fn attend<T: TensorElem + Float>(
        &self,
        q: &Tensor<T, 4>,
        k: &Tensor<T, 4>,
        v: &Tensor<T, 4>,
        params: &AttendParams,
    ) -> Result<AttendOutput<T>>;
}

#[cfg(not(feature = "fused"))]
pub type DefaultAttention = ExplicitAttention;
#[cfg(feature = "fused")]
pub type DefaultAttention = FusedAttention;

/// `[b, s, h, kv, d]` of a valid `q`/`k`/`v` triple.
fn check_qkv<T: TensorElem>(
    q: &Tensor<T, 4>,
    k: &Tensor<T, 4>,
    v: &Tensor<T, 4>,
) -> Result<[usize; 5]> {
    let [b, s, h, d] = *q.shape();
    let [kb, ks, kv, kd] = *k.shape();
    if k.shape() != v.shape() || kb != b || ks != s || kd != d {
        return Err(Error::ShapeMismatch {
            expected: vec![b, s, kv, d],
            got: v.shape().to_vec(),
        });
    }
    if kv == 0 || h % kv != 0 {
        return Err(Error::InvalidConfig(format!(
            "{} query heads cannot share {} key/value heads",
            h, kv
        )));
    }
    Ok([b, s, h, kv, d])
}

fn empty_output<T: TensorElem>(
    b: usize,
    s: usize,
    h: usize,
    d: usize,
    weights: bool,
) -> AttendOutput<T> {
    (
        Tensor::zeros([b, s, h, d]),
        weights.then(|| Tensor::zeros([b, h, s, s])),
    )
}

/// Score / mask / softmax / weighted-sum, step by step.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExplicitAttention;

impl AttentionKernel for ExplicitAttention {
    const NAME: &'static str = "explicit";

    fn attend<T: TensorElem + Float>(
        &self,
        q: &Tensor<T, 4>,
        k: &Tensor<T, 4>,
        v: &Tensor<T, 4>,
        params: &AttendParams,
    ) -> Result<AttendOutput<T>> {
        let [b, s, h, kv, d] = check_qkv(q, k, v)?;
        if b * s * h * d == 0 {
            return Ok(empty_output(b, s, h, d, params.return_weights));
        }
        let n_rep = h / kv;

        // [B, S, H, D] -> [B, H, S, D]
        let q = q.transpose_axes(1, 2)?;
        let k = repeat_kv(k, n_rep)?.transpose_axes(1, 2)?;
        let v = repeat_kv(v, n_rep)?.transpose_axes(1, 2)?;

        // [B, H, S, S]
        let mut scores = q.matmul_nt(&k)?;

        let scale = T::from_f64(params.scale).unwrap_or(T::one());
        scores
            .data_mut()
            .par_chunks_mut(s)
            .enumerate()
            .for_each(|(row, values)| {
                let query = row % s;
                for (key, val) in values.iter_mut().enumerate() {
                    *val = if key > query {
                        T::neg_infinity()
                    } else {
                        *val * scale
                    };
                }
            });

        cpu_softmax_rows(scores.data_mut(), s)?;
        params.dropout.apply_rows(scores.data_mut(), s, params.mode);

        let out = scores.matmul(&v)?.transpose_axes(1, 2)?;
        Ok((out, params.return_weights.then_some(scores)))
    }
}

/// Row-at-a-time attention with `f64` accumulation and no key/value expansion.
#[derive(Debug, Default, Clone, Copy)]
pub struct FusedAttention;

impl AttentionKernel for FusedAttention {
    const NAME: &'static str = "fused";

    fn attend<T: TensorElem + Float>(
        &self,
        q: &Tensor<T, 4>,
        k: &Tensor<T, 4>,
        v: &Tensor<T, 4>,
        params: &AttendParams,
    ) -> Result<AttendOutput<T>> {
        let [b, s, h, kv, d] = check_qkv(q, k, v)?;
        if b * s * h * d == 0 {
            return Ok(empty_output(b, s, h, d, params.return_weights));
        }
        let n_rep = h / kv;

        let q_data = q.data();
        let k_data = k.data();
        let v_data = v.data();
        let seed = params.dropout.active_seed(params.mode);
        let scale = params.scale;

        let to_f64 = |x: T| x.to_f64().unwrap_or(0.0);

        // `row` enumerates (batch, head, query) in [B, H, S] order.
        let attend_row = |row: usize, out_vec: &mut [T], weights_row: Option<&mut [T]>| {
            let query = row % s;
            let head = (row / s) % h;
            let batch = row / (s * h);
            let kv_head = head / n_rep;

            let q_off = ((batch * s + query) * h + head) * d;
            let q_vec = &q_data[q_off..q_off + d];

            let mut probs: Vec<f64> = (0..=query)
                .map(|key| {
                    let k_off = ((batch * s + key) * kv + kv_head) * d;
                    let dot: f64 = q_vec
                        .iter()
                        .zip(&k_data[k_off..k_off + d])
                        .map(|(&a, &b)| to_f64(a) * to_f64(b))
                        .sum();
                    dot * scale
                })
                .collect();

            softmax_f64_in_place(&mut probs);
            if let Some(seed) = seed {
                params.dropout.apply_row(&mut probs, seed, row);
            }

            let mut acc = vec![0.0f64; d];
            for (key, &p) in probs.iter().enumerate() {
                let v_off = ((batch * s + key) * kv + kv_head) * d;
                for (a, &val) in acc.iter_mut().zip(&v_data[v_off..v_off + d]) {
                    *a += p * to_f64(val);
                }
            }
            for (o, a) in out_vec.iter_mut().zip(acc) {
                *o = T::from_f64(a).unwrap_or(T::zero());
            }

            if let Some(w) = weights_row {
                for (dst, &p) in w.iter_mut().zip(&probs) {
                    *dst = T::from_f64(p).unwrap_or(T::zero());
                }
            }
        };

        // [B, H, S, D]
        let mut out = Tensor::zeros([b, h, s, d]);
        let mut weights = params.return_weights.then(|| Tensor::zeros([b, h, s, s]));

        match weights.as_mut() {
            Some(w) => out
                .data_mut()
                .par_chunks_mut(d)
                .zip(w.data_mut().par_chunks_mut(s))
                .enumerate()
                .for_each(|(row, (o, w))| attend_row(row, o, Some(w))),
            None => out
                .data_mut()
                .par_chunks_mut(d)
                .enumerate()
                .for_each(|(row, o)| attend_row(row, o, None)),
        }

        Ok((out.transpose_axes(1, 2)?, weights))
    }
}
