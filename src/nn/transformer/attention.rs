use super::kernels::{AttendParams, AttentionKernel, DefaultAttention};
use super::rope::RotaryTable;
use crate::error::{Error, Result};
use crate::nn::{Dropout, DropoutSite, Linear, Mode, Module};
use crate::tensor::{Tensor, TensorElem};
use num_traits::Float;
use rayon::prelude::*;
use tracing::debug;

/// Output of [`GroupedQueryAttention::forward_with_weights`]: `[batch, seq, dim]` and the
/// attention probabilities `[batch, n_heads, query, key]`.
pub type ForwardWithWeightsOutput<T> = (Tensor<T, 3>, Tensor<T, 4>);

/// Causal multi-head self-attention with rotary embeddings and grouped key/value heads.
///
/// `n_heads` query heads share `n_kv_heads` key/value heads; query head `h` reads key/value
/// head `h / n_rep` where `n_rep = n_heads / n_kv_heads`. With `n_kv_heads == n_heads` this is
/// ordinary multi-head attention.
///
/// # Workflow
/// 1. Project `x` to queries `[B, S, H * D]` and keys/values `[B, S, KV * D]`.
/// 2. Split into heads by reshaping (no copy): `[B, S, H, D]`, `[B, S, KV, D]`.
/// 3. Rotate queries and keys with the rotary table.
/// 4. Run the attention kernel `K` (causal mask, stable softmax, dropout, weighted sum).
/// 5. Merge heads, apply the output projection, then residual dropout.
///
/// Shape invariants are checked once in the constructor; `forward` only checks the input.
#[derive(Debug, Clone)]
pub struct GroupedQueryAttention<T: TensorElem, K: AttentionKernel = DefaultAttention> {
    pub wq: Linear<T>,
    pub wk: Linear<T>,
    pub wv: Linear<T>,
    pub wo: Linear<T>,

    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    attn_dropout: Dropout,
    resid_dropout: Dropout,
    kernel: K,
}

impl<T: TensorElem + Float> GroupedQueryAttention<T, DefaultAttention> {
    /// Builds the layer with the default attention strategy.
    ///
    /// Weights use the `[out, in]` layout: `wq` is `[n_heads * head_dim, dim]`, `wk`/`wv` are
    /// `[n_kv_heads * head_dim, dim]` and `wo` is `[dim, n_heads * head_dim]`, with
    /// `head_dim = dim / n_heads`.
    pub fn new(
        n_heads: usize,
        n_kv_heads: usize,
        wq: Linear<T>,
        wk: Linear<T>,
        wv: Linear<T>,
        wo: Linear<T>,
    ) -> Result<Self> {
        Self::with_kernel(n_heads, n_kv_heads, wq, wk, wv, wo, DefaultAttention::default())
    }
}

impl<T: TensorElem + Float, K: AttentionKernel> GroupedQueryAttention<T, K> {
    /// Builds the layer with an explicit attention strategy.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the head counts or weight shapes are inconsistent.
    pub fn with_kernel(
        n_heads: usize,
        n_kv_heads: usize,
        wq: Linear<T>,
        wk: Linear<T>,
        wv: Linear<T>,
        wo: Linear<T>,
        kernel: K,
    ) -> Result<Self> {
        if n_heads == 0 || n_kv_heads == 0 || n_heads % n_kv_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "n_heads ({}) must be a positive multiple of n_kv_heads ({})",
                n_heads, n_kv_heads
            )));
        }

        let dim = wq.in_features();
        if dim == 0 || dim % n_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "dim ({}) must be a positive multiple of n_heads ({})",
                dim, n_heads
            )));
        }
        let head_dim = dim / n_heads;
        if head_dim % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "head_dim ({}) must be even for rotary embeddings",
                head_dim
            )));
        }

        let q_dim = n_heads * head_dim;
        let kv_dim = n_kv_heads * head_dim;
        check_weight("wq", &wq, q_dim, dim)?;
        check_weight("wk", &wk, kv_dim, dim)?;
        check_weight("wv", &wv, kv_dim, dim)?;
        check_weight("wo", &wo, dim, q_dim)?;

        debug!(
            strategy = K::NAME,
            n_heads, n_kv_heads, head_dim, "grouped-query attention ready"
        );

        Ok(Self {
            wq,
            wk,
            wv,
            wo,
            n_heads,
            n_kv_heads,
            head_dim,
            attn_dropout: Dropout::new(0.0, 0)?,
            resid_dropout: Dropout::new(0.0, 0)?,
            kernel,
        })
    }

    /// Enables dropout with probability `p` on the attention probabilities and on the output
    /// projection, using random streams private to `layer_id`.
    pub fn with_dropout(mut self, p: f64, layer_id: usize) -> Result<Self> {
        self.attn_dropout = Dropout::new(p, DropoutSite::AttentionProbs.id(layer_id))?;
        self.resid_dropout = Dropout::new(p, DropoutSite::AttentionResidual.id(layer_id))?;
        Ok(self)
    }

    pub fn dim(&self) -> usize {
        self.wq.in_features()
    }

    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    pub fn n_kv_heads(&self) -> usize {
        self.n_kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn n_rep(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    /// Attends over `x` (`[batch, seq, dim]`); the output has the same shape.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShapeMismatch` if the channel width is not `dim`, the rotary table was
    /// built for another head width, or `seq` exceeds the table length.
    pub fn forward(
        &self,
        x: &Tensor<T, 3>,
        rope: &RotaryTable<T>,
        mode: Mode,
    ) -> Result<Tensor<T, 3>> {
        let (out, _) = self.forward_impl(x, rope, mode, false)?;
        Ok(out)
    }

    /// Like [`forward`](Self::forward), also returning the attention probabilities
    /// `[batch, n_heads, query, key]` that were applied to the values.
    pub fn forward_with_weights(
        &self,
        x: &Tensor<T, 3>,
        rope: &RotaryTable<T>,
        mode: Mode,
    ) -> Result<ForwardWithWeightsOutput<T>> {
        let (out, weights) = self.forward_impl(x, rope, mode, true)?;
        let [b, s, _] = *x.shape();
        Ok((
            out,
            weights.unwrap_or_else(|| Tensor::zeros([b, self.n_heads, s, s])),
        ))
    }

    fn forward_impl(
        &self,
        x: &Tensor<T, 3>,
        rope: &RotaryTable<T>,
        mode: Mode,
        return_weights: bool,
    ) -> Result<(Tensor<T, 3>, Option<Tensor<T, 4>>)> {
        let [b, s, c] = *x.shape();
        if c != self.dim() {
            return Err(Error::ShapeMismatch {
                expected: vec![b, s, self.dim()],
                got: vec![b, s, c],
            });
        }
        if rope.head_dim() != self.head_dim {
            return Err(Error::ShapeMismatch {
                expected: vec![self.head_dim],
                got: vec![rope.head_dim()],
            });
        }

        let q = self.wq.forward(x)?.reshape([b, s, self.n_heads, self.head_dim])?;
        let k = self.wk.forward(x)?.reshape([b, s, self.n_kv_heads, self.head_dim])?;
        let v = self.wv.forward(x)?.reshape([b, s, self.n_kv_heads, self.head_dim])?;

        let q = rope.rotate(&q)?;
        let k = rope.rotate(&k)?;

        let params = AttendParams {
            scale: 1.0 / (self.head_dim as f64).sqrt(),
            dropout: self.attn_dropout,
            mode,
            return_weights,
        };
        let (out, weights) = self.kernel.attend(&q, &k, &v, &params)?;

        let out = out.reshape([b, s, self.n_heads * self.head_dim])?;
        let out = self.wo.forward(&out)?;
        Ok((self.resid_dropout.forward(out, mode), weights))
    }
}

impl<T: TensorElem, K: AttentionKernel> Module<T> for GroupedQueryAttention<T, K> {
    fn num_parameters(&self) -> usize {
        self.wq.num_parameters()
            + self.wk.num_parameters()
            + self.wv.num_parameters()
            + self.wo.num_parameters()
    }
}

fn check_weight<T: TensorElem>(
    name: &str,
    layer: &Linear<T>,
    out: usize,
    inp: usize,
) -> Result<()> {
    let shape = layer.weight.shape();
    if shape != &[out, inp] {
        return Err(Error::InvalidConfig(format!(
            "{} must be [{}, {}], got {:?}",
            name, out, inp, shape
        )));
    }
    Ok(())
}

/// Expands key/value heads to match the query heads.
///
/// `[batch, seq, n_kv_heads, head_dim] -> [batch, seq, n_kv_heads * n_rep, head_dim]`; output
/// head `h` is a copy of input head `h / n_rep`, so each kv head is repeated `n_rep` times
/// contiguously.
pub fn repeat_kv<T: TensorElem>(x: &Tensor<T, 4>, n_rep: usize) -> Result<Tensor<T, 4>> {
    if n_rep == 0 {
        return Err(Error::InvalidConfig("n_rep must be > 0".into()));
    }
    if n_rep == 1 {
        return Ok(x.clone());
    }

    let [b, s, n_kv, d] = *x.shape();
    let n_heads = n_kv * n_rep;
    let mut out = Tensor::zeros([b, s, n_heads, d]);
    if out.size() == 0 {
        return Ok(out);
    }

    let src = x.data();
    out.data_mut()
        .par_chunks_mut(d)
        .enumerate()
        .for_each(|(row, dst)| {
            let token = row / n_heads;
            let kv_head = (row % n_heads) / n_rep;
            let src_off = (token * n_kv + kv_head) * d;
            dst.copy_from_slice(&src[src_off..src_off + d]);
        });

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::transformer::{ExplicitAttention, FusedAttention};

    fn tensor_eye(dim: usize) -> Tensor<f32, 2> {
        let mut data = vec![0.0; dim * dim];
        for i in 0..dim {
            data[i * dim + i] = 1.0;
        }
        Tensor::new(data, [dim, dim]).unwrap()
    }

    fn linear(out: usize, inp: usize, seed: f32) -> Linear<f32> {
        let data = (0..out * inp).map(|i| ((i as f32 + seed) * 0.61).sin() * 0.5).collect();
        Linear::new(Tensor::new(data, [out, inp]).unwrap(), None).unwrap()
    }

    fn gqa<K: AttentionKernel>(kernel: K) -> GroupedQueryAttention<f32, K> {
        // dim 8, 4 query heads of width 2, 2 kv heads
        GroupedQueryAttention::with_kernel(
            4,
            2,
            linear(8, 8, 1.0),
            linear(4, 8, 2.0),
            linear(4, 8, 3.0),
            linear(8, 8, 4.0),
            kernel,
        )
        .unwrap()
    }

    fn input(b: usize, s: usize, dim: usize) -> Tensor<f32, 3> {
        let data = (0..b * s * dim).map(|i| (i as f32 * 0.3).cos()).collect();
        Tensor::new(data, [b, s, dim]).unwrap()
    }

    #[test]
    fn test_repeat_kv_mapping() {
        // 2 kv heads -> 8 query heads: {0,1,2,3} -> 0, {4,5,6,7} -> 1
        let x = Tensor::<f32, 4>::new(vec![10.0, 11.0, 20.0, 21.0], [1, 1, 2, 2]).unwrap();
        let y = repeat_kv(&x, 4).unwrap();
        assert_eq!(y.shape(), &[1, 1, 8, 2]);
        for h in 0..8 {
            let expected = if h < 4 { [10.0, 11.0] } else { [20.0, 21.0] };
            assert_eq!(&y.data()[h * 2..h * 2 + 2], &expected);
        }

        assert_eq!(repeat_kv(&x, 1).unwrap(), x);
        assert!(matches!(repeat_kv(&x, 0), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_repeat_kv_per_token() {
        // [B=1, S=2, KV=1, D=1]
        let x = Tensor::<f32, 4>::new(vec![1.0, 2.0], [1, 2, 1, 1]).unwrap();
        let y = repeat_kv(&x, 3).unwrap();
        assert_eq!(y.data(), &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_construction_errors() {
        let ok = || {
            (
                Linear::new(tensor_eye(8), None).unwrap(),
                linear(4, 8, 0.0),
                linear(4, 8, 0.0),
                Linear::new(tensor_eye(8), None).unwrap(),
            )
        };

        let (wq, wk, wv, wo) = ok();
        // 4 query heads cannot share 3 kv heads
        assert!(matches!(
            GroupedQueryAttention::new(4, 3, wq, wk, wv, wo),
            Err(Error::InvalidConfig(_))
        ));

        let (wq, wk, wv, wo) = ok();
        // head_dim = 8 / 8 = 1 is odd
        assert!(matches!(
            GroupedQueryAttention::new(8, 4, wq, wk, wv, wo),
            Err(Error::InvalidConfig(_))
        ));

        let (wq, _, wv, wo) = ok();
        // wk sized for 4 kv heads, layer configured with 2 heads of width 4 and 1 kv head
        assert!(matches!(
            GroupedQueryAttention::new(2, 1, wq, linear(8, 8, 0.0), wv, wo),
            Err(Error::InvalidConfig(_))
        ));

        let (wq, wk, wv, wo) = ok();
        assert!(GroupedQueryAttention::new(4, 2, wq, wk, wv, wo).is_ok());
    }

    #[test]
    fn test_forward_shape_and_errors() {
        let attn = gqa(ExplicitAttention);
        let rope = RotaryTable::build(2, 8, 10000.0).unwrap();

        let y = attn.forward(&input(2, 5, 8), &rope, Mode::Inference).unwrap();
        assert_eq!(y.shape(), &[2, 5, 8]);

        assert!(matches!(
            attn.forward(&input(1, 3, 6), &rope, Mode::Inference),
            Err(Error::ShapeMismatch { .. })
        ));
        assert!(matches!(
            attn.forward(&input(1, 9, 8), &rope, Mode::Inference),
            Err(Error::ShapeMismatch { .. })
        ));

        let wide_rope = RotaryTable::build(4, 8, 10000.0).unwrap();
        assert!(matches!(
            attn.forward(&input(1, 3, 8), &wide_rope, Mode::Inference),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_strategies_agree_end_to_end() {
        let rope = RotaryTable::build(2, 16, 10000.0).unwrap();
        let x = input(2, 6, 8);

        let (a, wa) = gqa(ExplicitAttention)
            .forward_with_weights(&x, &rope, Mode::Inference)
            .unwrap();
        let (b, wb) = gqa(FusedAttention)
            .forward_with_weights(&x, &rope, Mode::Inference)
            .unwrap();

        for (x, y) in a.data().iter().zip(b.data()) {
            assert!((x - y).abs() < 1e-5);
        }
        for (x, y) in wa.data().iter().zip(wb.data()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_causal_prefix_is_independent_of_suffix() {
        // Output at position i must not depend on tokens after i.
        let attn = gqa(FusedAttention);
        let rope = RotaryTable::build(2, 8, 10000.0).unwrap();

        let full = input(1, 5, 8);
        let prefix = Tensor::new(full.data()[..3 * 8].to_vec(), [1, 3, 8]).unwrap();

        let y_full = attn.forward(&full, &rope, Mode::Inference).unwrap();
        let y_prefix = attn.forward(&prefix, &rope, Mode::Inference).unwrap();
        for (a, b) in y_prefix.data().iter().zip(&y_full.data()[..3 * 8]) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_num_parameters() {
        let attn = gqa(ExplicitAttention);
        assert_eq!(attn.num_parameters(), 64 + 32 + 32 + 64);
        assert_eq!(attn.n_rep(), 2);
        assert_eq!(attn.head_dim(), 2);
    }
}
