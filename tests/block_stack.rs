use llama_blocks::model::{BlockStack, ModelConfig};
use llama_blocks::nn::transformer::{
    BlockWeights, ExplicitAttention, FusedAttention, RotaryTable,
};
use llama_blocks::nn::{Mode, Module};
use llama_blocks::tensor::Tensor;
use llama_blocks::Error;

fn config(n_layers: usize) -> ModelConfig {
    ModelConfig {
        dim: 8,
        n_layers,
        n_heads: 2,
        n_kv_heads: Some(1),
        multiple_of: 4,
        max_seq_len: 16,
        ..ModelConfig::default()
    }
}

fn fill(shape: [usize; 2], seed: f64) -> Tensor<f64, 2> {
    let n = shape[0] * shape[1];
    let data = (0..n).map(|i| ((i as f64 + seed) * 0.37).sin() * 0.3).collect();
    Tensor::new(data, shape).unwrap()
}

/// Fixed, non-trivial weights for the `config()` geometry, with a per-layer seed offset.
fn weights(config: &ModelConfig, offset: f64) -> BlockWeights<f64> {
    let shapes = BlockWeights::<f64>::zeros(config).unwrap();
    let dim = config.dim;
    BlockWeights {
        attention_norm: Tensor::new((0..dim).map(|i| 1.0 + 0.1 * i as f64).collect(), [dim])
            .unwrap(),
        wq: fill(*shapes.wq.shape(), 1.0 + offset),
        wk: fill(*shapes.wk.shape(), 2.0 + offset),
        wv: fill(*shapes.wv.shape(), 3.0 + offset),
        wo: fill(*shapes.wo.shape(), 4.0 + offset),
        ffn_norm: Tensor::new((0..dim).map(|i| 1.0 - 0.05 * i as f64).collect(), [dim]).unwrap(),
        w1: fill(*shapes.w1.shape(), 5.0 + offset),
        w2: fill(*shapes.w2.shape(), 6.0 + offset),
        w3: fill(*shapes.w3.shape(), 7.0 + offset),
    }
}

fn input(batch: usize, seq: usize, dim: usize) -> Tensor<f64, 3> {
    let data = (0..batch * seq * dim).map(|i| (i as f64 * 0.3).cos()).collect();
    Tensor::new(data, [batch, seq, dim]).unwrap()
}

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() < tol, "index {}: {} vs {}", i, x, y);
    }
}

#[test]
fn test_single_block_golden() {
    let cfg = config(1);
    let stack = BlockStack::with_kernel(&cfg, vec![weights(&cfg, 0.0)], ExplicitAttention).unwrap();

    let y = stack.forward(&input(1, 3, 8), Mode::Inference).unwrap();

    #[rustfmt::skip]
    let expected = [
        -0.040458450, 1.195550970, 1.584464173, -1.034789122, 2.538464008, -2.077978376, 1.333156868, -1.062412648,
        -2.423049465, 0.904831744, -2.507567109, -0.111957621, -0.941983952, -1.484414146, 0.839508748, -1.741313902,
        0.737808066, 0.393254547, 0.012533815, 1.850100400, -0.142800731, 1.881649320, 0.512460129, 0.736015010,
    ];
    assert_eq!(y.shape(), &[1, 3, 8]);
    assert_close(y.data(), &expected, 1e-5);

    let fused = BlockStack::with_kernel(&cfg, vec![weights(&cfg, 0.0)], FusedAttention).unwrap();
    let y = fused.forward(&input(1, 3, 8), Mode::Inference).unwrap();
    assert_close(y.data(), &expected, 1e-5);
}

fn selector(rows: usize, cols: usize) -> Tensor<f64, 2> {
    let mut data = vec![0.0; rows * cols];
    for i in 0..rows.min(cols) {
        data[i * cols + i] = 1.0;
    }
    Tensor::new(data, [rows, cols]).unwrap()
}

#[test]
fn test_single_block_identity_weights() {
    // wq = wo = I, wk = wv select channels 0..4, unit norms, zero feed-forward:
    // out = x + attention(rmsnorm(x)), and both query heads share the single kv head.
    let cfg = config(1);
    let mut w = BlockWeights::<f64>::zeros(&cfg).unwrap();
    w.wq = selector(8, 8);
    w.wk = selector(4, 8);
    w.wv = selector(4, 8);
    w.wo = selector(8, 8);

    #[rustfmt::skip]
    let x = Tensor::new(vec![
        1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
        0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
        1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0,
    ], [1, 3, 8]).unwrap();

    // Token 0 sees only itself, so both heads return v0 = rmsnorm(x0)[0..4]
    // = [sqrt(8 / (1 + 8e-5)), 0, 0, 0].
    let v0 = (8.0f64 / (1.0 + 8e-5)).sqrt();
    // Token 1, head 1 reads channels 4..8 of the query, which are zero: uniform weights
    // over keys 0 and 1, i.e. the mean of v0 and v1 = [0, sqrt(8 / (1 + 2e-5)), 0, 0].
    let v1 = (8.0f64 / (1.0 + 2e-5)).sqrt();

    #[rustfmt::skip]
    let expected = [
        1.0 + v0, 0.0, 0.0, 0.0, v0, 0.0, 0.0, 0.0,
        0.001788126, 4.826610662, 0.0, 0.0, v0 / 2.0, v1 / 2.0, 0.0, 0.0,
        1.456748891, 3.371649693, 0.0, 0.0, 1.456748891, 3.371649693, 0.0, 0.0,
    ];

    for kernel_output in [
        BlockStack::with_kernel(&cfg, vec![w.clone()], ExplicitAttention)
            .unwrap()
            .forward(&x, Mode::Inference)
            .unwrap(),
        BlockStack::with_kernel(&cfg, vec![w.clone()], FusedAttention)
            .unwrap()
            .forward(&x, Mode::Inference)
            .unwrap(),
    ] {
        assert_close(kernel_output.data(), &expected, 1e-5);
    }
}

#[test]
fn test_single_block_golden_f32() {
    let cfg = config(1);
    let w = weights(&cfg, 0.0);
    let w32 = BlockWeights::<f32> {
        attention_norm: w.attention_norm.map_to_f32(),
        wq: w.wq.map_to_f32(),
        wk: w.wk.map_to_f32(),
        wv: w.wv.map_to_f32(),
        wo: w.wo.map_to_f32(),
        ffn_norm: w.ffn_norm.map_to_f32(),
        w1: w.w1.map_to_f32(),
        w2: w.w2.map_to_f32(),
        w3: w.w3.map_to_f32(),
    };
    let stack = BlockStack::new(&cfg, vec![w32]).unwrap();
    let y = stack
        .forward(&input(1, 3, 8).map_to_f32(), Mode::Inference)
        .unwrap();
    let reference = BlockStack::new(&cfg, vec![w]).unwrap();
    let expected = reference.forward(&input(1, 3, 8), Mode::Inference).unwrap();

    for (a, b) in y.data().iter().zip(expected.data()) {
        assert!((*a as f64 - b).abs() < 1e-4);
    }
}

trait MapToF32<const R: usize> {
    fn map_to_f32(&self) -> Tensor<f32, R>;
}

impl<const R: usize> MapToF32<R> for Tensor<f64, R> {
    fn map_to_f32(&self) -> Tensor<f32, R> {
        Tensor::new(self.data().iter().map(|&v| v as f32).collect(), *self.shape()).unwrap()
    }
}

#[test]
fn test_forward_is_deterministic() {
    let cfg = config(2);
    let stack = BlockStack::new(&cfg, vec![weights(&cfg, 0.0), weights(&cfg, 10.0)]).unwrap();
    let x = input(2, 5, 8);

    let a = stack.forward(&x, Mode::Inference).unwrap();
    let b = stack.forward(&x, Mode::Inference).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_training_mode_is_seeded() {
    let mut cfg = config(2);
    cfg.dropout = 0.25;
    let stack = BlockStack::new(&cfg, vec![weights(&cfg, 0.0), weights(&cfg, 10.0)]).unwrap();
    let x = input(1, 4, 8);

    let a = stack.forward(&x, Mode::Training { seed: 7 }).unwrap();
    let b = stack.forward(&x, Mode::Training { seed: 7 }).unwrap();
    let c = stack.forward(&x, Mode::Training { seed: 8 }).unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);

    // Dropout is inactive at inference.
    let mut clean_cfg = cfg.clone();
    clean_cfg.dropout = 0.0;
    let clean = BlockStack::new(&clean_cfg, vec![weights(&cfg, 0.0), weights(&cfg, 10.0)]).unwrap();
    assert_eq!(
        stack.forward(&x, Mode::Inference).unwrap(),
        clean.forward(&x, Mode::Inference).unwrap()
    );
}

#[test]
fn test_rotary_table_length_does_not_change_output() {
    let short = config(1);
    let mut long = short.clone();
    long.max_seq_len = 512;

    let a = BlockStack::new(&short, vec![weights(&short, 0.0)]).unwrap();
    let b = BlockStack::new(&long, vec![weights(&long, 0.0)]).unwrap();
    let x = input(1, 5, 8);

    assert_eq!(
        a.forward(&x, Mode::Inference).unwrap(),
        b.forward(&x, Mode::Inference).unwrap()
    );

    let table = RotaryTable::build(4, 64, long.rope_theta).unwrap();
    assert_eq!(
        a.forward(&x, Mode::Inference).unwrap(),
        a.forward_with_rotary(&x, &table, Mode::Inference).unwrap()
    );
}

#[test]
fn test_strategies_agree_across_layers() {
    let cfg = config(3);
    let layers = || (0..3).map(|i| weights(&cfg, 10.0 * i as f64)).collect::<Vec<_>>();
    let explicit = BlockStack::with_kernel(&cfg, layers(), ExplicitAttention).unwrap();
    let fused = BlockStack::with_kernel(&cfg, layers(), FusedAttention).unwrap();
    let x = input(2, 7, 8);

    let a = explicit.forward(&x, Mode::Inference).unwrap();
    let b = fused.forward(&x, Mode::Inference).unwrap();
    assert_close(a.data(), b.data(), 1e-9);

    let a = explicit.forward(&x, Mode::Training { seed: 3 }).unwrap();
    let b = fused.forward(&x, Mode::Training { seed: 3 }).unwrap();
    assert_close(a.data(), b.data(), 1e-9);
}

#[test]
fn test_batches_are_independent() {
    let cfg = config(1);
    let stack = BlockStack::new(&cfg, vec![weights(&cfg, 0.0)]).unwrap();
    let x = input(2, 3, 8);
    let y = stack.forward(&x, Mode::Inference).unwrap();

    let second = Tensor::new(x.data()[24..].to_vec(), [1, 3, 8]).unwrap();
    let y2 = stack.forward(&second, Mode::Inference).unwrap();
    assert_close(&y.data()[24..], y2.data(), 1e-12);
}

#[test]
fn test_parameter_count() {
    let cfg = config(2);
    let stack = BlockStack::new(&cfg, vec![weights(&cfg, 0.0), weights(&cfg, 1.0)]).unwrap();
    // attention 64 + 32 + 32 + 64, feed-forward 3 * 24 * 8, norms 2 * 8
    assert_eq!(stack.num_parameters(), 2 * (192 + 576 + 16));
}

#[test]
fn test_construction_errors() {
    let cfg = config(1);

    let mut bad = cfg.clone();
    bad.dim = 10;
    bad.n_heads = 3;
    assert!(matches!(
        BlockStack::new(&bad, vec![weights(&cfg, 0.0)]),
        Err(Error::InvalidConfig(_))
    ));

    let mut w = weights(&cfg, 0.0);
    w.wk = Tensor::zeros([8, 8]);
    assert!(matches!(
        BlockStack::new(&cfg, vec![w]),
        Err(Error::InvalidConfig(_))
    ));

    let stack = BlockStack::new(&cfg, vec![weights(&cfg, 0.0)]).unwrap();
    assert!(matches!(
        stack.forward(&input(1, 17, 8), Mode::Inference),
        Err(Error::ShapeMismatch { .. })
    ));
}

#[test]
fn test_empty_sequence() {
    let cfg = config(1);
    let stack = BlockStack::new(&cfg, vec![weights(&cfg, 0.0)]).unwrap();
    let y = stack.forward(&Tensor::zeros([1, 0, 8]), Mode::Inference).unwrap();
    assert_eq!(y.shape(), &[1, 0, 8]);
}

#[test]
fn test_half_precision_tracks_f64() {
    use half::f16;

    let cfg = config(1);
    let w = weights(&cfg, 0.0);
    let cast2 = |t: &Tensor<f64, 2>| {
        Tensor::new(t.data().iter().map(|&v| f16::from_f64(v)).collect(), *t.shape()).unwrap()
    };
    let cast1 = |t: &Tensor<f64, 1>| {
        Tensor::new(t.data().iter().map(|&v| f16::from_f64(v)).collect(), *t.shape()).unwrap()
    };
    let w16 = BlockWeights::<f16> {
        attention_norm: cast1(&w.attention_norm),
        wq: cast2(&w.wq),
        wk: cast2(&w.wk),
        wv: cast2(&w.wv),
        wo: cast2(&w.wo),
        ffn_norm: cast1(&w.ffn_norm),
        w1: cast2(&w.w1),
        w2: cast2(&w.w2),
        w3: cast2(&w.w3),
    };

    let x = input(1, 3, 8);
    let x16 = Tensor::new(x.data().iter().map(|&v| f16::from_f64(v)).collect(), [1, 3, 8]).unwrap();

    let y16 = BlockStack::new(&cfg, vec![w16]).unwrap().forward(&x16, Mode::Inference).unwrap();
    let y = BlockStack::new(&cfg, vec![w]).unwrap().forward(&x, Mode::Inference).unwrap();
    for (a, b) in y16.data().iter().zip(y.data()) {
        assert!((a.to_f64() - b).abs() < 0.1);
    }
}
