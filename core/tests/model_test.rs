use minformer::attention::{reference, AttentionMask};
use minformer::distributed::{ShardingRules, MESH_AXIS};
use minformer::loss::cross_entropy_loss;
use minformer::tensor::Tensor;
use minformer::{
    backward, create_mesh, forward, forward_with_tape, init, Config, DType, Error, HostDevices,
    KvCache, Mesh, ShardedTensor, Weights,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

fn micro(mesh: Mesh) -> Config {
    Config::tiny(mesh)
        .with_dims(16, 2, 4, 2, 2, 8, 32, 16)
        .with_attn_kernel(false)
}

fn random_tokens(rng: &mut StdRng, shape: [usize; 2], vocab: usize) -> Tensor<i32, 2> {
    let data = (0..shape[0] * shape[1])
        .map(|_| rng.random_range(0..vocab as i32))
        .collect();
    Tensor::new(data, shape).unwrap()
}

fn row(logits: &Tensor<f32, 3>, b: usize, t: usize) -> Vec<f32> {
    let [_, seq, vocab] = *logits.shape();
    let start = (b * seq + t) * vocab;
    logits.data()[start..start + vocab].to_vec()
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() < tol, "{x} vs {y}");
    }
}

#[test]
fn test_tiny_forward_shape_and_argmax() {
    let mesh = create_mesh(&HostDevices::new(2)).unwrap();
    let cfg = Config::tiny(mesh);
    let weights = init(&cfg, 0, true).unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    let tokens = random_tokens(&mut rng, [2, 16], cfg.vocab_size);
    let seg = Tensor::<i32, 2>::ones([2, 16]);

    let logits = forward(&tokens, &seg, &weights, &cfg, None).unwrap();
    assert_eq!(logits.shape(), &[2, 16, cfg.vocab_size]);
    let argmax = logits.argmax_last();
    assert_eq!(argmax.len(), 32);
    assert!(argmax.iter().all(|&t| t < cfg.vocab_size));
}

#[test]
fn test_unmasked_attention_is_permutation_invariant() {
    let mut rng = StdRng::seed_from_u64(1);
    let (b, h, t, s, d) = (2, 2, 3, 7, 4);
    let mut sample = |shape: [usize; 4]| {
        let data = (0..shape.iter().product::<usize>())
            .map(|_| rng.random_range(-1.0f32..1.0))
            .collect();
        Tensor::<f32, 4>::new(data, shape).unwrap()
    };
    let q = sample([b, h, t, d]);
    let k = sample([b, h, s, d]);
    let v = sample([b, h, s, d]);
    let mask = AttentionMask::unmasked(b, t, s);
    let (out, _) = reference::attention(&q, &k, &v, &mask, DType::F32).unwrap();

    let mut perm: Vec<usize> = (0..s).collect();
    perm.shuffle(&mut rng);
    let permute = |x: &Tensor<f32, 4>| {
        Tensor::<f32, 4>::from_fn([b, h, s, d], |i| {
            let (head, rest) = (i / (s * d), i % (s * d));
            let (pos, feat) = (rest / d, rest % d);
            x.data()[head * s * d + perm[pos] * d + feat]
        })
    };
    let (permuted, _) =
        reference::attention(&q, &permute(&k), &permute(&v), &mask, DType::F32).unwrap();
    assert!(out.max_abs_diff(&permuted).unwrap() < 1e-5);
}

#[test]
fn test_cache_matches_full_sequence() {
    let cfg = micro(Mesh::single_host());
    let weights = init(&cfg, 2, true).unwrap();
    let mut rng = StdRng::seed_from_u64(2);
    let total = 11;
    let tokens = random_tokens(&mut rng, [1, total], cfg.vocab_size);
    let full = forward(&tokens, &Tensor::ones([1, total]), &weights, &cfg, None).unwrap();

    // A 5-token prompt padded to 8, then one token at a time.
    let prompt_len = 5;
    let mut cache = KvCache::init(&cfg, 1).unwrap();
    let mut chunk = tokens.data()[..prompt_len].to_vec();
    chunk.resize(8, 0);
    let seg: Vec<i32> = (0..8).map(|i| i32::from(i < prompt_len)).collect();
    let logits = forward(
        &Tensor::new(chunk, [1, 8]).unwrap(),
        &Tensor::new(seg, [1, 8]).unwrap(),
        &weights,
        &cfg,
        Some(&mut cache),
    )
    .unwrap();
    assert_eq!(cache.lengths, vec![prompt_len]);
    for t in 0..prompt_len {
        assert_close(&row(&logits, 0, t), &row(&full, 0, t), 1e-4);
    }

    for t in prompt_len..total {
        let token = Tensor::new(vec![tokens.data()[t]], [1, 1]).unwrap();
        let logits = forward(&token, &Tensor::ones([1, 1]), &weights, &cfg, Some(&mut cache)).unwrap();
        assert_close(&row(&logits, 0, 0), &row(&full, 0, t), 1e-4);
    }
    assert_eq!(cache.lengths, vec![total]);
}

#[test]
fn test_cache_on_sharded_mesh_matches_single_device() {
    let mesh = create_mesh(&HostDevices::new(2)).unwrap();
    let sharded_cfg = micro(mesh).with_rules(ShardingRules::model_parallel(MESH_AXIS));
    let cfg = micro(Mesh::single_host());
    let weights = init(&cfg, 4, true).unwrap();
    let sharded_weights = init(&sharded_cfg, 4, true).unwrap();

    let tokens = Tensor::<i32, 2>::from_fn([2, 4], |i| (i * 3 % 32) as i32);
    let seg = Tensor::<i32, 2>::new(vec![1, 1, 1, 0, 1, 1, 0, 0], [2, 4]).unwrap();
    let mut a = KvCache::init(&cfg, 2).unwrap();
    let mut b = KvCache::init(&sharded_cfg, 2).unwrap();
    let la = forward(&tokens, &seg, &weights, &cfg, Some(&mut a)).unwrap();
    let lb = forward(&tokens, &seg, &sharded_weights, &sharded_cfg, Some(&mut b)).unwrap();
    assert!(la.max_abs_diff(&lb).unwrap() < 1e-5);
    assert_eq!(a.lengths, vec![3, 2]);
    assert_eq!(a.lengths, b.lengths);
    let (ka, kb) = (a.k[1].gather_vec(), b.k[1].gather_vec());
    assert!(ka.iter().zip(&kb).all(|(x, y)| (x - y).abs() < 1e-5));
}

#[test]
fn test_lengths_are_monotonic() {
    let cfg = micro(Mesh::single_host());
    let weights = init(&cfg, 0, true).unwrap();
    let mut cache = KvCache::init(&cfg, 3).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let mut expected = vec![0usize; 3];

    for _ in 0..6 {
        let tokens = random_tokens(&mut rng, [3, 2], cfg.vocab_size);
        // Each row gets 0, 1 or 2 valid tokens, left-aligned.
        let valid: Vec<usize> = (0..3).map(|_| rng.random_range(0..=2)).collect();
        let seg = Tensor::<i32, 2>::from_fn([3, 2], |i| i32::from(i % 2 < valid[i / 2]));
        let before = cache.lengths.clone();
        forward(&tokens, &seg, &weights, &cfg, Some(&mut cache)).unwrap();
        for r in 0..3 {
            expected[r] += valid[r];
            assert!(cache.lengths[r] >= before[r]);
        }
        assert_eq!(cache.lengths, expected);
    }
}

#[test]
fn test_ragged_rows_match_uncached_rows() {
    let cfg = micro(Mesh::single_host());
    let weights = init(&cfg, 5, true).unwrap();
    let prompts: [&[i32]; 2] = [&[1, 2, 3], &[4, 5, 6, 7, 8, 9]];
    let next = [10, 11];

    // Both prompts in one padded chunk, then one decode step for both rows.
    let mut cache = KvCache::init(&cfg, 2).unwrap();
    let mut chunk = vec![0; 16];
    let mut seg = vec![0; 16];
    for (r, prompt) in prompts.iter().enumerate() {
        chunk[r * 8..r * 8 + prompt.len()].copy_from_slice(prompt);
        seg[r * 8..r * 8 + prompt.len()].fill(1);
    }
    let prefill = forward(
        &Tensor::new(chunk, [2, 8]).unwrap(),
        &Tensor::new(seg, [2, 8]).unwrap(),
        &weights,
        &cfg,
        Some(&mut cache),
    )
    .unwrap();
    let decode = forward(
        &Tensor::new(next.to_vec(), [2, 1]).unwrap(),
        &Tensor::ones([2, 1]),
        &weights,
        &cfg,
        Some(&mut cache),
    )
    .unwrap();
    assert_eq!(cache.lengths, vec![4, 7]);

    for (r, prompt) in prompts.iter().enumerate() {
        let mut full_row = prompt.to_vec();
        full_row.push(next[r]);
        let len = full_row.len();
        let full = forward(
            &Tensor::new(full_row, [1, len]).unwrap(),
            &Tensor::ones([1, len]),
            &weights,
            &cfg,
            None,
        )
        .unwrap();
        for t in 0..prompt.len() {
            assert_close(&row(&prefill, r, t), &row(&full, 0, t), 1e-4);
        }
        assert_close(&row(&decode, r, 0), &row(&full, 0, len - 1), 1e-4);
    }
}

#[test]
fn test_kernel_with_cache_is_rejected() {
    let cfg = micro(Mesh::single_host()).with_attn_kernel(true);
    let weights = init(&cfg, 0, true).unwrap();
    let mut cache = KvCache::init(&cfg, 1).unwrap();
    let tokens = Tensor::<i32, 2>::ones([1, 2]);
    let result = forward(&tokens, &tokens, &weights, &cfg, Some(&mut cache));
    assert!(matches!(result, Err(Error::KernelWithCache)));
    assert_eq!(cache.lengths, vec![0]);
}

#[test]
fn test_overflow_is_rejected_before_mutation() {
    let cfg = micro(Mesh::single_host());
    let weights = init(&cfg, 0, true).unwrap();
    let mut cache = KvCache::init(&cfg, 2).unwrap();
    let tokens = Tensor::<i32, 2>::ones([2, 14]);
    forward(&tokens, &tokens, &weights, &cfg, Some(&mut cache)).unwrap();
    let snapshot = cache.clone();

    // Row 1 is padding and would fit; row 0 would reach position 17 of 16.
    let tokens = Tensor::<i32, 2>::ones([2, 3]);
    let seg = Tensor::<i32, 2>::new(vec![1, 1, 1, 0, 0, 0], [2, 3]).unwrap();
    let result = forward(&tokens, &seg, &weights, &cfg, Some(&mut cache));
    assert!(matches!(
        result,
        Err(Error::SequenceOverflow {
            row: 0,
            end: 17,
            max: 16
        })
    ));
    assert_eq!(cache, snapshot);

    let too_long = Tensor::<i32, 2>::ones([1, 17]);
    assert!(matches!(
        forward(&too_long, &too_long, &weights, &cfg, None),
        Err(Error::SequenceOverflow { .. })
    ));
}

#[test]
fn test_out_of_vocab_token_is_rejected() {
    let cfg = micro(Mesh::single_host());
    let weights = init(&cfg, 0, true).unwrap();
    let tokens = Tensor::<i32, 2>::new(vec![1, 32], [1, 2]).unwrap();
    assert!(matches!(
        forward(&tokens, &Tensor::ones([1, 2]), &weights, &cfg, None),
        Err(Error::TokenOutOfRange { token: 32, vocab: 32 })
    ));
}

fn loss_at(weights: &Weights<ShardedTensor>, cfg: &Config, batch: &[Tensor<i32, 2>; 3]) -> f64 {
    let [x, seg, y] = batch;
    let logits = forward(x, seg, weights, cfg, None).unwrap();
    cross_entropy_loss(&logits, y, seg).unwrap().loss as f64
}

fn perturbed(p: &ShardedTensor, index: usize, delta: f32) -> ShardedTensor {
    let mut data = p.gather_vec();
    data[index] += delta;
    p.scatter_like(&data, p.dtype()).unwrap()
}

#[test]
fn test_gradients_match_finite_differences() {
    for use_kernel in [false, true] {
        let cfg = micro(Mesh::single_host()).with_attn_kernel(use_kernel);
        let weights = init(&cfg, 9, true).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let x = random_tokens(&mut rng, [2, 5], cfg.vocab_size);
        let y = random_tokens(&mut rng, [2, 5], cfg.vocab_size);
        let seg = Tensor::<i32, 2>::new(vec![1, 1, 1, 2, 2, 1, 1, 1, 1, 0], [2, 5]).unwrap();
        let batch = [x, seg, y];

        let (logits, tape) = forward_with_tape(&batch[0], &batch[1], &weights, &cfg).unwrap();
        let out = cross_entropy_loss(&logits, &batch[2], &batch[1]).unwrap();
        let grads = backward(&tape, &out.dlogits, &weights, &cfg).unwrap();

        let eps = 1e-2f32;
        let params = weights.leaves();
        let grad_leaves = grads.leaves();
        for (leaf, (path, param)) in params.iter().enumerate() {
            let analytic = grad_leaves[leaf].1.gather_vec();
            for _ in 0..3 {
                let i = rng.random_range(0..param.size());
                let mut plus = weights.clone();
                *plus.leaves_mut()[leaf] = perturbed(param, i, eps);
                let mut minus = weights.clone();
                *minus.leaves_mut()[leaf] = perturbed(param, i, -eps);
                let numeric =
                    (loss_at(&plus, &cfg, &batch) - loss_at(&minus, &cfg, &batch)) / (2.0 * eps as f64);
                let err = (numeric - analytic[i] as f64).abs();
                assert!(
                    err < 2e-3 + 0.05 * numeric.abs(),
                    "{path}[{i}] kernel={use_kernel}: numeric {numeric}, analytic {}",
                    analytic[i]
                );
            }
        }
    }
}
