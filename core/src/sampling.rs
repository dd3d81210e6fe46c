//! Autoregressive generation against a KV cache.

use crate::cache::KvCache;
use crate::config::Config;
use crate::distributed::ShardedTensor;
use crate::error::{Error, Result};
use crate::model::{forward, Weights};
use crate::tensor::{Tensor, TensorError};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, instrument};

/// How tokens are chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingOptions {
    /// Take the arg-max instead of sampling.
    pub greedy: bool,
    pub temperature: f32,
    /// Seeds the generator used for every token of one call.
    pub seed: u64,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            greedy: true,
            temperature: 1.0,
            seed: 0,
        }
    }
}

impl SamplingOptions {
    /// Temperature sampling with the given seed.
    pub fn sampled(temperature: f32, seed: u64) -> Self {
        Self {
            greedy: false,
            temperature,
            seed,
        }
    }
}

/// Right-pads `tokens` to `pad_to` with `pad_id`, returning the `[1, pad_to]` row and its segment
/// ids: 1 for the original tokens, 0 for the padding.
pub fn prepare_chunk(tokens: &[i32], pad_to: usize, pad_id: i32) -> Result<(Tensor<i32, 2>, Tensor<i32, 2>)> {
    if tokens.len() > pad_to {
        return Err(TensorError::ShapeMismatch {
            expected: vec![pad_to],
            got: vec![tokens.len()],
        }
        .into());
    }
    let mut row = tokens.to_vec();
    row.resize(pad_to, pad_id);
    let segments = (0..pad_to).map(|i| i32::from(i < tokens.len())).collect();
    Ok((Tensor::new(row, [1, pad_to])?, Tensor::new(segments, [1, pad_to])?))
}

/// Picks a token from one row of logits.
///
/// Greedy selection is the arg-max. Otherwise the logits are divided by `temperature` and a token
/// is drawn from their softmax.
pub fn sample_next_token<R: Rng + ?Sized>(
    logits: &[f32],
    temperature: f32,
    greedy: bool,
    rng: &mut R,
) -> Result<i32> {
    if logits.is_empty() {
        return Err(Error::Config("cannot sample from empty logits".to_string()));
    }
    let argmax = || {
        let mut best = 0;
        for (i, &x) in logits.iter().enumerate() {
            if x > logits[best] {
                best = i;
            }
        }
        best
    };
    if greedy {
        return Ok(argmax() as i32);
    }
    if temperature.is_nan() || temperature <= 0.0 {
        return Err(Error::Config(format!(
            "temperature must be positive, got {temperature}"
        )));
    }

    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<f64> = logits
        .iter()
        .map(|&x| (((x - max) / temperature) as f64).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    let mut u = rng.random::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        if u < *w {
            return Ok(i as i32);
        }
        u -= w;
    }
    // Only reachable through rounding at the top of the range.
    Ok(argmax() as i32)
}

fn next_power_of_two_capped(n: usize, cap: usize) -> usize {
    n.next_power_of_two().min(cap)
}

/// Generates `steps` tokens continuing `prompt` in row `batch_row` of `cache`.
///
/// The row is reset, the prompt is right-padded to the next power of two (at most
/// `max_seq_len`) and ingested with one forward call, then each new token is fed back with one
/// call of length 1. Every other row of the cache is passed as padding and left as it was.
#[instrument(skip_all, fields(row = batch_row, prompt_len = prompt.len(), steps = steps))]
pub fn sample_from_prompt(
    prompt: &[i32],
    weights: &Weights<ShardedTensor>,
    cache: &mut KvCache,
    cfg: &Config,
    batch_row: usize,
    steps: usize,
    options: SamplingOptions,
) -> Result<Vec<i32>> {
    if prompt.is_empty() || prompt.len() > cfg.max_seq_len {
        return Err(Error::Config(format!(
            "prompt length must be in 1..={}, got {}",
            cfg.max_seq_len,
            prompt.len()
        )));
    }
    let batch = cache.batch_size();
    if batch_row >= batch {
        return Err(TensorError::IndexOutOfBounds {
            index: vec![batch_row],
            shape: vec![batch],
        }
        .into());
    }

    let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
    let pad_to = next_power_of_two_capped(prompt.len(), cfg.max_seq_len);
    cache.reset_row(batch_row)?;

    let (chunk, segments) = prepare_chunk(prompt, pad_to, 0)?;
    let (tokens, segment_ids) = place_row(&chunk, &segments, batch, batch_row)?;
    let logits = forward(&tokens, &segment_ids, weights, cfg, Some(&mut *cache))?;
    debug!(pad_to, length = cache.lengths[batch_row], "ingested prompt");

    let vocab = cfg.vocab_size;
    let last = prompt.len() - 1;
    let offset = (batch_row * pad_to + last) * vocab;
    let mut next_logits = logits.data()[offset..offset + vocab].to_vec();

    let mut generated = Vec::with_capacity(steps);
    for _ in 0..steps {
        let token = sample_next_token(&next_logits, options.temperature, options.greedy, &mut rng)?;
        generated.push(token);

        let (chunk, segments) = prepare_chunk(&[token], 1, 0)?;
        let (tokens, segment_ids) = place_row(&chunk, &segments, batch, batch_row)?;
        let logits = forward(&tokens, &segment_ids, weights, cfg, Some(&mut *cache))?;
        next_logits = logits.data()[batch_row * vocab..(batch_row + 1) * vocab].to_vec();
    }
    Ok(generated)
}

/// Spreads a `[1, T]` chunk into a `[batch, T]` batch where every other row is padding.
fn place_row(
    chunk: &Tensor<i32, 2>,
    segments: &Tensor<i32, 2>,
    batch: usize,
    row: usize,
) -> Result<(Tensor<i32, 2>, Tensor<i32, 2>)> {
    let t = chunk.shape()[1];
    let mut tokens = vec![0; batch * t];
    let mut segment_ids = vec![0; batch * t];
    tokens[row * t..(row + 1) * t].copy_from_slice(chunk.data());
    segment_ids[row * t..(row + 1) * t].copy_from_slice(segments.data());
    Ok((Tensor::new(tokens, [batch, t])?, Tensor::new(segment_ids, [batch, t])?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::Mesh;
    use crate::model::init;

    fn micro() -> Config {
        Config::tiny(Mesh::single_host())
            .with_dims(16, 2, 4, 2, 2, 8, 32, 16)
            .with_attn_kernel(false)
    }

    #[test]
    fn test_prepare_chunk() {
        let (row, seg) = prepare_chunk(&[5, 0, 7], 4, 0).unwrap();
        assert_eq!(row.data(), &[5, 0, 7, 0]);
        // A literal token 0 inside the prompt is still a real token.
        assert_eq!(seg.data(), &[1, 1, 1, 0]);
        assert!(prepare_chunk(&[1, 2, 3], 2, 0).is_err());
    }

    #[test]
    fn test_pad_length() {
        assert_eq!(next_power_of_two_capped(1, 16), 1);
        assert_eq!(next_power_of_two_capped(5, 16), 8);
        assert_eq!(next_power_of_two_capped(13, 12), 12);
    }

    #[test]
    fn test_sample_next_token() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let logits = [0.0, 3.0, 1.0];
        assert_eq!(sample_next_token(&logits, 1.0, true, &mut rng).unwrap(), 1);
        // A very low temperature is effectively greedy.
        for _ in 0..20 {
            assert_eq!(sample_next_token(&logits, 1e-3, false, &mut rng).unwrap(), 1);
        }
        assert!(sample_next_token(&logits, 0.0, false, &mut rng).is_err());
        assert!(sample_next_token(&[], 1.0, true, &mut rng).is_err());
    }

    #[test]
    fn test_sampling_is_reproducible_per_seed() {
        let cfg = micro();
        let weights = init(&cfg, 0, true).unwrap();
        let mut cache = KvCache::init(&cfg, 2).unwrap();
        let opts = SamplingOptions::sampled(1.0, 42);
        let a = sample_from_prompt(&[1, 2, 3], &weights, &mut cache, &cfg, 1, 4, opts).unwrap();
        let b = sample_from_prompt(&[1, 2, 3], &weights, &mut cache, &cfg, 1, 4, opts).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.lengths, vec![0, 3 + 4]);
        assert!(a.iter().all(|&t| (0..32).contains(&t)));
    }

    #[test]
    fn test_sampling_preconditions() {
        let cfg = micro();
        let weights = init(&cfg, 0, true).unwrap();
        let mut cache = KvCache::init(&cfg, 1).unwrap();
        let opts = SamplingOptions::default();
        assert!(sample_from_prompt(&[], &weights, &mut cache, &cfg, 0, 1, opts).is_err());
        assert!(sample_from_prompt(&[1; 17], &weights, &mut cache, &cfg, 0, 1, opts).is_err());
        assert!(sample_from_prompt(&[1], &weights, &mut cache, &cfg, 1, 1, opts).is_err());
    }
}
