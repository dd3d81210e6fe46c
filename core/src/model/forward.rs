//! The forward pass.
//!
//! ```text
//! tokens ─ embed ─┬─ rms_norm ─ q/k/v ─ rope ─ [cache] ─ attention ─ proj ─(+)─┬─ rms_norm ─ w1 ─ gelu ─ w2 ─(+)─ ... ─ vocab_proj
//!                 └──────────────────────────────────────────────────────────┘ └────────────────────────────────┘
//! ```
//!
//! Each layer is gathered from its shards just before it runs and dropped right after.

use crate::attention::flash::{sharded_attention, KernelMask};
use crate::attention::{reference, AttentionMask, AttentionResidual};
use crate::cache::KvCache;
use crate::config::Config;
use crate::distributed::{Shardable, ShardedTensor};
use crate::error::{Error, Result};
use crate::model::weights::Weights;
use crate::nn::linear::{dense, project_heads, merge_heads};
use crate::nn::{embed, rms_norm, rope, Activation, RopeTables};
use crate::precision::DType;
use crate::tensor::{Tensor, TensorError};
use tracing::trace;

/// Activations one layer keeps for the backward pass.
#[derive(Debug, Clone)]
pub(crate) struct LayerTape {
    /// Residual stream entering the layer.
    pub x_in: Tensor<f32, 3>,
    pub h1: Tensor<f32, 3>,
    /// Queries and keys after rope.
    pub q: Tensor<f32, 4>,
    pub k: Tensor<f32, 4>,
    pub v: Tensor<f32, 4>,
    pub residual: AttentionResidual,
    /// `[B, H_q, T, D]`, before the output projection.
    pub attn_out: Tensor<f32, 4>,
    pub x_mid: Tensor<f32, 3>,
    pub h2: Tensor<f32, 3>,
    /// `h2 · w1`, before the activation.
    pub pre: Tensor<f32, 3>,
    pub act: Tensor<f32, 3>,
}

/// Everything a training forward pass recorded, consumed by [`crate::model::backward`].
#[derive(Debug, Clone)]
pub struct Tape {
    pub(crate) tokens: Tensor<i32, 2>,
    pub(crate) segment_ids: Tensor<i32, 2>,
    pub(crate) sin: Tensor<f32, 3>,
    pub(crate) cos: Tensor<f32, 3>,
    pub(crate) layers: Vec<LayerTape>,
    /// Residual stream after the last layer.
    pub(crate) final_x: Tensor<f32, 3>,
}

impl Tape {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

/// The attention path a forward call takes.
enum Attention<'a> {
    Cached {
        cache: &'a mut KvCache,
        mask: AttentionMask,
        valid: Vec<usize>,
    },
    Kernel(KernelMask<'a>),
    Reference(AttentionMask),
}

/// `x[B, T, D] · w[D, N]`.
pub(crate) fn matmul_last(x: &Tensor<f32, 3>, w: &Tensor<f32, 2>) -> Result<Tensor<f32, 3>> {
    let [b, t, d] = *x.shape();
    let [wd, n] = *w.shape();
    if wd != d {
        return Err(TensorError::ShapeMismatch {
            expected: vec![d, n],
            got: w.shape().to_vec(),
        }
        .into());
    }
    Ok(Tensor::new(dense(x.data(), w.data(), b * t, d, n)?, [b, t, n])?)
}

fn rounded<const RANK: usize>(mut x: Tensor<f32, RANK>, dtype: DType) -> Tensor<f32, RANK> {
    dtype.round_slice(x.data_mut());
    x
}

/// Non-padding tokens per row.
fn valid_counts(segment_ids: &Tensor<i32, 2>) -> Vec<usize> {
    let [b, t] = *segment_ids.shape();
    (0..b)
        .map(|row| {
            segment_ids.data()[row * t..(row + 1) * t]
                .iter()
                .filter(|&&s| s != 0)
                .count()
        })
        .collect()
}

/// Logits `[B, T, vocab]` for `tokens [B, T]`.
///
/// Segment id 0 marks padding. With a cache, each row's new keys and values are written at its
/// current length, queries attend to everything the row has cached so far, and the lengths
/// advance by the number of non-padding tokens per row. Padding must be on the right.
///
/// # Errors
///
/// `Error::KernelWithCache` if `cfg.use_attn_kernel` is set and a cache is passed;
/// `Error::SequenceOverflow` if a row would grow past `max_seq_len`. Both are raised before the
/// cache is touched.
pub fn forward(
    tokens: &Tensor<i32, 2>,
    segment_ids: &Tensor<i32, 2>,
    weights: &Weights<ShardedTensor>,
    cfg: &Config,
    cache: Option<&mut KvCache>,
) -> Result<Tensor<f32, 3>> {
    run(tokens, segment_ids, weights, cfg, cache, false).map(|(logits, _)| logits)
}

/// [`forward`] without a cache, also returning the activations the backward pass needs.
pub fn forward_with_tape(
    tokens: &Tensor<i32, 2>,
    segment_ids: &Tensor<i32, 2>,
    weights: &Weights<ShardedTensor>,
    cfg: &Config,
) -> Result<(Tensor<f32, 3>, Tape)> {
    run(tokens, segment_ids, weights, cfg, None, true)
}

fn run(
    tokens: &Tensor<i32, 2>,
    segment_ids: &Tensor<i32, 2>,
    weights: &Weights<ShardedTensor>,
    cfg: &Config,
    cache: Option<&mut KvCache>,
    record: bool,
) -> Result<(Tensor<f32, 3>, Tape)> {
    let [b, t] = *tokens.shape();
    if segment_ids.shape() != tokens.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: vec![b, t],
            got: segment_ids.shape().to_vec(),
        }
        .into());
    }
    if cfg.use_attn_kernel && cache.is_some() {
        return Err(Error::KernelWithCache);
    }
    if weights.layers.len() != cfg.num_layers {
        return Err(Error::Config(format!(
            "weights have {} layers, config expects {}",
            weights.layers.len(),
            cfg.num_layers
        )));
    }
    if t > cfg.max_seq_len {
        return Err(Error::SequenceOverflow {
            row: 0,
            end: t,
            max: cfg.max_seq_len,
        });
    }

    let valid = valid_counts(segment_ids);
    let (starts, mut attention) = match cache {
        Some(cache) => {
            if cache.batch_size() != b || cache.num_layers() != cfg.num_layers {
                return Err(Error::Config(format!(
                    "cache holds {} rows and {} layers, input has {b} rows",
                    cache.batch_size(),
                    cache.num_layers()
                )));
            }
            cache.check_capacity(&valid, t)?;
            let starts = cache.positions(&valid);
            let q_seg = segment_ids.map(|s| i32::from(s != 0));
            let mask = AttentionMask::new(&q_seg, &cache.key_segments(&valid)?, &starts, cfg.causal)?;
            (
                starts,
                Attention::Cached {
                    cache,
                    mask,
                    valid: valid.clone(),
                },
            )
        }
        None if cfg.use_attn_kernel => (
            vec![0; b],
            Attention::Kernel(KernelMask {
                q_segment_ids: segment_ids,
                kv_segment_ids: segment_ids,
                causal: cfg.causal,
            }),
        ),
        None => (
            vec![0; b],
            Attention::Reference(AttentionMask::new(
                segment_ids,
                segment_ids,
                &vec![0; b],
                cfg.causal,
            )?),
        ),
    };

    let (sin, cos) = RopeTables::generate(cfg.key_dim, cfg.max_seq_len)?.slices_at(&starts, t)?;
    let dtype = cfg.activation_dtype;
    let mut x = embed(tokens, &weights.gather_embedding()?)?;
    let mut tapes = Vec::with_capacity(if record { weights.layers.len() } else { 0 });

    for (i, layer) in weights.layers.iter().enumerate() {
        let w = layer.gather()?;

        let h1 = rms_norm(&x, &w.gamma1)?;
        let q = rounded(project_heads(&h1, &w.q)?, dtype);
        let k = rounded(project_heads(&h1, &w.k)?, dtype);
        let v = rounded(project_heads(&h1, &w.v)?, dtype);
        let q = rounded(rope::apply(&q, &sin, &cos)?, dtype);
        let k = rounded(rope::apply(&k, &sin, &cos)?, dtype);

        let (attn_out, residual) = match &mut attention {
            Attention::Cached { cache, mask, valid } => {
                let (k_all, v_all) = cache.update_layer(i, &k, &v, valid)?;
                let (out, probs) = reference::attention(&q, &k_all, &v_all, mask, dtype)?;
                (out, AttentionResidual::Probs(probs))
            }
            Attention::Kernel(mask) => {
                let (out, lse) = sharded_attention(&q, &k, &v, *mask, cfg)?;
                (out, AttentionResidual::LogSumExp(lse))
            }
            Attention::Reference(mask) => {
                let (out, probs) = reference::attention(&q, &k, &v, mask, dtype)?;
                (out, AttentionResidual::Probs(probs))
            }
        };

        let x_mid = (&x + &merge_heads(&attn_out, &w.proj)?)?;
        let h2 = rms_norm(&x_mid, &w.gamma2)?;
        let pre = matmul_last(&h2, &w.w1)?;
        let act = Activation::gelu(&pre);
        let x_out = (&x_mid + &matmul_last(&act, &w.w2)?)?;
        trace!(layer = i, "layer done");

        let x_in = std::mem::replace(&mut x, x_out);
        if record {
            tapes.push(LayerTape {
                x_in,
                h1,
                q,
                k,
                v,
                residual,
                attn_out,
                x_mid,
                h2,
                pre,
                act,
            });
        }
    }

    let logits = matmul_last(&x, &weights.gather_vocab_proj()?)?;

    if let Attention::Cached { cache, valid, .. } = attention {
        cache.advance(&valid);
    }

    Ok((
        logits,
        Tape {
            tokens: tokens.clone(),
            segment_ids: segment_ids.clone(),
            sin,
            cos,
            layers: tapes,
            final_x: x,
        },
    ))
}
