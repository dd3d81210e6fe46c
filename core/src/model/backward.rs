//! Reverse-mode gradients of [`crate::model::forward_with_tape`].
//!
//! Layers are visited last to first. Each one is gathered again, its gradients are computed in
//! full and then reduce-scattered onto the layout of its parameters. Dtype rounding is treated as
//! the identity.

use super::forward::{LayerTape, Tape};
use super::weights::{DenseLayer, Weights};
use crate::attention::flash::{sharded_attention_backward, KernelMask};
use crate::attention::{reference, AttentionResidual};
use crate::config::Config;
use crate::distributed::{Shardable, ShardedTensor};
use crate::error::{Error, Result};
use crate::nn::linear::{
    dense_backward_input, dense_backward_weight, merge_heads_backward, project_heads_backward,
};
use crate::nn::{embed_backward, rms_norm_backward, rope, Activation};
use crate::precision::DType;
use crate::tensor::{Tensor, TensorError};

/// Gradients of `x · w` for `x [B, T, K]`, `w [K, N]` and upstream `dy [B, T, N]`.
fn matmul_last_backward(
    x: &Tensor<f32, 3>,
    w: &Tensor<f32, 2>,
    dy: &Tensor<f32, 3>,
) -> Result<(Tensor<f32, 3>, Tensor<f32, 2>)> {
    let [b, t, k] = *x.shape();
    let n = w.shape()[1];
    let dx = dense_backward_input(dy.data(), w.data(), b * t, k, n)?;
    let dw = dense_backward_weight(x.data(), dy.data(), b * t, k, n)?;
    Ok((Tensor::new(dx, [b, t, k])?, Tensor::new(dw, [k, n])?))
}

/// One layer in reverse. Returns the gradient flowing into the layer's input and the full
/// parameter gradients.
fn layer_backward(
    w: &DenseLayer,
    lt: &LayerTape,
    tape: &Tape,
    dx: &Tensor<f32, 3>,
    cfg: &Config,
) -> Result<(Tensor<f32, 3>, DenseLayer)> {
    // Feed-forward sublayer.
    let (d_act, d_w2) = matmul_last_backward(&lt.act, &w.w2, dx)?;
    let d_pre = Activation::gelu_backward(&lt.pre, &d_act)?;
    let (d_h2, d_w1) = matmul_last_backward(&lt.h2, &w.w1, &d_pre)?;
    let (d_norm2, d_gamma2) = rms_norm_backward(&lt.x_mid, &w.gamma2, &d_h2)?;
    let d_mid = (dx + &d_norm2)?;

    // Attention sublayer.
    let (d_attn, d_proj) = merge_heads_backward(&lt.attn_out, &w.proj, &d_mid)?;
    let (dq, dk, dv) = match &lt.residual {
        AttentionResidual::Probs(probs) => {
            reference::attention_backward(&lt.q, &lt.k, &lt.v, probs, &d_attn)?
        }
        AttentionResidual::LogSumExp(lse) => {
            let mask = KernelMask {
                q_segment_ids: &tape.segment_ids,
                kv_segment_ids: &tape.segment_ids,
                causal: cfg.causal,
            };
            sharded_attention_backward(&lt.q, &lt.k, &lt.v, &lt.attn_out, lse, &d_attn, mask, cfg)?
        }
    };
    let dq = rope::apply_inverse(&dq, &tape.sin, &tape.cos)?;
    let dk = rope::apply_inverse(&dk, &tape.sin, &tape.cos)?;

    let (dh_q, d_q) = project_heads_backward(&lt.h1, &w.q, &dq)?;
    let (dh_k, d_k) = project_heads_backward(&lt.h1, &w.k, &dk)?;
    let (dh_v, d_v) = project_heads_backward(&lt.h1, &w.v, &dv)?;
    let d_h1 = (&(&dh_q + &dh_k)? + &dh_v)?;
    let (d_norm1, d_gamma1) = rms_norm_backward(&lt.x_in, &w.gamma1, &d_h1)?;
    let d_in = (&d_mid + &d_norm1)?;

    Ok((
        d_in,
        DenseLayer {
            q: d_q,
            k: d_k,
            v: d_v,
            proj: d_proj,
            w1: d_w1,
            w2: d_w2,
            gamma1: d_gamma1,
            gamma2: d_gamma2,
        },
    ))
}

/// Gradients of the loss with respect to every parameter, placed like `weights`.
///
/// `dlogits` is the loss gradient at the logits the tape was recorded for.
pub fn backward(
    tape: &Tape,
    dlogits: &Tensor<f32, 3>,
    weights: &Weights<ShardedTensor>,
    cfg: &Config,
) -> Result<Weights<ShardedTensor>> {
    if tape.layers.len() != weights.layers.len() {
        return Err(Error::Config(format!(
            "tape has {} layers, weights have {}",
            tape.layers.len(),
            weights.layers.len()
        )));
    }
    let [b, t, _] = *tape.final_x.shape();
    if dlogits.shape() != &[b, t, cfg.vocab_size] {
        return Err(TensorError::ShapeMismatch {
            expected: vec![b, t, cfg.vocab_size],
            got: dlogits.shape().to_vec(),
        }
        .into());
    }

    let (mut dx, d_vocab_proj) =
        matmul_last_backward(&tape.final_x, &weights.gather_vocab_proj()?, dlogits)?;

    let mut layers = Vec::with_capacity(weights.layers.len());
    for (layer, lt) in weights.layers.iter().zip(&tape.layers).rev() {
        let w = layer.gather()?;
        let (d_in, grads) = layer_backward(&w, lt, tape, &dx, cfg)?;
        layers.push(grads.scatter_like(layer)?);
        dx = d_in;
    }
    layers.reverse();

    let d_embedding = embed_backward(&tape.tokens, &dx, cfg.vocab_size)?;
    Ok(Weights {
        layers,
        embedding: weights
            .embedding
            .scatter_like(d_embedding.data(), DType::F32)?,
        vocab_proj: weights
            .vocab_proj
            .scatter_like(d_vocab_proj.data(), DType::F32)?,
    })
}
