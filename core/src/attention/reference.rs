use super::{check_heads, scale, AttentionMask, MASK_VALUE};
use crate::error::Result;
use crate::precision::DType;
use crate::tensor::{Tensor, TensorError};
use minformer_kernels::{sgemm, Transpose};
use rayon::prelude::*;

/// Masked softmax attention with the full score matrix in memory.
///
/// `q` is `[B, H_q, T, D]`; `k` and `v` are `[B, H_kv, S, D]`. Returns the output, rounded to
/// `dtype`, and the `[B, H_q, T, S]` probabilities.
pub fn attention(
    q: &Tensor<f32, 4>,
    k: &Tensor<f32, 4>,
    v: &Tensor<f32, 4>,
    mask: &AttentionMask,
    dtype: DType,
) -> Result<(Tensor<f32, 4>, Tensor<f32, 4>)> {
    let n_rep = check_heads(q, k, v)?;
    let [b, h_q, t, d] = *q.shape();
    let [_, h_kv, s, _] = *k.shape();
    if mask.shape() != [b, t, s] {
        return Err(TensorError::ShapeMismatch {
            expected: vec![b, t, s],
            got: mask.shape().to_vec(),
        }
        .into());
    }
    let scale = scale(d);

    let mut out = Tensor::zeros([b, h_q, t, d]);
    let mut probs = Tensor::zeros([b, h_q, t, s]);
    if t == 0 || d == 0 || s == 0 {
        return Ok((out, probs));
    }

    out.data_mut()
        .par_chunks_mut(t * d)
        .zip(probs.data_mut().par_chunks_mut(t * s))
        .enumerate()
        .try_for_each(|(bh, (out_head, p))| -> Result<()> {
            let (batch, head) = (bh / h_q, bh % h_q);
            let kv = (batch * h_kv + head / n_rep) * s * d;
            let q_head = &q.data()[bh * t * d..(bh + 1) * t * d];
            let k_head = &k.data()[kv..kv + s * d];
            let v_head = &v.data()[kv..kv + s * d];

            // scores = q k^T * scale
            sgemm(Transpose::No, Transpose::Yes, t, s, d, scale, q_head, k_head, 0.0, p)?;

            for (row, allowed) in p.chunks_mut(s).zip(mask.row(batch).chunks(s)) {
                for (logit, &ok) in row.iter_mut().zip(allowed) {
                    if !ok {
                        *logit = MASK_VALUE;
                    }
                }
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0;
                for x in row.iter_mut() {
                    *x = (*x - max).exp();
                    sum += *x;
                }
                let inv = 1.0 / sum;
                row.iter_mut().for_each(|x| *x *= inv);
            }

            sgemm(Transpose::No, Transpose::No, t, d, s, 1.0, p, v_head, 0.0, out_head)?;
            dtype.round_slice(out_head);
            Ok(())
        })?;

    Ok((out, probs))
}

/// Gradients of [`attention`] with respect to `q`, `k` and `v`.
///
/// With `P` the saved probabilities: `dV = P^T dO`, `dP = dO V^T`,
/// `dS = P * (dP - rowsum(dP * P))`, `dQ = dS K * scale` and `dK = dS^T Q * scale`. Key/value
/// gradients sum over the query heads of their group.
pub fn attention_backward(
    q: &Tensor<f32, 4>,
    k: &Tensor<f32, 4>,
    v: &Tensor<f32, 4>,
    probs: &Tensor<f32, 4>,
    d_out: &Tensor<f32, 4>,
) -> Result<(Tensor<f32, 4>, Tensor<f32, 4>, Tensor<f32, 4>)> {
    let n_rep = check_heads(q, k, v)?;
    let [b, h_q, t, d] = *q.shape();
    let [_, h_kv, s, _] = *k.shape();
    if probs.shape() != &[b, h_q, t, s] || d_out.shape() != q.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: vec![b, h_q, t, s],
            got: probs.shape().to_vec(),
        }
        .into());
    }
    let scale = scale(d);

    let mut dq = Tensor::zeros([b, h_q, t, d]);
    let mut dk = Tensor::zeros([b, h_kv, s, d]);
    let mut dv = Tensor::zeros([b, h_kv, s, d]);
    if t == 0 || d == 0 || s == 0 {
        return Ok((dq, dk, dv));
    }

    // One task per key/value head; it owns the query heads of its group.
    dq.data_mut()
        .par_chunks_mut(n_rep * t * d)
        .zip(dk.data_mut().par_chunks_mut(s * d))
        .zip(dv.data_mut().par_chunks_mut(s * d))
        .enumerate()
        .try_for_each(|(group, ((dq_group, dk_head), dv_head))| -> Result<()> {
            let kv = group * s * d;
            let k_head = &k.data()[kv..kv + s * d];
            let v_head = &v.data()[kv..kv + s * d];
            let mut dp = vec![0.0; t * s];

            for r in 0..n_rep {
                let bh = group * n_rep + r;
                let p = &probs.data()[bh * t * s..(bh + 1) * t * s];
                let q_head = &q.data()[bh * t * d..(bh + 1) * t * d];
                let do_head = &d_out.data()[bh * t * d..(bh + 1) * t * d];
                let dq_head = &mut dq_group[r * t * d..(r + 1) * t * d];

                // dV += P^T dO
                sgemm(Transpose::Yes, Transpose::No, s, d, t, 1.0, p, do_head, 1.0, dv_head)?;
                // dP = dO V^T
                sgemm(Transpose::No, Transpose::Yes, t, s, d, 1.0, do_head, v_head, 0.0, &mut dp)?;
                for (dp_row, p_row) in dp.chunks_mut(s).zip(p.chunks(s)) {
                    let dot: f32 = dp_row.iter().zip(p_row).map(|(a, b)| a * b).sum();
                    for (x, &pv) in dp_row.iter_mut().zip(p_row) {
                        *x = pv * (*x - dot);
                    }
                }
                // dQ = dS K * scale, dK += dS^T Q * scale
                sgemm(Transpose::No, Transpose::No, t, d, s, scale, &dp, k_head, 0.0, dq_head)?;
                sgemm(Transpose::Yes, Transpose::No, s, d, t, scale, &dp, q_head, 1.0, dk_head)?;
            }
            Ok(())
        })?;

    Ok((dq, dk, dv))
}
