use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorError};
use rayon::prelude::*;

/// Masked next-token cross-entropy and everything the training step reports about it.
#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Mean negative log-likelihood over valid positions.
    pub loss: f32,
    /// Fraction of valid positions whose arg-max logit is the target.
    pub accuracy: f32,
    /// `[B, T]` negative log-likelihood, zero at padding.
    pub per_token_loss: Tensor<f32, 2>,
    /// `[B, T, V]` gradient of `loss` with respect to the logits.
    pub dlogits: Tensor<f32, 3>,
}

/// Cross-entropy of `logits [B, T, V]` against `targets [B, T]`.
///
/// Log-softmax runs in f32. Positions whose segment id is 0 are padding: they carry no loss, no
/// accuracy and no gradient, and the averages count only the remaining positions.
///
/// # Errors
///
/// `Error::NoValidTokens` if every position is padding; `Error::TokenOutOfRange` for a target at a
/// valid position outside the vocabulary.
pub fn cross_entropy_loss(
    logits: &Tensor<f32, 3>,
    targets: &Tensor<i32, 2>,
    segment_ids: &Tensor<i32, 2>,
) -> Result<LossOutput> {
    let [b, t, vocab] = *logits.shape();
    if targets.shape() != &[b, t] || segment_ids.shape() != &[b, t] {
        return Err(TensorError::ShapeMismatch {
            expected: vec![b, t],
            got: targets.shape().to_vec(),
        }
        .into());
    }

    let valid = segment_ids.data().iter().filter(|&&s| s != 0).count();
    if valid == 0 {
        return Err(Error::NoValidTokens);
    }
    let targets = targets
        .data()
        .iter()
        .zip(segment_ids.data())
        .map(|(&y, &s)| match s {
            0 => Ok(None),
            _ => usize::try_from(y)
                .ok()
                .filter(|&y| y < vocab)
                .map(Some)
                .ok_or(Error::TokenOutOfRange { token: y, vocab }),
        })
        .collect::<Result<Vec<_>>>()?;

    let inv_count = 1.0 / valid as f32;
    let mut dlogits = Tensor::zeros([b, t, vocab]);
    let mut per_token = Tensor::zeros([b, t]);
    if vocab == 0 {
        return Err(Error::Config("vocabulary is empty".to_string()));
    }

    let correct: usize = dlogits
        .data_mut()
        .par_chunks_mut(vocab)
        .zip(per_token.data_mut().par_iter_mut())
        .zip(logits.data().par_chunks(vocab))
        .zip(targets.par_iter())
        .map(|(((grad, nll), row), target)| {
            let Some(y) = *target else { return 0 };
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let sum: f32 = row.iter().map(|x| (x - max).exp()).sum();
            let log_z = max + sum.ln();
            *nll = log_z - row[y];

            for (g, x) in grad.iter_mut().zip(row) {
                *g = (x - log_z).exp() * inv_count;
            }
            grad[y] -= inv_count;

            let mut best = 0;
            for (i, x) in row.iter().enumerate() {
                if *x > row[best] {
                    best = i;
                }
            }
            usize::from(best == y)
        })
        .sum();

    let loss = per_token.data().iter().map(|&x| x as f64).sum::<f64>() as f32 * inv_count;
    Ok(LossOutput {
        loss,
        accuracy: correct as f32 * inv_count,
        per_token_loss: per_token,
        dlogits,
    })
}
