use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorError};
use rayon::prelude::*;

fn check_token(token: i32, vocab: usize) -> Result<usize> {
    usize::try_from(token)
        .ok()
        .filter(|&t| t < vocab)
        .ok_or(Error::TokenOutOfRange { token, vocab })
}

/// Row lookup: `[B, T]` token ids into a `[vocab, D]` table gives `[B, T, D]`.
///
/// Every id is checked before anything is copied.
pub fn embed(tokens: &Tensor<i32, 2>, table: &Tensor<f32, 2>) -> Result<Tensor<f32, 3>> {
    let [batch, seq] = *tokens.shape();
    let [vocab, d] = *table.shape();
    let ids = tokens
        .data()
        .iter()
        .map(|&t| check_token(t, vocab))
        .collect::<Result<Vec<_>>>()?;

    let mut out = Tensor::zeros([batch, seq, d]);
    if d == 0 {
        return Ok(out);
    }
    let weight = table.data();
    out.data_mut()
        .par_chunks_mut(d)
        .zip(ids.par_iter())
        .for_each(|(row, &id)| row.copy_from_slice(&weight[id * d..(id + 1) * d]));
    Ok(out)
}

/// Gradient of [`embed`] with respect to the table: rows of `dx` scatter-added by token id.
pub fn embed_backward(
    tokens: &Tensor<i32, 2>,
    dx: &Tensor<f32, 3>,
    vocab: usize,
) -> Result<Tensor<f32, 2>> {
    let [batch, seq] = *tokens.shape();
    let d = dx.shape()[2];
    if dx.shape()[..2] != [batch, seq] {
        return Err(TensorError::ShapeMismatch {
            expected: vec![batch, seq, d],
            got: dx.shape().to_vec(),
        }
        .into());
    }
    let mut grad = Tensor::zeros([vocab, d]);
    if d == 0 {
        return Ok(grad);
    }
    let g = grad.data_mut();
    for (&token, row) in tokens.data().iter().zip(dx.data().chunks(d)) {
        let id = check_token(token, vocab)?;
        g[id * d..(id + 1) * d]
            .iter_mut()
            .zip(row)
            .for_each(|(a, b)| *a += b);
    }
    Ok(grad)
}
