//! Dense contractions over flattened rows.
//!
//! Each projection in the model is a matrix product once its leading axes are flattened:
//! `btd,dhq->bhtq` is `[B*T, D] x [D, H*Q]` followed by a head transpose, and
//! `bhtq,hqd->btd` is `[B*T, H*Q] x [H*Q, D]` after the inverse transpose. The backward passes are
//! the same products with one operand read transposed.

use crate::tensor::{Result, Tensor};
use crate::tensor::TensorError;
use minformer_kernels::{sgemm, KernelError, Transpose};

fn kernel_err(err: KernelError) -> TensorError {
    match err {
        KernelError::ShapeMismatch { expected, got } => TensorError::ShapeMismatch { expected, got },
    }
}

/// `x[rows, in] · w[in, out]`.
pub fn dense(x: &[f32], w: &[f32], rows: usize, in_dim: usize, out_dim: usize) -> Result<Vec<f32>> {
    let mut out = vec![0.0; rows * out_dim];
    sgemm(Transpose::No, Transpose::No, rows, out_dim, in_dim, 1.0, x, w, 0.0, &mut out)
        .map_err(kernel_err)?;
    Ok(out)
}

/// Input gradient of [`dense`]: `dy[rows, out] · w^T`.
pub fn dense_backward_input(
    dy: &[f32],
    w: &[f32],
    rows: usize,
    in_dim: usize,
    out_dim: usize,
) -> Result<Vec<f32>> {
    let mut dx = vec![0.0; rows * in_dim];
    sgemm(Transpose::No, Transpose::Yes, rows, in_dim, out_dim, 1.0, dy, w, 0.0, &mut dx)
        .map_err(kernel_err)?;
    Ok(dx)
}

/// Weight gradient of [`dense`]: `x^T · dy`.
pub fn dense_backward_weight(
    x: &[f32],
    dy: &[f32],
    rows: usize,
    in_dim: usize,
    out_dim: usize,
) -> Result<Vec<f32>> {
    let mut dw = vec![0.0; in_dim * out_dim];
    sgemm(Transpose::Yes, Transpose::No, in_dim, out_dim, rows, 1.0, x, dy, 0.0, &mut dw)
        .map_err(kernel_err)?;
    Ok(dw)
}

/// `btd,dhq->bhtq`: projects the residual stream into per-head vectors.
pub fn project_heads(x: &Tensor<f32, 3>, w: &Tensor<f32, 3>) -> Result<Tensor<f32, 4>> {
    let [b, t, d] = *x.shape();
    let [_, h, q] = *w.shape();
    let out = dense(x.data(), w.data(), b * t, d, h * q)?;
    Tensor::new(out, [b, t, h, q])?.transpose_axes(1, 2)
}

/// Gradients of [`project_heads`]: `(dx [B,T,D], dw [D,H,Q])`.
pub fn project_heads_backward(
    x: &Tensor<f32, 3>,
    w: &Tensor<f32, 3>,
    dy: &Tensor<f32, 4>,
) -> Result<(Tensor<f32, 3>, Tensor<f32, 3>)> {
    let [b, t, d] = *x.shape();
    let [_, h, q] = *w.shape();
    let dy = dy.transpose_axes(1, 2)?;
    let dx = dense_backward_input(dy.data(), w.data(), b * t, d, h * q)?;
    let dw = dense_backward_weight(x.data(), dy.data(), b * t, d, h * q)?;
    Ok((Tensor::new(dx, [b, t, d])?, Tensor::new(dw, [d, h, q])?))
}

/// `bhtq,hqd->btd`: merges per-head vectors back into the residual stream.
pub fn merge_heads(x: &Tensor<f32, 4>, w: &Tensor<f32, 3>) -> Result<Tensor<f32, 3>> {
    let [b, h, t, q] = *x.shape();
    let d = w.shape()[2];
    let x = x.transpose_axes(1, 2)?;
    let out = dense(x.data(), w.data(), b * t, h * q, d)?;
    Tensor::new(out, [b, t, d])
}

/// Gradients of [`merge_heads`]: `(dx [B,H,T,Q], dw [H,Q,D])`.
pub fn merge_heads_backward(
    x: &Tensor<f32, 4>,
    w: &Tensor<f32, 3>,
    dy: &Tensor<f32, 3>,
) -> Result<(Tensor<f32, 4>, Tensor<f32, 3>)> {
    let [b, h, t, q] = *x.shape();
    let d = w.shape()[2];
    let x = x.transpose_axes(1, 2)?;
    let dx = dense_backward_input(dy.data(), w.data(), b * t, h * q, d)?;
    let dw = dense_backward_weight(x.data(), dy.data(), b * t, h * q, d)?;
    let dx = Tensor::new(dx, [b, t, h, q])?.transpose_axes(1, 2)?;
    Ok((dx, Tensor::new(dw, [h, q, d])?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_heads_layout() {
        // b=1, t=2, d=1, h=2, q=1: every output is token * weight.
        let x = Tensor::<f32, 3>::new(vec![1.0, 2.0], [1, 2, 1]).unwrap();
        let w = Tensor::<f32, 3>::new(vec![10.0, 100.0], [1, 2, 1]).unwrap();
        let y = project_heads(&x, &w).unwrap();
        assert_eq!(y.shape(), &[1, 2, 2, 1]);
        // [b, h, t, q]
        assert_eq!(y.data(), &[10.0, 20.0, 100.0, 200.0]);
    }

    #[test]
    fn test_merge_inverts_layout() {
        let x = Tensor::<f32, 4>::new(vec![10.0, 20.0, 100.0, 200.0], [1, 2, 2, 1]).unwrap();
        let w = Tensor::<f32, 3>::new(vec![1.0, 1.0], [2, 1, 1]).unwrap();
        let y = merge_heads(&x, &w).unwrap();
        assert_eq!(y.data(), &[110.0, 220.0]);
    }

    #[test]
    fn test_dense_backward() {
        // x [1,2], w [2,1]
        let x = [1.0, 2.0];
        let w = [3.0, 4.0];
        let dy = [1.0];
        assert_eq!(dense(&x, &w, 1, 2, 1).unwrap(), vec![11.0]);
        assert_eq!(dense_backward_input(&dy, &w, 1, 2, 1).unwrap(), vec![3.0, 4.0]);
        assert_eq!(dense_backward_weight(&x, &dy, 1, 2, 1).unwrap(), vec![1.0, 2.0]);
    }
}
