use crate::tensor::{Result, Tensor, TensorError};
use rayon::prelude::*;

/// Longest timescale of the geometric progression.
pub const MAX_TIMESCALE: f64 = 10_000.0;

/// Rotary Positional Embedding (RoPE) tables.
///
/// RoPE encodes position by rotating pairs of features of every query and key:
///
/// $$ \begin{pmatrix} x_1' \\ x_2' \end{pmatrix} = \begin{pmatrix} \cos \theta & -\sin \theta \\ \sin \theta & \cos \theta \end{pmatrix} \begin{pmatrix} x_1 \\ x_2 \end{pmatrix} $$
///
/// The pairs are the two halves of the feature axis, `(x[j], x[j + D/2])`. Pair `j` at position
/// `p` is rotated by `p / 10000^(2j/D)`.
#[derive(Debug, Clone)]
pub struct RopeTables {
    /// `[max_length, D/2]`
    pub sin: Tensor<f32, 2>,
    /// `[max_length, D/2]`
    pub cos: Tensor<f32, 2>,
}

impl RopeTables {
    /// Builds sin/cos tables for `max_length` positions.
    ///
    /// Angles are computed in f64: at positions in the thousands an f32 angle is already off by
    /// enough to shift the phase visibly.
    pub fn generate(feature_dim: usize, max_length: usize) -> Result<Self> {
        if feature_dim % 2 != 0 {
            return Err(TensorError::ShapeMismatch {
                expected: vec![feature_dim + 1],
                got: vec![feature_dim],
            });
        }
        let half = feature_dim / 2;
        let timescales: Vec<f64> = (0..half)
            .map(|j| MAX_TIMESCALE.powf(2.0 * j as f64 / feature_dim as f64))
            .collect();

        let angle = |i: usize| (i / half) as f64 / timescales[i % half];
        let sin = Tensor::from_fn([max_length, half], |i| angle(i).sin() as f32);
        let cos = Tensor::from_fn([max_length, half], |i| angle(i).cos() as f32);
        Ok(Self { sin, cos })
    }

    pub fn max_length(&self) -> usize {
        self.sin.shape()[0]
    }

    /// Per-row windows of `len` positions starting at `starts[b]`: `(sin, cos)`, each
    /// `[B, len, D/2]`.
    ///
    /// # Errors
    ///
    /// A window that runs past the table is an `IndexOutOfBounds` error, never clamped.
    pub fn slices_at(&self, starts: &[usize], len: usize) -> Result<(Tensor<f32, 3>, Tensor<f32, 3>)> {
        let [max_length, half] = *self.sin.shape();
        for &start in starts {
            if start + len > max_length {
                return Err(TensorError::IndexOutOfBounds {
                    index: vec![start + len],
                    shape: vec![max_length, half],
                });
            }
        }
        let window = |table: &Tensor<f32, 2>| {
            let mut out = Vec::with_capacity(starts.len() * len * half);
            for &start in starts {
                out.extend_from_slice(&table.data()[start * half..(start + len) * half]);
            }
            Tensor::new(out, [starts.len(), len, half])
        };
        Ok((window(&self.sin)?, window(&self.cos)?))
    }
}

fn rotate(x: &Tensor<f32, 4>, sin: &Tensor<f32, 3>, cos: &Tensor<f32, 3>, sign: f32) -> Result<Tensor<f32, 4>> {
    let [b, h, t, d] = *x.shape();
    let half = d / 2;
    if sin.shape() != &[b, t, half] || cos.shape() != sin.shape() || d % 2 != 0 {
        return Err(TensorError::ShapeMismatch {
            expected: vec![b, t, half],
            got: sin.shape().to_vec(),
        });
    }
    let mut out = Tensor::zeros([b, h, t, d]);
    if t * d == 0 {
        return Ok(out);
    }

    out.data_mut()
        .par_chunks_mut(t * d)
        .zip(x.data().par_chunks(t * d))
        .enumerate()
        .for_each(|(bh, (out_head, in_head))| {
            let batch = bh / h;
            for pos in 0..t {
                let table = (batch * t + pos) * half;
                let row = pos * d;
                for j in 0..half {
                    let s = sign * sin.data()[table + j];
                    let c = cos.data()[table + j];
                    let x1 = in_head[row + j];
                    let x2 = in_head[row + half + j];
                    out_head[row + j] = x1 * c - x2 * s;
                    out_head[row + half + j] = x2 * c + x1 * s;
                }
            }
        });
    Ok(out)
}

/// Rotates `x [B, H, T, D]` by the per-row tables `sin`, `cos` (`[B, T, D/2]`).
pub fn apply(x: &Tensor<f32, 4>, sin: &Tensor<f32, 3>, cos: &Tensor<f32, 3>) -> Result<Tensor<f32, 4>> {
    rotate(x, sin, cos, 1.0)
}

/// The transpose of [`apply`]: rotates by the negated angle.
///
/// The rotation is orthogonal, so this is both its inverse and its backward pass.
pub fn apply_inverse(
    x: &Tensor<f32, 4>,
    sin: &Tensor<f32, 3>,
    cos: &Tensor<f32, 3>,
) -> Result<Tensor<f32, 4>> {
    rotate(x, sin, cos, -1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables() {
        let tables = RopeTables::generate(4, 8).unwrap();
        assert_eq!(tables.sin.shape(), &[8, 2]);
        // Position 0 is the identity rotation.
        assert_eq!(tables.cos.get([0, 1]).unwrap(), 1.0);
        assert_eq!(tables.sin.get([0, 0]).unwrap(), 0.0);
        // Pair 0 has timescale 1; pair 1 has timescale 10000^(2/4) = 100.
        assert!((tables.sin.get([3, 0]).unwrap() - 3.0f32.sin()).abs() < 1e-6);
        assert!((tables.sin.get([3, 1]).unwrap() - 0.03f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_odd_dim_rejected() {
        assert!(RopeTables::generate(3, 8).is_err());
    }

    #[test]
    fn test_slices_past_end_rejected() {
        let tables = RopeTables::generate(4, 8).unwrap();
        assert!(tables.slices_at(&[0, 6], 2).is_ok());
        assert!(matches!(
            tables.slices_at(&[0, 7], 2),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_round_trip() {
        let tables = RopeTables::generate(8, 32).unwrap();
        let (sin, cos) = tables.slices_at(&[5, 17], 3).unwrap();
        let x = Tensor::<f32, 4>::from_fn([2, 2, 3, 8], |i| ((i * 7) % 11) as f32 - 5.0);
        let rotated = apply(&x, &sin, &cos).unwrap();
        assert!(rotated.max_abs_diff(&x).unwrap() > 1e-3);
        let back = apply_inverse(&rotated, &sin, &cos).unwrap();
        assert!(back.max_abs_diff(&x).unwrap() < 1e-4);
    }

    #[test]
    fn test_relative_position() {
        // Scores between a rotated query and key depend only on their distance.
        let tables = RopeTables::generate(4, 64).unwrap();
        let q = Tensor::<f32, 4>::new(vec![0.3, -1.2, 0.8, 0.5], [1, 1, 1, 4]).unwrap();
        let k = Tensor::<f32, 4>::new(vec![1.0, 0.4, -0.6, 0.9], [1, 1, 1, 4]).unwrap();
        let score = |qp: usize, kp: usize| {
            let (qs, qc) = tables.slices_at(&[qp], 1).unwrap();
            let (ks, kc) = tables.slices_at(&[kp], 1).unwrap();
            let qr = apply(&q, &qs, &qc).unwrap();
            let kr = apply(&k, &ks, &kc).unwrap();
            qr.data().iter().zip(kr.data()).map(|(a, b)| a * b).sum::<f32>()
        };
        assert!((score(10, 7) - score(40, 37)).abs() < 1e-4);
    }
}
