use crate::tensor::{Result, Tensor, TensorError};
use rayon::prelude::*;

/// Added to the mean square before the reciprocal square root.
pub const RMS_EPS: f32 = 1e-6;

fn check_gamma(d: usize, gamma: &Tensor<f32, 1>) -> Result<()> {
    if gamma.shape()[0] != d {
        return Err(TensorError::ShapeMismatch {
            expected: vec![d],
            got: gamma.shape().to_vec(),
        });
    }
    Ok(())
}

#[inline]
fn inv_rms(row: &[f32]) -> f32 {
    let mean_sq = row.iter().map(|v| v * v).sum::<f32>() / row.len() as f32;
    1.0 / (mean_sq + RMS_EPS).sqrt()
}

/// RMS normalization over the last axis: `gamma * x / sqrt(mean(x^2) + eps)`.
///
/// There is no mean subtraction and no bias, as in Gemma and Llama.
pub fn rms_norm(x: &Tensor<f32, 3>, gamma: &Tensor<f32, 1>) -> Result<Tensor<f32, 3>> {
    let d = x.shape()[2];
    check_gamma(d, gamma)?;
    let mut out = Tensor::zeros(*x.shape());
    if d == 0 {
        return Ok(out);
    }
    let g = gamma.data();

    out.data_mut()
        .par_chunks_mut(d)
        .zip(x.data().par_chunks(d))
        .for_each(|(out_row, in_row)| {
            let r = inv_rms(in_row);
            for i in 0..d {
                out_row[i] = in_row[i] * r * g[i];
            }
        });

    Ok(out)
}

/// Gradients of [`rms_norm`] with respect to its input and its scale.
///
/// With `r = 1/sqrt(mean(x^2) + eps)` and `a = gamma * dy`:
/// `dx = r * a - r^3 * x * sum(a * x) / D` and `dgamma = sum_rows(dy * x * r)`.
pub fn rms_norm_backward(
    x: &Tensor<f32, 3>,
    gamma: &Tensor<f32, 1>,
    dy: &Tensor<f32, 3>,
) -> Result<(Tensor<f32, 3>, Tensor<f32, 1>)> {
    let d = x.shape()[2];
    check_gamma(d, gamma)?;
    if dy.shape() != x.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: x.shape().to_vec(),
            got: dy.shape().to_vec(),
        });
    }
    let mut dx = Tensor::zeros(*x.shape());
    if d == 0 {
        return Ok((dx, Tensor::zeros([0])));
    }
    let g = gamma.data();

    let dgamma = dx
        .data_mut()
        .par_chunks_mut(d)
        .zip(x.data().par_chunks(d))
        .zip(dy.data().par_chunks(d))
        .map(|((dx_row, x_row), dy_row)| {
            let r = inv_rms(x_row);
            let mut ax = 0.0;
            for i in 0..d {
                ax += g[i] * dy_row[i] * x_row[i];
            }
            let coef = r * r * r * ax / d as f32;
            let mut dg = vec![0.0; d];
            for i in 0..d {
                dx_row[i] = r * g[i] * dy_row[i] - coef * x_row[i];
                dg[i] = dy_row[i] * x_row[i] * r;
            }
            dg
        })
        .reduce(
            || vec![0.0; d],
            |mut acc, row| {
                acc.iter_mut().zip(row).for_each(|(a, b)| *a += b);
                acc
            },
        );

    Ok((dx, Tensor::new(dgamma, [d])?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_norm_unit_scale() {
        let x = Tensor::<f32, 3>::new(vec![3.0, 4.0], [1, 1, 2]).unwrap();
        let gamma = Tensor::ones([2]);
        let y = rms_norm(&x, &gamma).unwrap();
        // mean(x^2) = 12.5
        let r = 1.0 / (12.5f32 + RMS_EPS).sqrt();
        assert!((y.data()[0] - 3.0 * r).abs() < 1e-6);
        assert!((y.data()[1] - 4.0 * r).abs() < 1e-6);
    }

    #[test]
    fn test_rms_norm_gamma_mismatch() {
        let x = Tensor::<f32, 3>::zeros([1, 1, 4]);
        assert!(rms_norm(&x, &Tensor::ones([3])).is_err());
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let x = Tensor::<f32, 3>::new(vec![0.5, -1.0, 2.0, 0.25, 1.5, -0.75], [1, 2, 3]).unwrap();
        let gamma = Tensor::<f32, 1>::new(vec![1.0, 0.5, -2.0], [3]).unwrap();
        let dy = Tensor::<f32, 3>::new(vec![1.0, -0.5, 0.3, 0.2, 0.7, -1.1], [1, 2, 3]).unwrap();
        let (dx, dgamma) = rms_norm_backward(&x, &gamma, &dy).unwrap();

        let objective = |x: &Tensor<f32, 3>, gamma: &Tensor<f32, 1>| -> f64 {
            let y = rms_norm(x, gamma).unwrap();
            y.data()
                .iter()
                .zip(dy.data())
                .map(|(a, b)| (*a as f64) * (*b as f64))
                .sum()
        };

        let eps = 1e-3;
        for i in 0..x.size() {
            let mut plus = x.clone();
            plus.data_mut()[i] += eps;
            let mut minus = x.clone();
            minus.data_mut()[i] -= eps;
            let numeric = (objective(&plus, &gamma) - objective(&minus, &gamma)) / (2.0 * eps as f64);
            assert!((numeric as f32 - dx.data()[i]).abs() < 1e-2, "dx[{i}]");
        }
        for i in 0..gamma.size() {
            let mut plus = gamma.clone();
            plus.data_mut()[i] += eps;
            let mut minus = gamma.clone();
            minus.data_mut()[i] -= eps;
            let numeric = (objective(&x, &plus) - objective(&x, &minus)) / (2.0 * eps as f64);
            assert!((numeric as f32 - dgamma.data()[i]).abs() < 1e-2, "dgamma[{i}]");
        }
    }
}
