//! Tensor operations.
//!
//! Element-wise arithmetic (`+`, `-`, `*`, `/` on references, shapes must match exactly),
//! element-wise maps and axis swaps. Element-wise work is spread over the rayon pool.
//!
//! ```rust
//! use minformer::tensor::Tensor;
//!
//! let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
//! let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();
//! let c = (&a + &b).unwrap();
//! assert_eq!(c.data(), &[4.0, 6.0]);
//! ```

use super::{compute_strides, Result, Tensor, TensorElem, TensorError};

use rayon::prelude::*;
use std::ops::{Add, Div, Mul, Sub};

/// Implements a binary arithmetic trait for `&Tensor` with an exact shape check.
macro_rules! impl_bin_op {
    ($trait:ident, $method:ident) => {
        impl<T, const RANK: usize> $trait for &Tensor<T, RANK>
        where
            T: TensorElem,
        {
            type Output = Result<Tensor<T, RANK>>;

            fn $method(self, rhs: Self) -> Self::Output {
                if self.shape != rhs.shape {
                    return Err(TensorError::ShapeMismatch {
                        expected: self.shape.to_vec(),
                        got: rhs.shape.to_vec(),
                    });
                }

                let mut out = Tensor::zeros(self.shape);
                out.data
                    .par_iter_mut()
                    .zip(self.data.par_iter())
                    .zip(rhs.data.par_iter())
                    .for_each(|((o, a), b)| {
                        *o = a.$method(*b);
                    });

                Ok(out)
            }
        }
    };
}

impl_bin_op!(Add, add);
impl_bin_op!(Sub, sub);
impl_bin_op!(Mul, mul);
impl_bin_op!(Div, div);

impl<T, const RANK: usize> Tensor<T, RANK>
where
    T: TensorElem,
{
    /// Applies `f` element-wise, returning a new tensor of the same shape.
    ///
    /// ```rust
    /// use minformer::tensor::Tensor;
    /// let t = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
    /// let squared = t.map(|x| x * x);
    /// assert_eq!(squared.data(), &[1.0, 4.0, 9.0]);
    /// ```
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let mut out = Tensor::zeros(self.shape);
        out.data
            .par_iter_mut()
            .zip(self.data.par_iter())
            .for_each(|(o, i)| *o = f(*i));
        out
    }

    /// Swaps two arbitrary axes, physically moving the data.
    ///
    /// The attention code uses this to move between `[B, T, H, D]` (the layout produced by the
    /// projections) and `[B, H, T, D]` (the layout attention and the cache work in).
    ///
    /// # Errors
    ///
    /// Returns `TensorError::IndexOutOfBounds` if `ax1` or `ax2` are out of bounds.
    pub fn transpose_axes(&self, ax1: usize, ax2: usize) -> Result<Self> {
        if ax1 >= RANK || ax2 >= RANK {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![ax1, ax2],
                shape: self.shape.to_vec(),
            });
        }
        if ax1 == ax2 {
            return Ok(self.clone());
        }

        let mut new_shape = self.shape;
        new_shape.swap(ax1, ax2);

        // Input stride for each output axis.
        let mut mapped_strides = self.strides;
        mapped_strides.swap(ax1, ax2);

        let mut out = Tensor::zeros(new_shape);
        let row_len = new_shape[RANK - 1];
        if row_len == 0 {
            return Ok(out);
        }
        let out_strides = compute_strides(&new_shape);
        let input = &self.data;

        out.data
            .par_chunks_mut(row_len)
            .enumerate()
            .for_each(|(row, chunk)| {
                // Decompose the row index over the leading output axes.
                let mut base = 0;
                let mut rem = row * row_len;
                for axis in 0..RANK - 1 {
                    let coord = rem / out_strides[axis];
                    rem %= out_strides[axis];
                    base += coord * mapped_strides[axis];
                }
                let step = mapped_strides[RANK - 1];
                for (i, o) in chunk.iter_mut().enumerate() {
                    *o = input[base + i * step];
                }
            });

        Ok(out)
    }

    /// Index of the maximum element along the last axis, one entry per leading row.
    ///
    /// Ties resolve to the lowest index.
    pub fn argmax_last(&self) -> Vec<usize> {
        let n = if RANK == 0 { 1 } else { self.shape[RANK - 1] };
        if n == 0 {
            return Vec::new();
        }
        self.data
            .par_chunks(n)
            .map(|row| {
                let mut best = 0;
                for (i, v) in row.iter().enumerate() {
                    if *v > row[best] {
                        best = i;
                    }
                }
                best
            })
            .collect()
    }
}

impl<const RANK: usize> Tensor<f32, RANK> {
    /// Largest absolute element-wise difference to `other`.
    pub fn max_abs_diff(&self, other: &Self) -> Result<f32> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.to_vec(),
                got: other.shape.to_vec(),
            });
        }
        Ok(self
            .data
            .par_iter()
            .zip(other.data.par_iter())
            .map(|(a, b)| (a - b).abs())
            .reduce(|| 0.0, f32::max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        let a = Tensor::<f32, 1>::new(vec![1.0, 2.0], [2]).unwrap();
        let b = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();

        assert_eq!((&a + &b).unwrap().data(), &[4.0, 6.0]);
        assert_eq!((&a - &b).unwrap().data(), &[-2.0, -2.0]);
        assert_eq!((&a * &b).unwrap().data(), &[3.0, 8.0]);
        assert_eq!((&b / &a).unwrap().data(), &[3.0, 2.0]);

        let f = Tensor::<f32, 1>::new(vec![1.0, 2.0, 3.0], [3]).unwrap();
        assert!(matches!(&a + &f, Err(TensorError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_map() {
        let t = Tensor::<f32, 1>::new(vec![1.0, -2.0], [2]).unwrap();
        assert_eq!(t.map(|x| x.abs()).data(), &[1.0, 2.0]);
    }

    #[test]
    fn test_transpose_axes_rank4() {
        // [B, S, H, D] -> [B, H, S, D]
        let data: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let t = Tensor::<f32, 4>::new(data, [1, 2, 2, 2]).unwrap();

        let permuted = t.transpose_axes(1, 2).unwrap();
        assert_eq!(permuted.shape(), &[1, 2, 2, 2]);
        assert_eq!(permuted.data(), &[0.0, 1.0, 4.0, 5.0, 2.0, 3.0, 6.0, 7.0]);
    }

    #[test]
    fn test_transpose_axes_matches_get() {
        let t = Tensor::<f32, 4>::from_fn([2, 3, 4, 5], |i| i as f32);
        let p = t.transpose_axes(0, 3).unwrap();
        assert_eq!(p.shape(), &[5, 3, 4, 2]);
        for (a, b, c, d) in [(1, 2, 3, 4), (0, 1, 0, 2), (1, 0, 2, 0)] {
            assert_eq!(t.get([a, b, c, d]).unwrap(), p.get([d, b, c, a]).unwrap());
        }
        // Swapping back is the identity.
        assert_eq!(p.transpose_axes(0, 3).unwrap(), t);
    }

    #[test]
    fn test_transpose_axes_error() {
        let t = Tensor::<f32, 2>::zeros([2, 2]);
        assert!(matches!(
            t.transpose_axes(0, 2),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_argmax_last() {
        let t = Tensor::<f32, 2>::new(vec![0.1, 0.7, 0.2, 0.9, 0.0, 0.9], [2, 3]).unwrap();
        assert_eq!(t.argmax_last(), vec![1, 0]);
    }

    #[test]
    fn test_max_abs_diff() {
        let a = Tensor::<f32, 1>::new(vec![3.0, 4.0], [2]).unwrap();
        let b = Tensor::<f32, 1>::new(vec![3.5, 2.0], [2]).unwrap();
        assert_eq!(a.max_abs_diff(&b).unwrap(), 2.0);
    }
}
