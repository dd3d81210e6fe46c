use crate::{KernelError, Result};

/// How an operand of [`sgemm`] is read from its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    /// The buffer holds `op(X)` directly.
    No,
    /// The buffer holds `X^T`; it is read through swapped strides.
    Yes,
}

impl Transpose {
    /// Row and column strides for reading a logical `[rows, cols]` operand.
    fn strides(self, rows: usize, cols: usize) -> (isize, isize) {
        match self {
            Transpose::No => (cols as isize, 1),
            // Physically stored as [cols, rows].
            Transpose::Yes => (1, rows as isize),
        }
    }
}

/// Single-precision general matrix multiply: `C = alpha * op(A) * op(B) + beta * C`.
///
/// `op(A)` is `[m, k]`, `op(B)` is `[k, n]` and `C` is `[m, n]`, all row-major. With
/// `beta == 0.0` the previous contents of `c` are ignored.
///
/// ```rust
/// use minformer_kernels::{sgemm, Transpose};
///
/// let a = vec![1.0, 2.0, 3.0, 4.0]; // [2, 2]
/// let b = vec![1.0, 0.0, 0.0, 1.0];
/// let mut c = vec![0.0; 4];
/// sgemm(Transpose::Yes, Transpose::No, 2, 2, 2, 1.0, &a, &b, 0.0, &mut c).unwrap();
/// assert_eq!(c, vec![1.0, 3.0, 2.0, 4.0]);
/// ```
#[allow(clippy::too_many_arguments)]
pub fn sgemm(
    trans_a: Transpose,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    b: &[f32],
    beta: f32,
    c: &mut [f32],
) -> Result<()> {
    if a.len() != m * k {
        return Err(KernelError::ShapeMismatch {
            expected: vec![m, k],
            got: vec![a.len()],
        });
    }
    if b.len() != k * n {
        return Err(KernelError::ShapeMismatch {
            expected: vec![k, n],
            got: vec![b.len()],
        });
    }
    if c.len() != m * n {
        return Err(KernelError::ShapeMismatch {
            expected: vec![m, n],
            got: vec![c.len()],
        });
    }
    if m == 0 || n == 0 {
        return Ok(());
    }
    if k == 0 {
        c.iter_mut().for_each(|x| *x *= beta);
        return Ok(());
    }

    let (rsa, csa) = trans_a.strides(m, k);
    let (rsb, csb) = trans_b.strides(k, n);

    // SAFETY: the length checks above guarantee that every element addressed through these
    // strides lies inside the corresponding slice, and `c` does not alias `a` or `b`.
    unsafe {
        matrixmultiply::sgemm(
            m,
            k,
            n,
            alpha,
            a.as_ptr(),
            rsa,
            csa,
            b.as_ptr(),
            rsb,
            csb,
            beta,
            c.as_mut_ptr(),
            n as isize,
            1,
        );
    }
    Ok(())
}
