// Matrix products
//
// For [m, k] . [k, n] -> [m, n]:
//   C[i, j] = sum_k A[i, k] * B[k, j]
//
// Both operands are gathered into contiguous row-major f64 buffers on the
// host and multiplied with the `gemm` crate (SIMD dispatch at runtime). The
// product is then combined into the destination through the ordinary
// assignment path, so `+=` accumulation and dtype casting behave exactly as
// for lazy expressions.

use crate::array::Array;
use crate::error::{Error, Result};
use crate::lazy::AssignOp;
use crate::shape::Shape;

fn matrix_dims(array: &Array) -> Result<(usize, usize)> {
    match array.dims() {
        [rows, cols] => Ok((*rows, *cols)),
        _ => Err(Error::RankMismatch {
            expected: 2,
            got: array.rank(),
        }),
    }
}

/// Row-major product of two contiguous f64 matrices.
fn gemm_f64(lhs: &[f64], rhs: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
    let mut dst = vec![0.0f64; m * n];
    if m == 0 || n == 0 || k == 0 {
        return dst;
    }
    // SAFETY: dst is m*n, lhs is m*k and rhs is k*n, all row-major with the
    // strides passed below.
    unsafe {
        gemm::gemm(
            m,
            n,
            k,
            dst.as_mut_ptr(),
            1,
            n as isize,
            false,
            lhs.as_ptr(),
            1,
            k as isize,
            rhs.as_ptr(),
            1,
            n as isize,
            0.0,
            1.0,
            false,
            false,
            false,
            gemm::Parallelism::None,
        );
    }
    dst
}

/// `dst <op>= lhs . rhs` for 2-D arrays of one dtype.
pub fn dot_into(dst: &Array, op: AssignOp, lhs: &Array, rhs: &Array) -> Result<()> {
    let (m, k1) = matrix_dims(lhs)?;
    let (k2, n) = matrix_dims(rhs)?;
    if k1 != k2 {
        return Err(Error::DotShapeMismatch { m, k1, k2, n });
    }
    let expected = Shape::from((m, n));
    if dst.shape() != &expected {
        return Err(Error::ShapeMismatch {
            expected,
            got: dst.shape().clone(),
        });
    }
    let product = gemm_f64(&lhs.to_vec_f64()?, &rhs.to_vec_f64()?, m, k1, n);
    let product = Array::from_f64(&product, expected, dst.dtype())?;
    dst.assign(op, &product)
}

/// `lhs . rhs` as a new array.
pub fn dot(lhs: &Array, rhs: &Array) -> Result<Array> {
    let (m, _) = matrix_dims(lhs)?;
    let (_, n) = matrix_dims(rhs)?;
    let out = Array::zeros((m, n), lhs.dtype())?;
    dot_into(&out, AssignOp::Set, lhs, rhs)?;
    Ok(out)
}
