//! Numerical gradient checking.
//!
//! Compares the gradient the tape propagates into a tensor against central
//! finite differences of the same scalar function. Every differentiable
//! operation is tested this way.

use crate::error::{Error, Result};
use crate::tape::{self, NoBackprop};
use crate::tensor::Tensor;

fn scalar_value(out: &Tensor) -> Result<f64> {
    if out.elem_count() != 1 {
        return Err(Error::NotAScalar {
            shape: out.shape().clone(),
        });
    }
    out.w().get_flat(0)
}

/// Central differences `(f(x + eps) - f(x - eps)) / 2eps` for every element
/// of `x.w`, in row-major order. `f` must return a one-element tensor.
///
/// `x.w` is perturbed in place and restored afterwards; nothing is recorded.
pub fn numerical_grad<F>(x: &Tensor, f: F, eps: f64) -> Result<Vec<f64>>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    let _guard = NoBackprop::new();
    let mut grads = Vec::with_capacity(x.elem_count());
    for i in 0..x.elem_count() {
        let original = x.w().get_flat(i)?;

        x.w().set_flat(i, original + eps)?;
        let plus = f(x).and_then(|out| scalar_value(&out));

        x.w().set_flat(i, original - eps)?;
        let minus = f(x).and_then(|out| scalar_value(&out));

        x.w().set_flat(i, original)?;
        grads.push((plus? - minus?) / (2.0 * eps));
    }
    Ok(grads)
}

/// Largest absolute difference between two gradient vectors.
pub fn max_grad_error(lhs: &[f64], rhs: &[f64]) -> f64 {
    lhs.iter()
        .zip(rhs)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max)
}

/// Run `f(x)` on a fresh tape, seed and replay it, then compare `x.dw`
/// against [`numerical_grad`]. Elements agree when their difference is at
/// most `tol * max(1, |analytic|, |numeric|)`.
///
/// `x.dw` is cleared before and after the check.
pub fn check_grad<F>(x: &Tensor, f: F, eps: f64, tol: f64) -> Result<()>
where
    F: Fn(&Tensor) -> Result<Tensor>,
{
    x.clear_grad()?;
    tape::scoped(|| -> Result<()> {
        let out = f(x)?;
        out.grad()?;
        tape::backward()
    })?;
    let analytic = x.dw().to_vec_f64()?;
    x.clear_grad()?;

    let numeric = numerical_grad(x, &f, eps)?;
    for (i, (a, n)) in analytic.iter().zip(&numeric).enumerate() {
        let scale = 1.0f64.max(a.abs()).max(n.abs());
        if (a - n).abs() > tol * scale || a.is_nan() != n.is_nan() {
            return Err(Error::msg(format!(
                "gradient mismatch at element {i}: analytic {a}, numeric {n} (max error {})",
                max_grad_error(&analytic, &numeric)
            )));
        }
    }
    Ok(())
}
