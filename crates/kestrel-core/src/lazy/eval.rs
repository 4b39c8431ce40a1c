use crate::array::Array;
use crate::device::{choose_device, Device};
use crate::error::{Error, Result};

use super::{cpu, AssignOp, Expr};

/// Combine `expr` into `dst` with `op`, in one pass on one device.
///
/// The device is picked from the freshness of the destination followed by
/// every participant: if any of them holds its latest values on a GPU the
/// whole expression runs there, otherwise on the host.
pub(crate) fn assign(dst: &Array, op: AssignOp, expr: Expr) -> Result<()> {
    let shape = expr.shape()?;
    if !shape.broadcasts_to(dst.shape()) {
        return Err(Error::ShapeMismatch {
            expected: dst.shape().clone(),
            got: shape,
        });
    }
    if let Some(dtype) = expr.dtype()? {
        if dtype != dst.dtype() {
            return Err(Error::DTypeMismatch {
                expected: dst.dtype(),
                got: dtype,
            });
        }
    }
    assign_any_dtype(dst, op, expr)
}

/// Like [`assign`] but lets the leaves differ in dtype from `dst`; values are
/// cast on store. Used for internal f64 scratch results.
pub(crate) fn assign_any_dtype(dst: &Array, op: AssignOp, expr: Expr) -> Result<()> {
    if dst.elem_count() == 0 {
        return Ok(());
    }

    let participants = expr.participants();
    let mut freshness = Vec::with_capacity(participants.len() + 1);
    freshness.push(dst.memory().freshness()?);
    for memory in &participants {
        freshness.push(memory.freshness()?);
    }

    match choose_device(&freshness) {
        Device::Cpu => cpu::run(dst, op, &expr, &participants),
        Device::Gpu(ordinal) => run_gpu(dst, op, &expr, ordinal),
    }
}

#[cfg(feature = "cuda")]
fn run_gpu(dst: &Array, op: AssignOp, expr: &Expr, ordinal: usize) -> Result<()> {
    super::gpu::run(dst, op, expr, ordinal)
}

#[cfg(not(feature = "cuda"))]
fn run_gpu(_dst: &Array, _op: AssignOp, _expr: &Expr, ordinal: usize) -> Result<()> {
    Err(Error::gpu_unavailable(Device::Gpu(ordinal)))
}

#[cfg(test)]
mod tests {
    use crate::{Array, DType, Error, Expr};

    #[test]
    fn test_compound_assignment_sequence() -> crate::Result<()> {
        let x = Array::zeros((3, 2), DType::F32)?;
        x.set(13.0)?;
        assert_eq!(x.sum()?, 78.0);
        x.add_assign(2.0)?;
        assert_eq!(x.sum()?, 90.0);
        let range = Array::arange((3, 2), DType::F32)?;
        x.add_assign(&range)?;
        for i in 0..6 {
            assert_eq!(x.get_flat(i)?, 15.0 + i as f64);
        }
        x.sub_assign(1.0)?;
        x.mul_assign(2.0)?;
        x.div_assign(Expr::scalar(4.0))?;
        assert_eq!(x.get_flat(1)?, 7.5);
        Ok(())
    }

    #[test]
    fn test_assignment_rejects_bad_shapes_and_dtypes() -> crate::Result<()> {
        let x = Array::zeros((2, 3), DType::F32)?;
        let wide = Array::zeros((4, 3), DType::F32)?;
        assert!(matches!(
            x.set(&wide),
            Err(Error::ShapeMismatch { .. })
        ));
        let doubles = Array::zeros((2, 3), DType::F64)?;
        assert!(matches!(
            x.add_assign(&doubles),
            Err(Error::DTypeMismatch { .. })
        ));
        // a row broadcasts into the matrix
        let row = Array::ones(3, DType::F32)?;
        x.set(&row)?;
        assert_eq!(x.sum()?, 6.0);
        Ok(())
    }

    #[test]
    fn test_integer_assignment_truncates() -> crate::Result<()> {
        let x = Array::zeros(3, DType::I32)?;
        x.set(69.1)?;
        assert_eq!(x.to_vec::<i32>()?, vec![69, 69, 69]);
        Ok(())
    }

    #[test]
    fn test_scalar_only_expression_on_lazy_destination() -> crate::Result<()> {
        let x = Array::zeros(4, DType::F64)?;
        assert!(!x.memory().is_any_allocated()?);
        x.add_assign(Expr::scalar(1.0) + 2.0)?;
        assert_eq!(x.to_vec_f64()?, vec![3.0; 4]);
        Ok(())
    }
}
