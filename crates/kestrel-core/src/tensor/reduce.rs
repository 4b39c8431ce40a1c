use crate::array::Array;
use crate::error::Result;
use crate::lazy::{Expr, ReduceOp};
use crate::tape;

use super::{accumulate, Tensor};

// Reductions
//
// Full reductions produce a rank-0 tensor; axis reductions drop the axis or
// keep it with size 1. In backward, the output gradient is broadcast back over
// the reduced axis: for `keep_dims == false` a size-1 axis is re-inserted as a
// stride-0 view first, so right-aligned broadcasting lines it up again.

/// `array` viewed with the reduced axis put back as size 1.
fn restore_axis(array: &Array, axis: usize, keep_dims: bool) -> Result<Array> {
    if keep_dims {
        Ok(array.clone())
    } else {
        array.expand_dims(axis)
    }
}

impl Tensor {
    fn reduce_all(
        &self,
        op: ReduceOp,
        derivative: impl Fn(&Tensor, &Tensor) -> Expr + 'static,
    ) -> Result<Tensor> {
        let w = self.w.expr().reduce(op).eval(self.dtype())?;
        let out = Tensor::output(w, &[self])?;
        if Tensor::records(&[self]) {
            let (input, result) = (self.clone(), out.clone());
            tape::record(move || {
                let grad = derivative(&input, &result) * result.dw.expr();
                accumulate(&input, grad)
            });
        }
        Ok(out)
    }

    fn reduce_along(
        &self,
        op: ReduceOp,
        axis: usize,
        keep_dims: bool,
        derivative: impl Fn(&Tensor, &Array, &Array) -> Expr + 'static,
    ) -> Result<Tensor> {
        let w = self
            .w
            .expr()
            .reduce_axis(op, axis, keep_dims)
            .eval(self.dtype())?;
        let out = Tensor::output(w, &[self])?;
        if Tensor::records(&[self]) {
            let (input, result) = (self.clone(), out.clone());
            tape::record(move || {
                let out_w = restore_axis(&result.w, axis, keep_dims)?;
                let out_dw = restore_axis(&result.dw, axis, keep_dims)?;
                let grad = derivative(&input, &out_w, &out_dw);
                accumulate(&input, grad)
            });
        }
        Ok(out)
    }

    pub fn sum(&self) -> Result<Tensor> {
        self.reduce_all(ReduceOp::Sum, |_, _| Expr::scalar(1.0))
    }

    pub fn mean(&self) -> Result<Tensor> {
        let n = self.elem_count() as f64;
        self.reduce_all(ReduceOp::Mean, move |_, _| Expr::scalar(1.0 / n))
    }

    /// Largest element; every position holding it receives the gradient.
    pub fn max(&self) -> Result<Tensor> {
        self.reduce_all(ReduceOp::Max, |x, out| x.w.expr().eq_mask(&out.w))
    }

    pub fn min(&self) -> Result<Tensor> {
        self.reduce_all(ReduceOp::Min, |x, out| x.w.expr().eq_mask(&out.w))
    }

    /// `sqrt(sum(x^2))`.
    pub fn l2_norm(&self) -> Result<Tensor> {
        let squares = self.w.expr().square().sum();
        let w = squares.sqrt().eval(self.dtype())?;
        let out = Tensor::output(w, &[self])?;
        if Tensor::records(&[self]) {
            let (input, result) = (self.clone(), out.clone());
            tape::record(move || accumulate(&input, &input.w / &result.w * &result.dw));
        }
        Ok(out)
    }

    pub fn sum_axis(&self, axis: usize, keep_dims: bool) -> Result<Tensor> {
        self.reduce_along(ReduceOp::Sum, axis, keep_dims, |_, _, dout| dout.expr())
    }

    pub fn mean_axis(&self, axis: usize, keep_dims: bool) -> Result<Tensor> {
        let n = self.shape().dim(axis)? as f64;
        self.reduce_along(ReduceOp::Mean, axis, keep_dims, move |_, _, dout| {
            dout / n
        })
    }

    pub fn max_axis(&self, axis: usize, keep_dims: bool) -> Result<Tensor> {
        self.reduce_along(ReduceOp::Max, axis, keep_dims, |x, out, dout| {
            x.w.expr().eq_mask(out) * dout
        })
    }

    pub fn min_axis(&self, axis: usize, keep_dims: bool) -> Result<Tensor> {
        self.reduce_along(ReduceOp::Min, axis, keep_dims, |x, out, dout| {
            x.w.expr().eq_mask(out) * dout
        })
    }

    /// `sqrt(sum(x^2, axis))`.
    pub fn l2_norm_axis(&self, axis: usize, keep_dims: bool) -> Result<Tensor> {
        let w = self
            .w
            .expr()
            .square()
            .sum_axis(axis, keep_dims)
            .sqrt()
            .eval(self.dtype())?;
        let out = Tensor::output(w, &[self])?;
        if Tensor::records(&[self]) {
            let (input, result) = (self.clone(), out.clone());
            tape::record(move || {
                let out_w = restore_axis(&result.w, axis, keep_dims)?;
                let out_dw = restore_axis(&result.dw, axis, keep_dims)?;
                accumulate(&input, &input.w / &out_w * &out_dw)
            });
        }
        Ok(out)
    }
}
