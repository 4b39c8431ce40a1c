use crate::error::Result;
use crate::shape::Shape;
use crate::slice::Slice;
use crate::tape;

use super::{accumulate, Tensor};

// Views re-stride both `w` and `dw` over their existing memory, so a gradient
// written into the view lands directly in the source's `dw`. No tape entry is
// needed; only a reshape that has to copy records one.

impl Tensor {
    pub fn transpose(&self) -> Tensor {
        self.view(self.w.transpose(), self.dw.transpose())
    }

    pub fn swap_axes(&self, dim0: usize, dim1: usize) -> Result<Tensor> {
        Ok(self.view(self.w.swap_axes(dim0, dim1)?, self.dw.swap_axes(dim0, dim1)?))
    }

    /// Fix `axis` at `index`, dropping that axis.
    pub fn pluck_axis(&self, axis: usize, index: usize) -> Result<Tensor> {
        Ok(self.view(self.w.pluck_axis(axis, index)?, self.dw.pluck_axis(axis, index)?))
    }

    /// One row of a matrix (or the first-axis slab of a higher-rank tensor).
    pub fn row_pluck(&self, row: usize) -> Result<Tensor> {
        self.pluck_axis(0, row)
    }

    pub fn slice(&self, dim: usize, slice: &Slice) -> Result<Tensor> {
        Ok(self.view(self.w.slice(dim, slice)?, self.dw.slice(dim, slice)?))
    }

    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Tensor> {
        Ok(self.view(self.w.narrow(dim, start, len)?, self.dw.narrow(dim, start, len)?))
    }

    /// Insert a size-1 axis at `axis`.
    pub fn expand_dims(&self, axis: usize) -> Result<Tensor> {
        Ok(self.view(self.w.expand_dims(axis)?, self.dw.expand_dims(axis)?))
    }

    /// Same elements, new shape. A view when both arrays' strides allow it,
    /// otherwise a copy whose gradient is reshaped back in backward.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        if self.w.reshape_is_view(&shape)? && self.dw.reshape_is_view(&shape)? {
            return Ok(self.view(self.w.reshape(&shape)?, self.dw.reshape(&shape)?));
        }
        let out = Tensor::output(self.w.reshape(&shape)?, &[self])?;
        if Tensor::records(&[self]) {
            let (input, result) = (self.clone(), out.clone());
            tape::record(move || accumulate(&input, result.dw.reshape(input.shape())?));
        }
        Ok(out)
    }
}
