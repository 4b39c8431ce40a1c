use std::fmt;
use std::sync::Arc;

use crate::config;
use crate::device::Device;
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::lazy::{self, AssignOp, Expr, ReduceOp};
use crate::memory::{HostBuffer, MemoryId, SynchronizedMemory};
use crate::shape::Shape;
use crate::slice::Slice;

// Array: a strided view onto a SynchronizedMemory
//
// Cloning an Array is cheap and yields another handle onto the same buffer
// with the same layout. View operations (transpose, pluck_axis, slice,
// expand_dims, row-major reshape) build a new layout over the same Arc'd
// memory, so writes through any view are visible through all of them.
//
// Arrays are mutated in place through compound assignment. The right-hand
// side is anything convertible into a lazy `Expr` (a scalar, another array,
// or an expression tree) and is evaluated in a single fused pass:
//
//   x.set(13.0)?;               // x = 13
//   x.add_assign(&y * 2.0)?;    // x += y * 2
//   x.div_assign((&y).exp())?;  // x /= exp(y)  (see `Expr` builders)

/// A dense n-dimensional array.
#[derive(Clone)]
pub struct Array {
    memory: Arc<SynchronizedMemory>,
    layout: Layout,
}

impl Array {
    // Constructors

    /// An all-zeros array that allocates nothing until first touched.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        Self::zeros_on(shape, dtype, config::default_device()?)
    }

    /// Like [`Array::zeros`] with an explicit preferred device.
    pub fn zeros_on(shape: impl Into<Shape>, dtype: DType, device: Device) -> Result<Self> {
        config::check_device(device)?;
        let shape = shape.into();
        let memory = SynchronizedMemory::zeros(shape.elem_count(), dtype, device);
        Ok(Array {
            memory: Arc::new(memory),
            layout: Layout::contiguous(shape),
        })
    }

    pub fn zeros_like(other: &Array) -> Result<Self> {
        Self::zeros(other.shape().clone(), other.dtype())
    }

    /// Build from a host buffer; the dtype follows the buffer.
    pub fn from_host(data: HostBuffer, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let memory = SynchronizedMemory::from_host(data, config::default_device()?);
        Ok(Array {
            memory: Arc::new(memory),
            layout: Layout::contiguous(shape),
        })
    }

    /// Build from a typed vector; the dtype follows `T`.
    pub fn from_vec<T: WithDType>(data: Vec<T>, shape: impl Into<Shape>) -> Result<Self> {
        Self::from_host(T::into_host(data), shape)
    }

    /// Build from f64 values, cast to `dtype`.
    pub fn from_f64(values: &[f64], shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        Self::from_host(HostBuffer::from_f64(dtype, values), shape)
    }

    /// A rank-0 array holding `value`.
    pub fn scalar(value: f64, dtype: DType) -> Result<Self> {
        Self::from_f64(&[value], Shape::scalar(), dtype)
    }

    pub fn full(shape: impl Into<Shape>, value: f64, dtype: DType) -> Result<Self> {
        let array = Self::zeros(shape, dtype)?;
        array.set(value)?;
        Ok(array)
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        Self::full(shape, 1.0, dtype)
    }

    /// 0, 1, 2, ... in row-major order.
    pub fn arange(shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        let shape = shape.into();
        let values: Vec<f64> = (0..shape.elem_count()).map(|i| i as f64).collect();
        Self::from_f64(&values, shape, dtype)
    }

    fn with_layout(&self, layout: Layout) -> Array {
        Array {
            memory: Arc::clone(&self.memory),
            layout,
        }
    }

    // Accessors

    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.memory.dtype()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn strides(&self) -> &[isize] {
        self.layout.strides()
    }

    pub fn offset(&self) -> usize {
        self.layout.offset()
    }

    pub fn memory(&self) -> &Arc<SynchronizedMemory> {
        &self.memory
    }

    pub fn memory_id(&self) -> MemoryId {
        self.memory.id()
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    /// Whether this view covers every element of its buffer exactly once.
    pub fn spans_entire_memory(&self) -> bool {
        self.elem_count() == self.memory.len() && self.layout.is_contiguous()
    }

    /// Whether both arrays view the same buffer.
    pub fn shares_memory(&self, other: &Array) -> bool {
        Arc::ptr_eq(&self.memory, &other.memory)
    }

    // Assignment

    /// `self <op>= expr`, evaluated as one pass.
    pub fn assign(&self, op: AssignOp, expr: impl Into<Expr>) -> Result<()> {
        lazy::assign(self, op, expr.into())
    }

    pub fn set(&self, expr: impl Into<Expr>) -> Result<()> {
        self.assign(AssignOp::Set, expr)
    }

    pub fn add_assign(&self, expr: impl Into<Expr>) -> Result<()> {
        self.assign(AssignOp::Add, expr)
    }

    pub fn sub_assign(&self, expr: impl Into<Expr>) -> Result<()> {
        self.assign(AssignOp::Sub, expr)
    }

    pub fn mul_assign(&self, expr: impl Into<Expr>) -> Result<()> {
        self.assign(AssignOp::Mul, expr)
    }

    pub fn div_assign(&self, expr: impl Into<Expr>) -> Result<()> {
        self.assign(AssignOp::Div, expr)
    }

    /// Zero the array. A view spanning its whole buffer is cleared lazily.
    pub fn clear(&self) -> Result<()> {
        if self.spans_entire_memory() {
            self.memory.lazy_clear()
        } else {
            self.set(0.0)
        }
    }

    /// A lazy expression reading this array.
    pub fn expr(&self) -> Expr {
        Expr::from(self)
    }

    // Reductions

    fn reduce(&self, op: ReduceOp) -> Result<f64> {
        self.expr().reduce(op).eval_scalar()
    }

    pub fn sum(&self) -> Result<f64> {
        self.reduce(ReduceOp::Sum)
    }

    pub fn mean(&self) -> Result<f64> {
        self.reduce(ReduceOp::Mean)
    }

    pub fn max(&self) -> Result<f64> {
        self.reduce(ReduceOp::Max)
    }

    pub fn min(&self) -> Result<f64> {
        self.reduce(ReduceOp::Min)
    }

    pub fn l2_norm(&self) -> Result<f64> {
        Ok(self.expr().square().sum().eval_scalar()?.sqrt())
    }

    /// Whether the arrays have the same shape and differ by at most `atol`
    /// everywhere.
    pub fn allclose(&self, other: &Array, atol: f64) -> Result<bool> {
        if self.shape() != other.shape() {
            return Ok(false);
        }
        if self.elem_count() == 0 {
            return Ok(true);
        }
        let diff = (self.expr() - other.expr())
            .abs()
            .max()
            .eval_scalar()?;
        Ok(diff <= atol)
    }

    /// Exact elementwise equality (same shape).
    pub fn equals(&self, other: &Array) -> Result<bool> {
        self.allclose(other, 0.0)
    }

    // Element access

    pub fn get(&self, index: &[usize]) -> Result<f64> {
        let pos = self.layout.checked_flat_index(index)?;
        Ok(self.memory.cpu_data()?.get_f64(pos))
    }

    /// Write one element (cast to the dtype).
    pub fn set_at(&self, index: &[usize], value: f64) -> Result<()> {
        let pos = self.layout.checked_flat_index(index)?;
        self.memory.mutable_cpu_data()?.set_f64(pos, value);
        Ok(())
    }

    pub fn add_at(&self, index: &[usize], value: f64) -> Result<()> {
        let pos = self.layout.checked_flat_index(index)?;
        let mut data = self.memory.mutable_cpu_data()?;
        let old = data.get_f64(pos);
        data.set_f64(pos, old + value);
        Ok(())
    }

    fn unravel(&self, flat: usize) -> Result<Vec<usize>> {
        if flat >= self.elem_count() {
            return Err(Error::IndexOutOfRange {
                index: flat,
                axis: 0,
                size: self.elem_count(),
            });
        }
        let mut index = vec![0; self.rank()];
        self.shape().unravel_into(flat, &mut index);
        Ok(index)
    }

    /// Element at a row-major logical position.
    pub fn get_flat(&self, flat: usize) -> Result<f64> {
        let index = self.unravel(flat)?;
        self.get(&index)
    }

    pub fn set_flat(&self, flat: usize, value: f64) -> Result<()> {
        let index = self.unravel(flat)?;
        self.set_at(&index, value)
    }

    /// All elements in row-major logical order.
    pub fn to_vec_f64(&self) -> Result<Vec<f64>> {
        let data = self.memory.cpu_data()?;
        Ok(self
            .layout
            .strided_indices()
            .map(|pos| data.get_f64(pos))
            .collect())
    }

    pub fn to_vec<T: WithDType>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: T::DTYPE,
            });
        }
        Ok(self.to_vec_f64()?.into_iter().map(T::from_f64).collect())
    }

    // Views

    /// Reverse all axes.
    pub fn transpose(&self) -> Array {
        self.with_layout(self.layout.transpose())
    }

    pub fn swap_axes(&self, dim0: usize, dim1: usize) -> Result<Array> {
        Ok(self.with_layout(self.layout.swap_axes(dim0, dim1)?))
    }

    /// Fix `axis` at `index`, dropping that axis.
    pub fn pluck_axis(&self, axis: usize, index: usize) -> Result<Array> {
        Ok(self.with_layout(self.layout.pluck_axis(axis, index)?))
    }

    pub fn slice(&self, dim: usize, slice: &Slice) -> Result<Array> {
        Ok(self.with_layout(self.layout.slice(dim, slice)?))
    }

    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Array> {
        Ok(self.with_layout(self.layout.narrow(dim, start, len)?))
    }

    /// Insert a size-1 axis at `axis`.
    pub fn expand_dims(&self, axis: usize) -> Result<Array> {
        Ok(self.with_layout(self.layout.expand_dims(axis)?))
    }

    /// Reshape, sharing memory when the layout is row-major and copying
    /// otherwise.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Array> {
        let shape = shape.into();
        match self.layout.reshape(&shape)? {
            Some(layout) => Ok(self.with_layout(layout)),
            None => self.copy()?.reshape(shape),
        }
    }

    /// Whether [`Array::reshape`] to `shape` would share memory.
    pub fn reshape_is_view(&self, shape: &Shape) -> Result<bool> {
        Ok(self.layout.reshape(shape)?.is_some())
    }

    // Copies

    /// A fresh contiguous buffer holding the same values.
    pub fn copy(&self) -> Result<Array> {
        let out = Array::zeros_on(
            self.shape().clone(),
            self.dtype(),
            self.memory.preferred_device(),
        )?;
        out.set(self)?;
        Ok(out)
    }

    /// `self` if already contiguous, else a contiguous copy.
    pub fn contiguous(&self) -> Result<Array> {
        if self.is_contiguous() {
            Ok(self.clone())
        } else {
            self.copy()
        }
    }

    // Index queries (ties resolve to the lowest index)

    fn arg_best(values: &[f64], better: impl Fn(f64, f64) -> bool) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, &v) in values.iter().enumerate() {
            match best {
                None => best = Some((i, v)),
                Some((_, b)) if better(v, b) => best = Some((i, v)),
                Some(_) => {}
            }
        }
        best.map(|(i, _)| i)
    }

    fn empty_query(&self) -> Error {
        Error::msg(format!("arg query on empty array of shape {}", self.shape()))
    }

    /// Row-major position of the largest element.
    pub fn argmax(&self) -> Result<usize> {
        Self::arg_best(&self.to_vec_f64()?, |a, b| a > b).ok_or_else(|| self.empty_query())
    }

    /// Row-major position of the smallest element.
    pub fn argmin(&self) -> Result<usize> {
        Self::arg_best(&self.to_vec_f64()?, |a, b| a < b).ok_or_else(|| self.empty_query())
    }

    /// Position of the largest element among row-major positions
    /// `lower..upper`.
    pub fn argmax_slice(&self, lower: usize, upper: usize) -> Result<usize> {
        let values = self.to_vec_f64()?;
        if lower >= upper || upper > values.len() {
            return Err(Error::SliceOutOfBounds {
                dim: 0,
                start: lower as isize,
                end: upper as isize,
                dim_size: values.len(),
            });
        }
        Self::arg_best(&values[lower..upper], |a, b| a > b)
            .map(|i| i + lower)
            .ok_or_else(|| self.empty_query())
    }

    fn arg_along(&self, axis: usize, better: impl Fn(f64, f64) -> bool) -> Result<Vec<usize>> {
        let extent = self.shape().dim(axis)?;
        if extent == 0 {
            return Err(self.empty_query());
        }
        let values = self.to_vec_f64()?;
        let outer: usize = self.dims()[..axis].iter().product();
        let inner: usize = self.dims()[axis + 1..].iter().product();
        let mut out = Vec::with_capacity(outer * inner);
        let mut lane = Vec::with_capacity(extent);
        for o in 0..outer {
            for i in 0..inner {
                lane.clear();
                lane.extend((0..extent).map(|k| values[(o * extent + k) * inner + i]));
                out.push(Self::arg_best(&lane, &better).unwrap_or(0));
            }
        }
        Ok(out)
    }

    /// Index of the largest element along `axis`, for every position of the
    /// remaining axes (row-major).
    pub fn argmax_axis(&self, axis: usize) -> Result<Vec<usize>> {
        self.arg_along(axis, |a, b| a > b)
    }

    pub fn argmin_axis(&self, axis: usize) -> Result<Vec<usize>> {
        self.arg_along(axis, |a, b| a < b)
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Array(memory={}, shape={}, strides={:?}, offset={}, dtype={})",
            self.memory.id().as_u64(),
            self.shape(),
            self.strides(),
            self.offset(),
            self.dtype(),
        )
    }
}

fn write_nested(
    f: &mut fmt::Formatter<'_>,
    dims: &[usize],
    values: &[f64],
    depth: usize,
) -> fmt::Result {
    match dims {
        [] => write!(f, "{}", values.first().copied().unwrap_or(0.0)),
        [n] => {
            write!(f, "[")?;
            for (i, v) in values.iter().take(*n).enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{v:.4}")?;
            }
            write!(f, "]")
        }
        [n, rest @ ..] => {
            let chunk: usize = rest.iter().product();
            write!(f, "[")?;
            for i in 0..*n {
                if i > 0 {
                    write!(f, ",\n{:indent$}", "", indent = depth + 1)?;
                }
                let part = values.get(i * chunk..(i + 1) * chunk).unwrap_or(&[]);
                write_nested(f, rest, part, depth + 1)?;
            }
            write!(f, "]")
        }
    }
}

impl fmt::Display for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_vec_f64() {
            Ok(values) => write_nested(f, self.dims(), &values, 0),
            Err(e) => write!(f, "<unreadable array: {e}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros_do_not_allocate() -> Result<()> {
        let x = Array::zeros((3, 4), DType::F32)?;
        assert!(!x.memory().is_any_allocated()?);
        assert_eq!(x.sum()?, 0.0);
        assert!(x.memory().is_allocated(Device::Cpu)?);
        Ok(())
    }

    #[test]
    fn test_views_alias_memory() -> Result<()> {
        let x = Array::arange((2, 3), DType::F64)?;
        let t = x.transpose();
        assert!(t.shares_memory(&x));
        assert_eq!(t.dims(), &[3, 2]);
        assert_eq!(t.get(&[2, 1])?, 5.0);

        let row = x.pluck_axis(0, 1)?;
        row.set(-1.0)?;
        assert_eq!(x.to_vec_f64()?, vec![0.0, 1.0, 2.0, -1.0, -1.0, -1.0]);
        assert_eq!(t.get(&[0, 1])?, -1.0);
        Ok(())
    }

    #[test]
    fn test_reshape_shares_or_copies() -> Result<()> {
        let x = Array::arange((2, 3), DType::F32)?;
        let flat = x.reshape(6)?;
        assert!(flat.shares_memory(&x));

        let t = x.transpose();
        assert!(!t.reshape_is_view(&Shape::from(6))?);
        let copied = t.reshape(6)?;
        assert!(!copied.shares_memory(&x));
        assert_eq!(copied.to_vec_f64()?, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);

        assert!(matches!(
            x.reshape((4, 2)),
            Err(Error::ReshapeElementMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_proper_slicing() -> Result<()> {
        let x = Array::arange((3, 4), DType::F32)?;
        // x[:-1, 2] -> [2, 6]
        let y = x.slice(0, &Slice::range(0, -1))?.pluck_axis(1, 2)?;
        assert_eq!(y.to_vec_f64()?, vec![2.0, 6.0]);
        // x[1, 0:4:-2] -> [7, 5]
        let z = x.pluck_axis(0, 1)?.slice(0, &Slice::new(0, Some(4), -2)?)?;
        assert_eq!(z.to_vec_f64()?, vec![7.0, 5.0]);
        assert_eq!(y.sum()? + z.sum()?, 20.0);
        Ok(())
    }

    #[test]
    fn test_element_access_checks_bounds() -> Result<()> {
        let x = Array::zeros((2, 2), DType::I32)?;
        x.set_at(&[1, 0], 4.9)?;
        assert_eq!(x.get(&[1, 0])?, 4.0);
        x.add_at(&[1, 0], 2.0)?;
        assert_eq!(x.get_flat(2)?, 6.0);
        assert!(matches!(
            x.get(&[2, 0]),
            Err(Error::IndexOutOfRange { .. })
        ));
        assert!(matches!(
            x.get(&[0]),
            Err(Error::IndexRankMismatch { .. })
        ));
        assert!(x.get_flat(4).is_err());
        Ok(())
    }

    #[test]
    fn test_reductions_and_norm() -> Result<()> {
        let x = Array::from_vec(vec![3.0f64, -4.0, 0.0, 1.0], (2, 2))?;
        assert_eq!(x.sum()?, 0.0);
        assert_eq!(x.mean()?, 0.0);
        assert_eq!(x.max()?, 3.0);
        assert_eq!(x.min()?, -4.0);
        assert!((x.l2_norm()? - 26f64.sqrt()).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_allclose() -> Result<()> {
        let a = Array::from_vec(vec![1.0f32, 2.0], 2)?;
        let b = Array::from_vec(vec![1.0f32, 2.001], 2)?;
        assert!(a.allclose(&b, 1e-2)?);
        assert!(!a.allclose(&b, 1e-4)?);
        assert!(!a.allclose(&Array::zeros(3, DType::F32)?, 10.0)?);
        Ok(())
    }

    #[test]
    fn test_argmax_prefers_lowest_index() -> Result<()> {
        let x = Array::from_vec(vec![1.0f32, 7.0, 7.0, -2.0, 7.0, 0.0], (2, 3))?;
        assert_eq!(x.argmax()?, 1);
        assert_eq!(x.argmin()?, 3);
        assert_eq!(x.argmax_slice(2, 6)?, 2);
        assert_eq!(x.argmax_slice(3, 4)?, 3);
        assert!(x.argmax_slice(4, 4).is_err());
        Ok(())
    }

    #[test]
    fn test_arg_along_axes() -> Result<()> {
        let b = Array::zeros((6, 5), DType::F64)?;
        for (r, c, v) in [
            (0, 0, -12.0),
            (1, 3, -32.0),
            (2, 4, -44.0),
            (3, 0, -35.0),
            (4, 2, -32.0),
            (5, 3, -27.0),
        ] {
            b.set_at(&[r, c], v)?;
        }
        assert_eq!(b.argmin_axis(0)?, vec![3, 0, 4, 1, 2]);
        assert_eq!(b.argmin_axis(1)?, vec![0, 3, 4, 0, 2, 3]);

        let eye = Array::zeros((5, 5), DType::F32)?;
        for i in 0..5 {
            eye.set_at(&[i, i], 1.0)?;
        }
        assert_eq!(eye.argmax_axis(0)?, vec![0, 1, 2, 3, 4]);
        assert_eq!(eye.argmax_axis(1)?, vec![0, 1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_clear_is_lazy_for_whole_buffers() -> Result<()> {
        let x = Array::ones((2, 2), DType::F32)?;
        x.clear()?;
        assert!(!x.memory().is_fresh(Device::Cpu)?);
        assert_eq!(x.sum()?, 0.0);

        let y = Array::ones((2, 2), DType::F32)?;
        y.pluck_axis(0, 0)?.clear()?;
        assert_eq!(y.to_vec_f64()?, vec![0.0, 0.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_display() -> Result<()> {
        let x = Array::arange((2, 2), DType::F32)?;
        assert_eq!(
            format!("{x}"),
            "[[0.0000, 1.0000],\n [2.0000, 3.0000]]"
        );
        Ok(())
    }
}
