use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::slice::Slice;

// Layout: how an array's logical shape maps onto its memory buffer
//
// KEY CONCEPTS:
//
// 1. **Strides**: how many elements to skip in the flat buffer to move one
//    step along each dimension. A contiguous [2,3] matrix has strides [3,1].
//    Strides are signed so that a slice with a negative step can walk an
//    axis backwards; a stride of 0 repeats one element (broadcasting).
//
// 2. **Views**: transpose, pluck_axis, slice, expand_dims and reshape (of a
//    row-major layout) only rewrite shape/strides/offset. The buffer is
//    shared, so writes through a view are visible through its source.
//
// 3. **Contiguous check**: a layout is contiguous when its strides are the
//    row-major strides of its shape and the offset is 0.

/// Layout describes how an array's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<isize>,
    /// Position in the buffer of the element at index [0, 0, ...].
    offset: usize,
}

impl Layout {
    /// Create a new contiguous layout for the given shape.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Create a layout with explicit strides and offset (for views).
    pub fn new(shape: Shape, strides: Vec<isize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Row-major strides and offset 0.
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.has_row_major_strides()
    }

    /// Row-major strides, any offset. Such a view covers one dense block of
    /// the buffer, so it can be reshaped without copying.
    pub fn has_row_major_strides(&self) -> bool {
        let natural = self.shape.stride_contiguous();
        self.strides
            .iter()
            .zip(natural.iter())
            .zip(self.dims())
            .all(|((s, n), d)| *d <= 1 || s == n)
    }

    fn check_dim(&self, dim: usize) -> Result<()> {
        if dim >= self.rank() {
            return Err(Error::DimOutOfRange {
                dim,
                rank: self.rank(),
            });
        }
        Ok(())
    }

    /// Reverse all axes ([2, 3, 4] → [4, 3, 2]).
    pub fn transpose(&self) -> Layout {
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        dims.reverse();
        strides.reverse();
        Layout::new(Shape::new(dims), strides, self.offset)
    }

    /// Swap two axes.
    ///
    /// Example: [2, 3, 4] swap_axes(0, 2) → [4, 3, 2]
    ///          strides [12, 4, 1]        → [1, 4, 12]
    pub fn swap_axes(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        self.check_dim(dim0)?;
        self.check_dim(dim1)?;
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        dims.swap(dim0, dim1);
        strides.swap(dim0, dim1);
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// Keep `len` positions of `dim` starting at `start`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        self.slice(dim, &Slice::range(start as isize, (start + len) as isize))
    }

    /// Apply a (possibly negative-step) slice along `dim`.
    pub fn slice(&self, dim: usize, slice: &Slice) -> Result<Layout> {
        self.check_dim(dim)?;
        let resolved = slice.resolve(dim, self.dims()[dim])?;
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        dims[dim] = resolved.len;
        strides[dim] = self.strides[dim] * resolved.step;
        let offset = if resolved.len == 0 {
            self.offset
        } else {
            self.displace(self.offset, resolved.first as isize * self.strides[dim])
        };
        Ok(Layout::new(Shape::new(dims), strides, offset))
    }

    /// Select position `index` of axis `axis` and drop that axis.
    ///
    /// On a [2, 3, 4] contiguous layout, pluck_axis(1, 2) gives shape [2, 4],
    /// offset 8, strides [12, 1].
    pub fn pluck_axis(&self, axis: usize, index: usize) -> Result<Layout> {
        self.check_dim(axis)?;
        let size = self.dims()[axis];
        if index >= size {
            return Err(Error::IndexOutOfRange { index, axis, size });
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        dims.remove(axis);
        let stride = strides.remove(axis);
        let offset = self.displace(self.offset, index as isize * stride);
        Ok(Layout::new(Shape::new(dims), strides, offset))
    }

    /// Insert a size-1 axis at position `axis`.
    pub fn expand_dims(&self, axis: usize) -> Result<Layout> {
        if axis > self.rank() {
            return Err(Error::DimOutOfRange {
                dim: axis,
                rank: self.rank(),
            });
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        dims.insert(axis, 1);
        strides.insert(axis, 0);
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// View this layout with the (larger) broadcast shape `target`: missing
    /// leading axes and size-1 axes get stride 0.
    pub fn broadcast_to(&self, target: &Shape) -> Result<Layout> {
        if !self.shape.broadcasts_to(target) {
            return Err(Error::ShapeMismatch {
                expected: target.clone(),
                got: self.shape.clone(),
            });
        }
        let lead = target.rank() - self.rank();
        let mut strides = vec![0isize; target.rank()];
        for (d, (&size, &stride)) in self.dims().iter().zip(&self.strides).enumerate() {
            if size == target.dims()[d + lead] {
                strides[d + lead] = stride;
            }
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// Reinterpret a row-major layout with another shape of the same size.
    /// Returns `None` when the strides are not row-major (a copy is needed).
    pub fn reshape(&self, shape: &Shape) -> Result<Option<Layout>> {
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: shape.elem_count(),
                dst_shape: shape.clone(),
            });
        }
        if !self.has_row_major_strides() {
            return Ok(None);
        }
        Ok(Some(Layout::new(
            shape.clone(),
            shape.stride_contiguous(),
            self.offset,
        )))
    }

    fn displace(&self, base: usize, delta: isize) -> usize {
        (base as isize + delta) as usize
    }

    /// Flat buffer position of a multi-dimensional index (no bounds check).
    /// flat_index = offset + sum(index[i] * stride[i])
    pub fn flat_index(&self, index: &[usize]) -> usize {
        let mut flat = self.offset as isize;
        for (i, &idx) in index.iter().enumerate() {
            flat += idx as isize * self.strides[i];
        }
        flat as usize
    }

    /// Flat buffer position of a multi-dimensional index, checking every
    /// coordinate against its axis.
    pub fn checked_flat_index(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.rank() {
            return Err(Error::IndexRankMismatch {
                expected: self.rank(),
                got: index.len(),
            });
        }
        for (axis, (&i, &size)) in index.iter().zip(self.dims()).enumerate() {
            if i >= size {
                return Err(Error::IndexOutOfRange {
                    index: i,
                    axis,
                    size,
                });
            }
        }
        Ok(self.flat_index(index))
    }

    /// Iterator over all flat indices of this layout, in logical order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

// StridedIter: walks the logical elements of a layout in row-major order and
// yields the buffer position of each one. For a contiguous layout this counts
// 0, 1, 2, ...; for a transposed or sliced one it jumps around.

/// Iterator that yields flat storage indices for each element of a Layout.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<isize>,
    /// Buffer position of `current`.
    position: isize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            position: layout.offset() as isize,
            remaining: layout.elem_count(),
            started: false,
        }
    }

    /// Advance the multi-dimensional index by one (rightmost dimension first),
    /// keeping `position` in sync.
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            self.position += self.strides[i];
            if self.current[i] < self.dims[i] {
                return;
            }
            self.position -= self.strides[i] * self.dims[i] as isize;
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.position as usize)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}

#[cfg(test)]
mod tests {
    use super::*;

    fn arange_234() -> Layout {
        Layout::contiguous(Shape::from((2, 3, 4)))
    }

    #[test]
    fn test_contiguous_layout() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        assert!(layout.is_contiguous());
        assert_eq!(layout.strides(), &[3, 1]);
        let indices: Vec<usize> = layout.strided_indices().collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_transpose_indices() {
        // [[0, 1, 2],
        //  [3, 4, 5]] read through the transpose is 0, 3, 1, 4, 2, 5
        let t = Layout::contiguous(Shape::from((2, 3))).transpose();
        assert_eq!(t.dims(), &[3, 2]);
        assert_eq!(t.strides(), &[1, 3]);
        assert!(!t.is_contiguous());
        let indices: Vec<usize> = t.strided_indices().collect();
        assert_eq!(indices, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_pluck_axis_strides() {
        let x = arange_234();

        let p0 = x.pluck_axis(0, 1).unwrap();
        assert_eq!(p0.dims(), &[3, 4]);
        assert_eq!(p0.offset(), 12);
        assert!(p0.has_row_major_strides());

        let p1 = x.pluck_axis(1, 2).unwrap();
        assert_eq!(p1.dims(), &[2, 4]);
        assert_eq!(p1.offset(), 8);
        assert_eq!(p1.strides(), &[12, 1]);

        let p2 = x.pluck_axis(2, 1).unwrap();
        assert_eq!(p2.dims(), &[2, 3]);
        assert_eq!(p2.offset(), 1);
        assert_eq!(p2.strides(), &[12, 4]);

        assert!(x.pluck_axis(2, 4).is_err());
        assert!(x.pluck_axis(3, 0).is_err());
    }

    #[test]
    fn test_negative_step_slice() {
        // positions 3, 1 of the last axis
        let x = arange_234();
        let s = x
            .slice(2, &Slice::new(0, Some(4), -2).unwrap())
            .unwrap();
        assert_eq!(s.dims(), &[2, 3, 2]);
        assert_eq!(s.strides(), &[12, 4, -2]);
        let first_row: Vec<usize> = s.strided_indices().take(2).collect();
        assert_eq!(first_row, vec![3, 1]);
    }

    #[test]
    fn test_narrow() {
        let layout = Layout::contiguous(Shape::from((4, 6)));
        let narrowed = layout.narrow(1, 2, 3).unwrap();
        assert_eq!(narrowed.dims(), &[4, 3]);
        assert_eq!(narrowed.offset(), 2);
        assert_eq!(narrowed.strides(), &[6, 1]);
        assert!(layout.narrow(1, 5, 3).is_err());
    }

    #[test]
    fn test_broadcast_to() {
        let col = Layout::contiguous(Shape::from((3, 1)));
        let b = col.broadcast_to(&Shape::from((2, 3, 4))).unwrap();
        assert_eq!(b.strides(), &[0, 1, 0]);
        let indices: Vec<usize> = b.strided_indices().take(5).collect();
        assert_eq!(indices, vec![0, 0, 0, 0, 1]);
        assert!(col.broadcast_to(&Shape::from((4, 4))).is_err());
    }

    #[test]
    fn test_reshape_requires_row_major() {
        let layout = Layout::contiguous(Shape::from((2, 6)));
        let r = layout.reshape(&Shape::from((3, 4))).unwrap().unwrap();
        assert_eq!(r.strides(), &[4, 1]);
        assert!(layout.transpose().reshape(&Shape::from(12)).unwrap().is_none());
        assert!(layout.reshape(&Shape::from(11)).is_err());
    }

    #[test]
    fn test_checked_flat_index() {
        let layout = arange_234();
        assert_eq!(layout.checked_flat_index(&[1, 2, 3]).unwrap(), 23);
        assert!(layout.checked_flat_index(&[2, 0, 0]).is_err());
        assert!(layout.checked_flat_index(&[0, 0]).is_err());
    }
}
