use std::fmt;

// Shape: dimension sizes of an array
//
//   - Scalar: Shape([])          0 dimensions, 1 element
//   - Vector: Shape([5])         1 dimension, 5 elements
//   - Matrix: Shape([3, 4])      2 dimensions, 12 elements
//
// A Shape says nothing about memory; strides and offsets live in Layout.
// Two shapes take part in an elementwise expression when they broadcast
// (numpy rules, aligned from the right).

/// N-dimensional shape of an array.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The rank-0 shape.
    pub fn scalar() -> Self {
        Shape(vec![])
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar, 1 for vector, 2 for matrix, etc.).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. A scalar shape [] has 1 element, any
    /// zero-sized axis makes it 0.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Like [`Shape::elem_count`], `None` if the product overflows `usize`.
    pub fn checked_elem_count(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Compute the contiguous (row-major / C-order) strides for this shape.
    ///
    /// For shape [2, 3, 4], strides are [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<isize> {
        let mut strides = vec![0isize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1] as isize;
            }
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> crate::Result<usize> {
        self.0.get(d).copied().ok_or(crate::Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// This shape with axis `d` removed.
    pub fn remove_dim(&self, d: usize) -> crate::Result<Shape> {
        self.dim(d)?;
        let mut dims = self.0.clone();
        dims.remove(d);
        Ok(Shape(dims))
    }

    /// This shape with a size-`size` axis inserted at position `d`.
    pub fn insert_dim(&self, d: usize, size: usize) -> crate::Result<Shape> {
        if d > self.rank() {
            return Err(crate::Error::DimOutOfRange {
                dim: d,
                rank: self.rank(),
            });
        }
        let mut dims = self.0.clone();
        dims.insert(d, size);
        Ok(Shape(dims))
    }

    /// Decompose a row-major flat position into a multi-index, writing into
    /// `index` (which must have length `rank`).
    pub fn unravel_into(&self, mut flat: usize, index: &mut [usize]) {
        for d in (0..self.rank()).rev() {
            let size = self.0[d];
            if size == 0 {
                index[d] = 0;
                continue;
            }
            index[d] = flat % size;
            flat /= size;
        }
    }

    /// Compute the broadcast output shape from two input shapes.
    ///
    /// NumPy-style broadcasting rules:
    ///   1. Align shapes from the right (trailing dimensions).
    ///   2. Dimensions are compatible if they are equal or one of them is 1.
    ///   3. Missing leading dimensions are treated as 1.
    ///
    /// Examples:
    ///   [3, 4] and [4]     → [3, 4]
    ///   [2, 1] and [1, 3]  → [2, 3]
    ///   [3] and [4]        → Error
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> crate::Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd || rd == 1 {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else {
                return Err(crate::Error::ShapeMismatch {
                    expected: lhs.clone(),
                    got: rhs.clone(),
                });
            }
        }

        result.reverse();
        Ok(Shape::new(result))
    }

    /// Whether this shape can be broadcast into `target` without changing
    /// `target` (the direction used by assignment).
    pub fn broadcasts_to(&self, target: &Shape) -> bool {
        match Shape::broadcast_shape(target, self) {
            Ok(shape) => &shape == target,
            Err(_) => false,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// These let you write: Shape::from((3, 4)) instead of Shape::new(vec![3, 4])

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize,)> for Shape {
    fn from((d0,): (usize,)) -> Self {
        Shape(vec![d0])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(s: [usize; N]) -> Self {
        Shape(s.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}
