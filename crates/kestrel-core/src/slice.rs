use std::fmt;

use crate::error::{Error, Result};

/// A strided range along one axis.
///
/// `start` and `end` may be negative, in which case they count from the end
/// of the axis (`-1` is the last position). A positive `step` walks
/// `start, start + step, ...` while below `end`; a negative step walks the
/// same half-open range backwards starting from `end - 1`. So on an axis of
/// size 5, `Slice::new(0, Some(5), -2)` selects positions 4, 2, 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    start: isize,
    end: Option<isize>,
    step: isize,
}

/// A slice resolved against a concrete axis length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSlice {
    /// First selected position (in traversal order).
    pub first: usize,
    /// Number of selected positions.
    pub len: usize,
    /// Signed distance between consecutive selected positions.
    pub step: isize,
}

impl Slice {
    pub fn new(start: isize, end: Option<isize>, step: isize) -> Result<Self> {
        if step == 0 {
            return Err(Error::ZeroStep);
        }
        Ok(Slice { start, end, step })
    }

    /// `start..end` with unit step.
    pub fn range(start: isize, end: isize) -> Self {
        Slice {
            start,
            end: Some(end),
            step: 1,
        }
    }

    /// `start..` with unit step.
    pub fn starting_at(start: isize) -> Self {
        Slice {
            start,
            end: None,
            step: 1,
        }
    }

    /// The whole axis.
    pub fn full() -> Self {
        Slice::starting_at(0)
    }

    pub fn start(&self) -> isize {
        self.start
    }

    pub fn end(&self) -> Option<isize> {
        self.end
    }

    pub fn step(&self) -> isize {
        self.step
    }

    /// Resolve negative bounds and check them against an axis of size `dim`.
    pub fn resolve(&self, axis: usize, dim: usize) -> Result<ResolvedSlice> {
        let wrap = |v: isize| if v < 0 { v + dim as isize } else { v };
        let start = wrap(self.start);
        let end = self.end.map(wrap).unwrap_or(dim as isize);
        if start < 0 || end < 0 || start as usize > dim || end as usize > dim {
            return Err(Error::SliceOutOfBounds {
                dim: axis,
                start: self.start,
                end: self.end.unwrap_or(dim as isize),
                dim_size: dim,
            });
        }
        let stride = self.step.unsigned_abs();
        let span = (end - start).max(0) as usize;
        let len = span.div_ceil(stride);
        let first = if len == 0 {
            0
        } else if self.step > 0 {
            start as usize
        } else {
            end as usize - 1
        };
        Ok(ResolvedSlice {
            first,
            len,
            step: self.step,
        })
    }

    /// Number of positions selected on an axis that is long enough to hold
    /// both bounds as written.
    pub fn size(&self) -> usize {
        let end = self.end.unwrap_or(self.start);
        if end <= self.start {
            return 0;
        }
        ((end - self.start) as usize).div_ceil(self.step.unsigned_abs())
    }

    /// Whether position `i` is selected. Bounds are taken as written, so
    /// negative bounds never match.
    pub fn contains(&self, i: isize) -> bool {
        let end = match self.end {
            Some(e) => e,
            None => return i >= self.start && (i - self.start) % self.step.abs() == 0,
        };
        if i < self.start || i >= end {
            return false;
        }
        if self.step > 0 {
            (i - self.start) % self.step == 0
        } else {
            (end - 1 - i) % (-self.step) == 0
        }
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}:{}", self.start, end)?,
            None => write!(f, "{}:", self.start)?,
        }
        if self.step != 1 {
            write!(f, ":{}", self.step)?;
        }
        Ok(())
    }
}
