use crate::error::{Error, Result};
use crate::shape::Shape;

use super::Tensor;

// Named broadcast variants for the common matrix cases. A column vector of
// `n` values (shape [n] or [n, 1]) is stretched across the columns of an
// [n, d] matrix; a row vector [1, d] is stretched across its rows. These are
// thin checks over the numpy-broadcasting binary ops, which already sum the
// gradient back over the stretched axis.

impl Tensor {
    /// `self` must be a matrix; `column` is viewed as [rows, 1].
    fn as_column_of(&self, column: &Tensor) -> Result<Tensor> {
        let rows = match self.dims() {
            [rows, _] => *rows,
            _ => {
                return Err(Error::RankMismatch {
                    expected: 2,
                    got: self.rank(),
                })
            }
        };
        let expected = Shape::from((rows, 1));
        match column.dims() {
            [n] if *n == rows => Ok(column.view(column.w.expand_dims(1)?, column.dw.expand_dims(1)?)),
            [n, 1] if *n == rows => Ok(column.clone()),
            _ => Err(Error::ShapeMismatch {
                expected,
                got: column.shape().clone(),
            }),
        }
    }

    fn check_row_of(&self, row: &Tensor) -> Result<()> {
        let cols = match self.dims() {
            [_, cols] => *cols,
            _ => {
                return Err(Error::RankMismatch {
                    expected: 2,
                    got: self.rank(),
                })
            }
        };
        if row.dims() != [1, cols] {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((1, cols)),
                got: row.shape().clone(),
            });
        }
        Ok(())
    }

    /// `self[i, j] + column[i]`.
    pub fn add_broadcast(&self, column: &Tensor) -> Result<Tensor> {
        self.add(&self.as_column_of(column)?)
    }

    /// `self[i, j] - column[i]`.
    pub fn sub_broadcast(&self, column: &Tensor) -> Result<Tensor> {
        self.sub(&self.as_column_of(column)?)
    }

    /// `column[i] - self[i, j]`.
    pub fn sub_broadcast_reversed(&self, column: &Tensor) -> Result<Tensor> {
        self.as_column_of(column)?.sub(self)
    }

    /// `self[i, j] * column[i]`.
    pub fn eltmul_broadcast(&self, column: &Tensor) -> Result<Tensor> {
        self.eltmul(&self.as_column_of(column)?)
    }

    /// `self[i, j] / column[i]`.
    pub fn eltdiv_broadcast(&self, column: &Tensor) -> Result<Tensor> {
        self.eltdiv(&self.as_column_of(column)?)
    }

    /// `self[i, j] * row[0, j]`.
    pub fn eltmul_broadcast_rowwise(&self, row: &Tensor) -> Result<Tensor> {
        self.check_row_of(row)?;
        self.eltmul(row)
    }

    /// `self[i, j] * other[j, i]`.
    pub fn eltmul_rowwise(&self, other: &Tensor) -> Result<Tensor> {
        self.eltmul(&other.transpose())
    }
}
