use crate::array::Array;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tape;

use super::Tensor;

// Index-based gathers copy the selected values into a new tensor; backward
// scatters the output gradient back additively, so repeated indices
// accumulate.

impl Tensor {
    fn check_index(&self, axis: usize, index: usize) -> Result<()> {
        let size = self.shape().dim(axis)?;
        if index >= size {
            return Err(Error::IndexOutOfRange { index, axis, size });
        }
        Ok(())
    }

    /// Rows `indices[0], indices[1], ...` of `self` stacked along a new
    /// first axis.
    pub fn rows_pluck(&self, indices: &[usize]) -> Result<Tensor> {
        for &row in indices {
            self.check_index(0, row)?;
        }
        let shape = self.shape().remove_dim(0)?.insert_dim(0, indices.len())?;
        let w = Array::zeros(shape, self.dtype())?;
        for (i, &row) in indices.iter().enumerate() {
            w.pluck_axis(0, i)?.set(&self.w.pluck_axis(0, row)?)?;
        }
        let out = Tensor::output(w, &[self])?;
        if Tensor::records(&[self]) {
            let (input, result) = (self.clone(), out.clone());
            let indices = indices.to_vec();
            tape::record(move || {
                for (i, &row) in indices.iter().enumerate() {
                    input
                        .dw
                        .pluck_axis(0, row)?
                        .add_assign(&result.dw.pluck_axis(0, i)?)?;
                }
                Ok(())
            });
        }
        Ok(out)
    }

    /// The elements `self[rows[i], cols[i]]` of a matrix as a vector.
    pub fn rows_cols_pluck(&self, rows: &[usize], cols: &[usize]) -> Result<Tensor> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        if rows.len() != cols.len() {
            return Err(Error::ShapeMismatch {
                expected: Shape::from(rows.len()),
                got: Shape::from(cols.len()),
            });
        }
        let mut values = Vec::with_capacity(rows.len());
        for (&r, &c) in rows.iter().zip(cols) {
            self.check_index(0, r)?;
            self.check_index(1, c)?;
            values.push(self.w.get(&[r, c])?);
        }
        let w = Array::from_f64(&values, rows.len(), self.dtype())?;
        let out = Tensor::output(w, &[self])?;
        if Tensor::records(&[self]) {
            let (input, result) = (self.clone(), out.clone());
            let pairs: Vec<(usize, usize)> = rows.iter().copied().zip(cols.iter().copied()).collect();
            tape::record(move || {
                if input.constant {
                    return Ok(());
                }
                let grads = result.dw.to_vec_f64()?;
                for (&(r, c), g) in pairs.iter().zip(grads) {
                    input.dw.add_at(&[r, c], g)?;
                }
                Ok(())
            });
        }
        Ok(out)
    }

    // Index queries on the value; not differentiable.

    /// Row-major position of the largest value (lowest on ties).
    pub fn argmax(&self) -> Result<usize> {
        self.w.argmax()
    }

    pub fn argmin(&self) -> Result<usize> {
        self.w.argmin()
    }

    pub fn argmax_axis(&self, axis: usize) -> Result<Vec<usize>> {
        self.w.argmax_axis(axis)
    }

    pub fn argmin_axis(&self, axis: usize) -> Result<Vec<usize>> {
        self.w.argmin_axis(axis)
    }

    /// Position of the largest value among row-major positions
    /// `lower..upper`.
    pub fn argmax_slice(&self, lower: usize, upper: usize) -> Result<usize> {
        self.w.argmax_slice(lower, upper)
    }
}

#[cfg(test)]
mod tests {
    use crate::gradcheck::check_grad;
    use crate::{tape, DType, Error, Init, Result, Tensor};

    #[test]
    fn test_rows_pluck_copies_and_scatters() -> Result<()> {
        tape::scoped(|| {
            let embeddings = Tensor::new((4, 2), Init::Arange, DType::F32)?;
            let picked = embeddings.rows_pluck(&[3, 1, 3])?;
            assert_eq!(picked.dims(), &[3, 2]);
            assert_eq!(picked.w().to_vec_f64()?, vec![6.0, 7.0, 2.0, 3.0, 6.0, 7.0]);
            assert!(!picked.w().shares_memory(embeddings.w()));

            picked.sum()?.grad()?;
            tape::backward()?;
            assert_eq!(
                embeddings.dw().to_vec_f64()?,
                vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 2.0, 2.0]
            );
            Ok(())
        })
    }

    #[test]
    fn test_rows_cols_pluck() -> Result<()> {
        let x = Tensor::from_vec(vec![0.4f64, -1.1, 0.9, 2.0, 0.1, -0.6], (2, 3))?;
        tape::scoped(|| -> Result<()> {
            let picked = x.rows_cols_pluck(&[1, 0, 1], &[0, 2, 0])?;
            assert_eq!(picked.w().to_vec_f64()?, vec![2.0, 0.9, 2.0]);
            tape::clear();
            Ok(())
        })?;
        check_grad(&x, |x| x.rows_cols_pluck(&[1, 0, 1], &[0, 2, 0])?.square()?.sum(), 1e-5, 1e-4)?;
        check_grad(&x, |x| x.rows_pluck(&[1, 1, 0])?.exp()?.sum(), 1e-5, 1e-4)?;
        Ok(())
    }

    #[test]
    fn test_gather_bounds() -> Result<()> {
        let x = Tensor::zeros((2, 3), DType::F32)?;
        assert!(matches!(x.rows_pluck(&[2]), Err(Error::IndexOutOfRange { index: 2, .. })));
        assert!(matches!(
            x.rows_cols_pluck(&[0], &[3]),
            Err(Error::IndexOutOfRange { axis: 1, .. })
        ));
        assert!(matches!(
            x.rows_cols_pluck(&[0, 1], &[0]),
            Err(Error::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_index_queries() -> Result<()> {
        let x = Tensor::from_vec(vec![1.0f32, 5.0, 5.0, -2.0, 0.0, 3.0], (2, 3))?;
        assert_eq!(x.argmax()?, 1);
        assert_eq!(x.argmin()?, 3);
        assert_eq!(x.argmax_axis(1)?, vec![1, 2]);
        assert_eq!(x.argmin_axis(0)?, vec![1, 1, 1]);
        assert_eq!(x.argmax_slice(3, 6)?, 5);
        assert!(x.argmax_slice(4, 4).is_err());
        Ok(())
    }
}
