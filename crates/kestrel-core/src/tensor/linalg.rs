use crate::error::Result;
use crate::lazy::AssignOp;
use crate::linalg;
use crate::tape;

use super::Tensor;

impl Tensor {
    /// Matrix product `[m, k] . [k, n] -> [m, n]`.
    ///
    /// Backward: `dA += dC . B^T`, `dB += A^T . dC`.
    pub fn dot(&self, other: &Tensor) -> Result<Tensor> {
        let w = linalg::dot(&self.w, &other.w)?;
        let out = Tensor::output(w, &[self, other])?;
        if Tensor::records(&[self, other]) {
            let (lhs, rhs, result) = (self.clone(), other.clone(), out.clone());
            tape::record(move || {
                if !lhs.constant {
                    linalg::dot_into(&lhs.dw, AssignOp::Add, &result.dw, &rhs.w.transpose())?;
                }
                if !rhs.constant {
                    linalg::dot_into(&rhs.dw, AssignOp::Add, &lhs.w.transpose(), &result.dw)?;
                }
                Ok(())
            });
        }
        Ok(out)
    }

    /// `left^T . weights . right`.
    pub fn quadratic_form(left: &Tensor, weights: &Tensor, right: &Tensor) -> Result<Tensor> {
        left.transpose().dot(weights)?.dot(right)
    }
}

#[cfg(test)]
mod tests {
    use crate::gradcheck::check_grad;
    use crate::{tape, DType, Error, Init, Result, Tensor};

    #[test]
    fn test_dot_forward() -> Result<()> {
        tape::scoped(|| {
            let a = Tensor::new((2, 3), Init::Arange, DType::F32)?;
            let b = Tensor::new((3, 2), Init::Arange, DType::F32)?;
            let c = a.dot(&b)?;
            assert_eq!(c.w().to_vec_f64()?, vec![10.0, 13.0, 28.0, 40.0]);
            assert!(matches!(a.dot(&a), Err(Error::DotShapeMismatch { .. })));
            tape::clear();
            Ok(())
        })
    }

    #[test]
    fn test_dot_gradients() -> Result<()> {
        let a = Tensor::from_vec(vec![0.5f64, -1.0, 2.0, 0.3, 1.1, -0.2], (2, 3))?;
        let b = Tensor::from_vec(vec![1.5f64, 0.7, -0.4, 2.2, 0.9, -1.3], (3, 2))?;
        check_grad(&a, |a| a.dot(&b)?.square()?.sum(), 1e-5, 1e-4)?;
        check_grad(&b, |b| a.dot(b)?.square()?.sum(), 1e-5, 1e-4)?;
        // transposed view as an operand
        check_grad(&a, |a| a.transpose().dot(&a.transpose().transpose())?.sum(), 1e-5, 1e-4)?;
        Ok(())
    }

    #[test]
    fn test_quadratic_form() -> Result<()> {
        let left = Tensor::from_vec(vec![1.0f64, 2.0], (2, 1))?;
        let weights = Tensor::from_vec(vec![1.0f64, 0.5, -1.0, 2.0], (2, 2))?;
        let right = Tensor::from_vec(vec![3.0f64, -1.0], (2, 1))?;
        tape::scoped(|| -> Result<()> {
            // [1, 2] . W = [-1, 4.5]; . [3, -1] = -7.5
            let q = Tensor::quadratic_form(&left, &weights, &right)?;
            assert_eq!(q.w().to_vec_f64()?, vec![-7.5]);
            tape::clear();
            Ok(())
        })?;
        check_grad(&weights, |w| Tensor::quadratic_form(&left, w, &right), 1e-5, 1e-4)?;
        check_grad(&left, |l| Tensor::quadratic_form(l, &weights, &right), 1e-5, 1e-4)?;
        Ok(())
    }
}
