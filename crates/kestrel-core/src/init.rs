use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::array::Array;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::random;
use crate::shape::Shape;

/// How a new tensor's values are initialized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// All zeros, allocated lazily on first use.
    Zeros,
    Ones,
    /// Uniform in `[lower, upper)`; `lower == upper` fills with that value.
    Uniform { lower: f64, upper: f64 },
    Gaussian { mean: f64, std: f64 },
    /// 0, 1, 2, ... in row-major order.
    Arange,
    Fill(f64),
    /// `diag` on the main diagonal of a matrix, zeros elsewhere.
    Eye(f64),
}

impl Init {
    /// Symmetric uniform initializer in `[-bound, bound)`.
    pub fn uniform(bound: f64) -> Init {
        Init::Uniform {
            lower: -bound,
            upper: bound,
        }
    }

    pub fn gaussian(std: f64) -> Init {
        Init::Gaussian { mean: 0.0, std }
    }

    /// A new array of `shape` initialized this way.
    pub fn build(&self, shape: impl Into<Shape>, dtype: DType) -> Result<Array> {
        let shape = shape.into();
        match *self {
            Init::Zeros => Array::zeros(shape, dtype),
            Init::Ones => Array::ones(shape, dtype),
            Init::Fill(value) => Array::full(shape, value, dtype),
            Init::Arange => Array::arange(shape, dtype),
            Init::Uniform { lower, upper } => {
                if lower.is_nan() || upper.is_nan() || lower > upper {
                    return Err(Error::InvalidInitializer(format!(
                        "uniform bounds [{lower}, {upper}) are empty"
                    )));
                }
                if lower == upper {
                    return Array::full(shape, lower, dtype);
                }
                let values: Vec<f64> = random::with_rng(|rng| {
                    (0..shape.elem_count())
                        .map(|_| rng.gen_range(lower..upper))
                        .collect()
                });
                Array::from_f64(&values, shape, dtype)
            }
            Init::Gaussian { mean, std } => {
                let normal = Normal::new(mean, std).map_err(|e| {
                    Error::InvalidInitializer(format!("gaussian({mean}, {std}): {e}"))
                })?;
                let values: Vec<f64> = random::with_rng(|rng| {
                    (0..shape.elem_count())
                        .map(|_| normal.sample(rng))
                        .collect()
                });
                Array::from_f64(&values, shape, dtype)
            }
            Init::Eye(diag) => {
                let (rows, cols) = match shape.dims() {
                    [rows, cols] => (*rows, *cols),
                    _ => {
                        return Err(Error::InvalidInitializer(format!(
                            "eye needs a matrix, got shape {shape}"
                        )))
                    }
                };
                let mut values = vec![0.0; rows * cols];
                for i in 0..rows.min(cols) {
                    values[i * cols + i] = diag;
                }
                Array::from_f64(&values, shape, dtype)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_within_bounds() -> Result<()> {
        random::set_seed(5000);
        let x = Init::Uniform {
            lower: -0.5,
            upper: 2.0,
        }
        .build((10, 10), DType::F64)?;
        assert!(x.min()? >= -0.5);
        assert!(x.max()? < 2.0);
        Ok(())
    }

    #[test]
    fn test_degenerate_and_invalid_uniform() -> Result<()> {
        let x = Init::Uniform {
            lower: 3.0,
            upper: 3.0,
        }
        .build(4, DType::F32)?;
        assert_eq!(x.to_vec_f64()?, vec![3.0; 4]);
        assert!(matches!(
            Init::Uniform {
                lower: 1.0,
                upper: 0.0
            }
            .build(4, DType::F32),
            Err(Error::InvalidInitializer(_))
        ));
        Ok(())
    }

    #[test]
    fn test_gaussian_rejects_negative_std() {
        assert!(matches!(
            Init::gaussian(-1.0).build(4, DType::F32),
            Err(Error::InvalidInitializer(_))
        ));
    }

    #[test]
    fn test_gaussian_is_seeded() -> Result<()> {
        random::set_seed(7);
        let a = Init::gaussian(1.0).build(8, DType::F64)?;
        random::set_seed(7);
        let b = Init::gaussian(1.0).build(8, DType::F64)?;
        assert!(a.equals(&b)?);
        Ok(())
    }

    #[test]
    fn test_eye() -> Result<()> {
        let x = Init::Eye(2.0).build((2, 3), DType::F32)?;
        assert_eq!(x.to_vec_f64()?, vec![2.0, 0.0, 0.0, 0.0, 2.0, 0.0]);
        assert!(Init::Eye(1.0).build(3, DType::F32).is_err());
        Ok(())
    }

    #[test]
    fn test_zeros_stay_lazy() -> Result<()> {
        let x = Init::Zeros.build((3, 3), DType::F32)?;
        assert!(!x.memory().is_any_allocated()?);
        Ok(())
    }
}
