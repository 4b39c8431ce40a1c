//! Stochastic gradient descent.

use kestrel_core::{Result, Tensor};

use crate::{clip_and_regularize, Solver};

/// Plain gradient descent: `w -= step_size * dw`.
#[derive(Debug, Clone)]
pub struct Sgd {
    pub step_size: f64,
    /// Per-parameter gradient norm cap; `0` disables clipping.
    pub clip_norm: f64,
    /// L2 regularization strength.
    pub regc: f64,
}

impl Sgd {
    pub fn new() -> Self {
        Sgd {
            step_size: 0.01,
            clip_norm: 5.0,
            regc: 0.0,
        }
    }

    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }
}

impl Default for Sgd {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver for Sgd {
    fn step(&mut self, params: &[Tensor]) -> Result<()> {
        for param in params {
            clip_and_regularize(param, self.clip_norm, self.regc)?;
            param.w().sub_assign(param.dw() * self.step_size)?;
            param.clear_grad()?;
        }
        Ok(())
    }

    fn reset_caches(&mut self, _params: &[Tensor]) -> Result<()> {
        Ok(())
    }
}
