use std::collections::HashMap;

use kestrel_core::{Array, Result, Tensor};

use crate::{clip_and_regularize, state_for, zeros_for, ParamKey, Solver};

/// Adam optimizer (Adaptive Moment Estimation).
///
/// ```text
/// m    = b1 * m + (1 - b1) * dw
/// v    = b2 * v + (1 - b2) * dw^2
/// lr_t = step_size * sqrt(1 - b2^t) / (1 - b1^t)
/// w   -= lr_t * m / (sqrt(v) + smooth_eps)
/// ```
///
/// `t` counts calls to `step`, starting at 1.
#[derive(Debug)]
pub struct Adam {
    pub step_size: f64,
    pub clip_norm: f64,
    pub regc: f64,
    pub smooth_eps: f64,
    /// Decay rate of the first moment estimate.
    pub b1: f64,
    /// Decay rate of the second moment estimate.
    pub b2: f64,
    epoch: u64,
    moments: HashMap<ParamKey, Moments>,
}

#[derive(Debug)]
struct Moments {
    m: Array,
    v: Array,
}

impl Moments {
    fn new(param: &Tensor) -> Result<Self> {
        Ok(Moments {
            m: zeros_for(param)?,
            v: zeros_for(param)?,
        })
    }
}

impl Adam {
    pub fn new() -> Self {
        Adam {
            step_size: 0.001,
            clip_norm: 5.0,
            regc: 0.0,
            smooth_eps: 1e-8,
            b1: 0.9,
            b2: 0.999,
            epoch: 0,
            moments: HashMap::new(),
        }
    }

    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }

    /// Number of completed `step` calls.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver for Adam {
    fn step(&mut self, params: &[Tensor]) -> Result<()> {
        self.epoch += 1;
        let (b1, b2) = (self.b1, self.b2);
        let t = self.epoch as i32;
        let lr_t = self.step_size * (1.0 - b2.powi(t)).sqrt() / (1.0 - b1.powi(t));
        for param in params {
            clip_and_regularize(param, self.clip_norm, self.regc)?;
            let Moments { m, v } = &*state_for(&mut self.moments, param, Moments::new)?;
            let dw = param.dw();
            m.set(m * b1 + dw * (1.0 - b1))?;
            v.set(v * b2 + dw.expr().square() * (1.0 - b2))?;
            param
                .w()
                .sub_assign(m * lr_t / (v.expr().sqrt() + self.smooth_eps))?;
            param.clear_grad()?;
        }
        Ok(())
    }

    fn reset_caches(&mut self, params: &[Tensor]) -> Result<()> {
        for param in params {
            if let Some(moments) = self.moments.get(&param.param_key()) {
                moments.m.clear()?;
                moments.v.clear()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_adam_step_moves_by_step_size() -> Result<()> {
        // with bias correction the first update is step_size * sign(dw)
        let param = Tensor::from_vec(vec![1.0f64, 2.0], 2)?;
        param.dw().set(&Array::from_vec(vec![0.1f64, -3.0], 2)?)?;
        let mut solver = Adam {
            step_size: 0.1,
            clip_norm: 0.0,
            ..Adam::new()
        };
        solver.step(&[param.clone()])?;
        assert_eq!(solver.epoch(), 1);
        let expected = Array::from_vec(vec![0.9f64, 2.1], 2)?;
        assert!(param.w().allclose(&expected, 1e-6)?);
        Ok(())
    }

    #[test]
    fn test_params_moving_in_direction_opposite_to_gradient() -> Result<()> {
        let param = Tensor::from_vec(vec![10.0f64], 1)?;
        let mut solver = Adam::new().with_step_size(0.5);
        for _ in 0..10 {
            let x = param.w().get_flat(0)?;
            param.dw().set(2.0 * x)?;
            solver.step(&[param.clone()])?;
        }
        assert!(param.w().get_flat(0)?.abs() < 10.0);
        Ok(())
    }
}
