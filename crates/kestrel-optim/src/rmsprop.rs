use std::collections::HashMap;

use kestrel_core::{Array, Result, Tensor};

use crate::{clip_and_regularize, state_for, zeros_for, ParamKey, Solver};

/// RMSProp: steps scaled by a decaying mean of squared gradients.
///
/// ```text
/// cache = decay * cache + (1 - decay) * dw^2
/// w    -= step_size * dw / sqrt(cache + smooth_eps)
/// ```
#[derive(Debug)]
pub struct RMSProp {
    pub step_size: f64,
    pub clip_norm: f64,
    pub regc: f64,
    pub smooth_eps: f64,
    pub decay_rate: f64,
    caches: HashMap<ParamKey, Array>,
}

impl RMSProp {
    pub fn new() -> Self {
        RMSProp {
            step_size: 0.01,
            clip_norm: 5.0,
            regc: 0.0,
            smooth_eps: 1e-6,
            decay_rate: 0.95,
            caches: HashMap::new(),
        }
    }

    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }
}

impl Default for RMSProp {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver for RMSProp {
    fn step(&mut self, params: &[Tensor]) -> Result<()> {
        let decay = self.decay_rate;
        for param in params {
            clip_and_regularize(param, self.clip_norm, self.regc)?;
            let cache = &*state_for(&mut self.caches, param, zeros_for)?;
            cache.set(cache * decay + param.dw().expr().square() * (1.0 - decay))?;
            param
                .w()
                .sub_assign(param.dw() * self.step_size / (cache.expr() + self.smooth_eps).sqrt())?;
            param.clear_grad()?;
        }
        Ok(())
    }

    fn reset_caches(&mut self, params: &[Tensor]) -> Result<()> {
        for param in params {
            if let Some(cache) = self.caches.get(&param.param_key()) {
                cache.clear()?;
            }
        }
        Ok(())
    }
}
