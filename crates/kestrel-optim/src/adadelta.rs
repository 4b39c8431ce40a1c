use std::collections::HashMap;

use kestrel_core::{Array, Result, Tensor};

use crate::{clip_and_regularize, state_for, zeros_for, ParamKey, Solver};

/// AdaDelta (Zeiler, 2012): the step is the ratio of decaying RMS norms of
/// past updates and past gradients, so no learning rate is needed.
/// `step_size` multiplies the final update and defaults to 1.
///
/// ```text
/// gsum = rho * gsum + (1 - rho) * dw^2
/// dx   = -sqrt((xsum + smooth_eps) / (gsum + smooth_eps)) * dw
/// xsum = rho * xsum + (1 - rho) * dx^2
/// w   += step_size * dx
/// ```
#[derive(Debug)]
pub struct AdaDelta {
    pub step_size: f64,
    pub clip_norm: f64,
    pub regc: f64,
    pub smooth_eps: f64,
    pub rho: f64,
    states: HashMap<ParamKey, DeltaState>,
}

#[derive(Debug)]
struct DeltaState {
    gsum: Array,
    xsum: Array,
}

impl DeltaState {
    fn new(param: &Tensor) -> Result<Self> {
        Ok(DeltaState {
            gsum: zeros_for(param)?,
            xsum: zeros_for(param)?,
        })
    }
}

impl AdaDelta {
    pub fn new() -> Self {
        AdaDelta {
            step_size: 1.0,
            clip_norm: 5.0,
            regc: 0.0,
            smooth_eps: 1e-4,
            rho: 0.95,
            states: HashMap::new(),
        }
    }
}

impl Default for AdaDelta {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver for AdaDelta {
    fn step(&mut self, params: &[Tensor]) -> Result<()> {
        let (rho, eps) = (self.rho, self.smooth_eps);
        for param in params {
            clip_and_regularize(param, self.clip_norm, self.regc)?;
            let DeltaState { gsum, xsum } = &*state_for(&mut self.states, param, DeltaState::new)?;
            let dw = param.dw();
            gsum.set(gsum * rho + dw.expr().square() * (1.0 - rho))?;
            let dx = (-((xsum + eps) / (gsum + eps)).sqrt() * dw).eval(param.dtype())?;
            xsum.set(xsum * rho + dx.expr().square() * (1.0 - rho))?;
            param.w().add_assign(&dx * self.step_size)?;
            param.clear_grad()?;
        }
        Ok(())
    }

    fn reset_caches(&mut self, params: &[Tensor]) -> Result<()> {
        for param in params {
            if let Some(state) = self.states.get(&param.param_key()) {
                state.gsum.clear()?;
                state.xsum.clear()?;
            }
        }
        Ok(())
    }
}
