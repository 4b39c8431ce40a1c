use std::collections::HashMap;

use kestrel_core::{Array, Result, Tensor};

use crate::{clip_and_regularize, state_for, zeros_for, ParamKey, Solver};

/// RMSProp in Graves' form: normalize by the centred second moment and
/// smooth the resulting steps with momentum.
///
/// ```text
/// n     = decay * n + (1 - decay) * dw^2
/// g     = decay * g + (1 - decay) * dw
/// delta = momentum * delta - step_size * dw / sqrt(n - g^2 + smooth_eps)
/// w    += delta
/// ```
#[derive(Debug)]
pub struct RMSPropMomentum {
    pub step_size: f64,
    pub clip_norm: f64,
    pub regc: f64,
    pub smooth_eps: f64,
    pub decay_rate: f64,
    pub momentum: f64,
    states: HashMap<ParamKey, MomentumState>,
}

#[derive(Debug)]
struct MomentumState {
    n: Array,
    g: Array,
    delta: Array,
}

impl MomentumState {
    fn new(param: &Tensor) -> Result<Self> {
        Ok(MomentumState {
            n: zeros_for(param)?,
            g: zeros_for(param)?,
            delta: zeros_for(param)?,
        })
    }
}

impl RMSPropMomentum {
    pub fn new() -> Self {
        RMSPropMomentum {
            step_size: 0.01,
            clip_norm: 5.0,
            regc: 0.0,
            smooth_eps: 1e-4,
            decay_rate: 0.95,
            momentum: 0.9,
            states: HashMap::new(),
        }
    }

    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }
}

impl Default for RMSPropMomentum {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver for RMSPropMomentum {
    fn step(&mut self, params: &[Tensor]) -> Result<()> {
        let decay = self.decay_rate;
        for param in params {
            clip_and_regularize(param, self.clip_norm, self.regc)?;
            let MomentumState { n, g, delta } = &*state_for(&mut self.states, param, MomentumState::new)?;
            let dw = param.dw();
            n.set(n * decay + dw.expr().square() * (1.0 - decay))?;
            g.set(g * decay + dw * (1.0 - decay))?;
            let scale = (n - g.expr().square() + self.smooth_eps).sqrt();
            delta.set(delta * self.momentum - dw * self.step_size / scale)?;
            param.w().add_assign(delta)?;
            param.clear_grad()?;
        }
        Ok(())
    }

    fn reset_caches(&mut self, params: &[Tensor]) -> Result<()> {
        for param in params {
            if let Some(state) = self.states.get(&param.param_key()) {
                state.n.clear()?;
                state.g.clear()?;
                state.delta.clear()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_momentum_carries_previous_step() -> Result<()> {
        let param = Tensor::from_vec(vec![0.0f64], 1)?;
        let mut solver = RMSPropMomentum {
            step_size: 0.1,
            clip_norm: 0.0,
            smooth_eps: 0.0,
            decay_rate: 0.5,
            momentum: 0.5,
            ..RMSPropMomentum::new()
        };
        param.dw().set(1.0)?;
        solver.step(&[param.clone()])?;
        // n = 0.5, g = 0.5, sqrt(n - g^2) = 0.5: delta = -0.2
        assert!((param.w().get_flat(0)? + 0.2).abs() < 1e-12);

        // a zero gradient still moves by the remembered momentum
        solver.step(&[param.clone()])?;
        assert!((param.w().get_flat(0)? + 0.3).abs() < 1e-12);
        Ok(())
    }
}
