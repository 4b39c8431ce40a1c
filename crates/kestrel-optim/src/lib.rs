//! # kestrel-optim
//!
//! Solvers that update tensor parameters in place from their accumulated
//! gradients:
//!
//! 1. **SGD**: `w -= step * dw`
//! 2. **AdaGrad**: per-element step scaled by the running sum of squared gradients
//! 3. **RMSProp**: per-element step scaled by a decaying mean of squared gradients
//! 4. **RMSPropMomentum**: RMSProp on the centred second moment, plus momentum
//! 5. **AdaDelta**: unit-corrected steps from decaying gradient and update norms
//! 6. **Adam**: bias-corrected first and second moment estimates
//!
//! Every solver clips each parameter's gradient by norm and adds L2
//! regularization before its own update, and zeroes `dw` afterwards. Per
//! parameter state is created on first use and keyed by [`Tensor::param_key`],
//! so shallow copies sharing one `w` share their state too.

mod adadelta;
mod adagrad;
mod adam;
mod rmsprop;
mod rmsprop_momentum;
mod sgd;

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use kestrel_core::memory::MemoryId;
use kestrel_core::{Array, Error, Result, Tensor};

pub use adadelta::AdaDelta;
pub use adagrad::AdaGrad;
pub use adam::Adam;
pub use rmsprop::RMSProp;
pub use rmsprop_momentum::RMSPropMomentum;
pub use sgd::Sgd;

/// A parameter update rule.
pub trait Solver: Send {
    /// Update every parameter's `w` from its `dw`, then zero the `dw`.
    fn step(&mut self, params: &[Tensor]) -> Result<()>;

    /// Zero the per-parameter state kept for `params`.
    fn reset_caches(&mut self, params: &[Tensor]) -> Result<()>;
}

type ParamKey = (MemoryId, usize);

/// Scale `dw` down to norm `clip_norm` if it is longer (skipped when
/// `clip_norm <= 0`), then add `regc * w` (skipped when `regc <= 0`).
pub fn clip_and_regularize(param: &Tensor, clip_norm: f64, regc: f64) -> Result<()> {
    if clip_norm > 0.0 {
        let norm = param.dw().l2_norm()?;
        if norm > clip_norm {
            param.dw().mul_assign(clip_norm / norm)?;
        }
    }
    if regc > 0.0 {
        param.dw().add_assign(param.w() * regc)?;
    }
    Ok(())
}

/// A zero array shaped like `param`, on its preferred device.
fn zeros_for(param: &Tensor) -> Result<Array> {
    Array::zeros_on(
        param.shape().clone(),
        param.dtype(),
        param.w().memory().preferred_device(),
    )
}

/// The state for `param`, created with `init` on first use.
fn state_for<'a, S>(
    states: &'a mut HashMap<ParamKey, S>,
    param: &Tensor,
    init: impl FnOnce(&Tensor) -> Result<S>,
) -> Result<&'a mut S> {
    match states.entry(param.param_key()) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => Ok(entry.insert(init(param)?)),
    }
}

/// Build a solver from its case-insensitive name with the given step size
/// and default hyperparameters otherwise.
pub fn create_solver(name: &str, step_size: f64) -> Result<Box<dyn Solver>> {
    let solver: Box<dyn Solver> = match name.to_ascii_lowercase().as_str() {
        "sgd" => Box::new(Sgd::new().with_step_size(step_size)),
        "adagrad" => Box::new(AdaGrad::new().with_step_size(step_size)),
        "rmsprop" => Box::new(RMSProp::new().with_step_size(step_size)),
        "rmspropmomentum" => Box::new(RMSPropMomentum::new().with_step_size(step_size)),
        "adadelta" => Box::new(AdaDelta::new()),
        "adam" => Box::new(Adam::new().with_step_size(step_size)),
        _ => return Err(Error::msg(format!("unknown solver: {name}"))),
    };
    Ok(solver)
}
