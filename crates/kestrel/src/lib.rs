//! # kestrel
//!
//! Reverse-mode automatic differentiation over lazily evaluated, device-aware
//! tensors.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kestrel::prelude::*;
//!
//! let x = Tensor::new(5, Init::uniform(20.0), DType::F32)?;
//! let mut solver = Sgd::new().with_step_size(0.5);
//! for _ in 0..100 {
//!     let error = x.l2_norm()?;
//!     error.grad()?;
//!     tape::backward()?;
//!     solver.step(&[x.clone()])?;
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `kestrel-core` | SynchronizedMemory, Array, lazy Expr, Tensor, gradient tape, initializers |
//! | `kestrel-optim` | Solvers (SGD, AdaGrad, RMSProp, RMSPropMomentum, AdaDelta, Adam) |
//!
//! ## Modules
//!
//! - [`npy`]: NumPy `.npy` load/save and parameter-list checkpoints

/// Re-export core types.
pub use kestrel_core::{
    choose_device, AssignOp, Array, DType, Device, Error, Expr, Freshness, HostBuffer, Init,
    Layout, MemoryId, NoBackprop, Result, Shape, Slice, SynchronizedMemory, TapeState, Tensor,
    WithDType,
};

/// Re-export core modules.
pub use kestrel_core::{config, gradcheck, lazy, linalg, random, tape};

/// Re-export solvers.
pub mod optim {
    pub use kestrel_optim::*;
}

/// NumPy `.npy` arrays.
pub mod npy;

/// Convenient imports for typical use.
///
/// ```rust,ignore
/// use kestrel::prelude::*;
/// ```
pub mod prelude {
    pub use crate::npy;
    pub use kestrel_core::{
        config, random, tape, Array, DType, Device, Error, Expr, Init, NoBackprop, Result, Shape,
        Slice, TapeState, Tensor,
    };
    pub use kestrel_optim::{
        clip_and_regularize, create_solver, AdaDelta, AdaGrad, Adam, RMSProp, RMSPropMomentum,
        Sgd, Solver,
    };
}
