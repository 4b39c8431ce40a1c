//! # kestrel-core
//!
//! Synchronized memory, lazy expressions, differentiable tensors and the
//! gradient tape for kestrel.
//!
//! This crate provides:
//! - [`SynchronizedMemory`]: a buffer mirrored on CPU and GPU with freshness
//!   tracking and lazy zero allocation
//! - [`Array`]: a shaped, strided view over synchronized memory
//! - [`Expr`]: lazy elementwise/reduction expressions evaluated in one fused
//!   pass on the device chosen from the participants' freshness
//! - [`Tensor`]: value `w` plus gradient `dw`, with differentiable operations
//! - [`tape`]: the per-thread gradient tape and the [`NoBackprop`] guard
// - DType: f32, f64, i32 element types
// - Shape/Layout/Slice: shapes, strides, offsets and python-style slices
// - device/config: device enum, the pure device choice, process-wide preference
// - linalg: host matrix products via gemm
// - init/random: initializers and per-thread seeding
// - gradcheck: finite-difference gradient checking

pub mod array;
pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
pub mod gradcheck;
pub mod init;
pub mod layout;
pub mod lazy;
pub mod linalg;
pub mod memory;
pub mod random;
pub mod shape;
pub mod slice;
pub mod tape;
pub mod tensor;

#[cfg(feature = "cuda")]
mod cuda;

pub use array::Array;
pub use device::{choose_device, Device, Freshness};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use init::Init;
pub use layout::Layout;
pub use lazy::{AssignOp, Expr};
pub use memory::{HostBuffer, MemoryId, SynchronizedMemory};
pub use shape::Shape;
pub use slice::Slice;
pub use tape::{NoBackprop, TapeState};
pub use tensor::Tensor;
