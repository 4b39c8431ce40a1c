//! Differentiable tensors.
//!
//! A [`Tensor`] pairs a value array `w` with a gradient array `dw` of the same
//! shape. Every operation computes its output's `w` eagerly (as one fused
//! lazy-expression pass) and, when the current thread's tape is recording and
//! at least one input is trainable, records a closure that later pushes the
//! output's `dw` back into the inputs' `dw`.
//!
//! ```ignore
//! let x = Tensor::new((3, 2), Init::gaussian(1.0), DType::F32)?;
//! let loss = x.square()?.sum()?;
//! loss.grad()?;
//! tape::backward()?;
//! // x.dw() now holds 2 * x.w()
//! ```

mod broadcast;
mod elementwise;
mod gather;
mod linalg;
mod reduce;
mod view;

use std::fmt;
use std::sync::Arc;

use crate::array::Array;
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::init::Init;
use crate::lazy::Expr;
use crate::memory::MemoryId;
use crate::shape::Shape;
use crate::tape;

/// A value array plus its gradient.
///
/// Cloning is shallow: the clone shares both `w` and `dw` with the original.
#[derive(Clone)]
pub struct Tensor {
    w: Array,
    dw: Array,
    constant: bool,
    name: Option<Arc<str>>,
}

impl Tensor {
    // Constructors

    pub fn new(shape: impl Into<Shape>, init: Init, dtype: DType) -> Result<Self> {
        Self::from_array(init.build(shape, dtype)?)
    }

    pub fn zeros(shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        Self::new(shape, Init::Zeros, dtype)
    }

    /// Wrap an existing value array; the gradient starts as lazy zeros.
    pub fn from_array(w: Array) -> Result<Self> {
        let dw = Array::zeros_on(w.shape().clone(), w.dtype(), w.memory().preferred_device())?;
        Ok(Tensor {
            w,
            dw,
            constant: false,
            name: None,
        })
    }

    pub fn from_vec<T: WithDType>(data: Vec<T>, shape: impl Into<Shape>) -> Result<Self> {
        Self::from_array(Array::from_vec(data, shape)?)
    }

    /// A rank-0 tensor.
    pub fn scalar(value: f64, dtype: DType) -> Result<Self> {
        Self::from_array(Array::scalar(value, dtype)?)
    }

    /// A tensor with its own gradient whose value either shares `other`'s
    /// memory (`share_value`) or is a copy of it. Sharing is what Hogwild
    /// workers use: updates to the shared `w` are seen by every copy while
    /// each keeps a private `dw`.
    pub fn from_tensor(other: &Tensor, share_value: bool) -> Result<Self> {
        let w = if share_value {
            other.w.clone()
        } else {
            other.w.copy()?
        };
        let mut tensor = Self::from_array(w)?;
        tensor.constant = other.constant;
        tensor.name = other.name.clone();
        Ok(tensor)
    }

    /// Another handle sharing both `w` and `dw`.
    pub fn shallow_copy(&self) -> Tensor {
        self.clone()
    }

    /// A view of this tensor's arrays with new layouts (no tape entry:
    /// gradients written into the view land in this tensor's `dw`).
    fn view(&self, w: Array, dw: Array) -> Tensor {
        Tensor {
            w,
            dw,
            constant: self.constant,
            name: None,
        }
    }

    // Accessors

    pub fn w(&self) -> &Array {
        &self.w
    }

    pub fn dw(&self) -> &Array {
        &self.dw
    }

    pub fn shape(&self) -> &Shape {
        self.w.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.w.dims()
    }

    pub fn rank(&self) -> usize {
        self.w.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.w.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.w.dtype()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: impl Into<Arc<str>>) {
        self.name = Some(name.into());
    }

    pub fn is_constant(&self) -> bool {
        self.constant
    }

    pub fn set_constant(&mut self, constant: bool) {
        self.constant = constant;
    }

    /// A handle on the same arrays that operations treat as constant, so no
    /// gradient flows into it.
    pub fn consider_constant(&self) -> Tensor {
        let mut tensor = self.clone();
        tensor.constant = true;
        tensor
    }

    /// Identity of the value buffer this tensor views, used to key
    /// per-parameter solver state.
    pub fn param_key(&self) -> (MemoryId, usize) {
        (self.w.memory_id(), self.w.offset())
    }

    /// Whether the value contains a NaN.
    pub fn is_nan(&self) -> Result<bool> {
        Ok(self.w.to_vec_f64()?.iter().any(|v| v.is_nan()))
    }

    /// Whether the gradient contains a NaN.
    pub fn is_grad_nan(&self) -> Result<bool> {
        Ok(self.dw.to_vec_f64()?.iter().any(|v| v.is_nan()))
    }

    // Gradients

    /// Seed the gradient of a one-element tensor: `dw += 1`.
    pub fn grad(&self) -> Result<()> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        self.dw.add_assign(1.0)
    }

    /// Zero the gradient (lazily when it spans its buffer).
    pub fn clear_grad(&self) -> Result<()> {
        self.dw.clear()
    }

    // Plumbing shared by the operation files

    /// The output tensor of an operation on `inputs`: constant exactly when
    /// every input is.
    fn output(w: Array, inputs: &[&Tensor]) -> Result<Tensor> {
        let mut out = Tensor::from_array(w)?;
        out.constant = inputs.iter().all(|t| t.constant);
        Ok(out)
    }

    /// Whether an operation on `inputs` should record a backward closure.
    fn records(inputs: &[&Tensor]) -> bool {
        tape::is_recording() && inputs.iter().any(|t| !t.constant)
    }
}

/// `target.dw += grad` unless `target` is constant.
fn accumulate(target: &Tensor, grad: impl Into<Expr>) -> Result<()> {
    if target.constant {
        return Ok(());
    }
    target.dw.add_assign(grad)
}

/// Sum `grad` over the axes along which `shape` was broadcast to produce it.
fn reduce_to_shape(grad: Expr, shape: &Shape) -> Result<Expr> {
    let grad_shape = grad.shape()?;
    if &grad_shape == shape {
        return Ok(grad);
    }
    let mut expr = grad;
    let lead = grad_shape.rank() - shape.rank();
    for _ in 0..lead {
        expr = expr.sum_axis(0, false);
    }
    for (d, &size) in shape.dims().iter().enumerate() {
        if size == 1 && grad_shape.dims()[d + lead] != 1 {
            expr = expr.sum_axis(d, true);
        }
    }
    Ok(expr)
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(name={:?}, shape={}, dtype={}, constant={}, w={:?})",
            self.name, self.w.shape(), self.w.dtype(), self.constant, self.w,
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{name} = ")?;
        }
        write!(f, "{}", self.w)
    }
}
