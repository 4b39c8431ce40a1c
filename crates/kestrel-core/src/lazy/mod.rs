//! Lazy expressions.
//!
//! An [`Expr`] is an unevaluated tree of elementwise and reduction operations
//! whose leaves are [`Array`]s and scalars. Nothing is computed (and no
//! result buffer exists) until the tree is assigned into a destination array
//! with [`Array::assign`], at which point the whole tree runs as one pass on
//! one device.
//!
//! ```ignore
//! let y = Array::zeros((3, 2), DType::F32)?;
//! y.set(13.0)?;
//! y.add_assign((&x * 2.0).exp() + 1.0)?;
//! ```

mod cpu;
mod eval;
#[cfg(feature = "cuda")]
mod gpu;

use std::fmt;
use std::sync::Arc;

use crate::array::Array;
use crate::device::Device;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::memory::SynchronizedMemory;
use crate::shape::Shape;

pub(crate) use eval::{assign, assign_any_dtype};
pub use cpu::PAR_THRESHOLD;

/// Elementwise functions of one argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Identity,
    Neg,
    Abs,
    /// -1, 0 or 1.
    Sign,
    Exp,
    Log,
    /// `log(x)` for positive `x`, 0 otherwise.
    LogOrZero,
    Sqrt,
    Square,
    /// `1 / x`.
    Inv,
    Sigmoid,
    /// `1 / (1 + exp(-k x))`.
    SteepSigmoid(f64),
    Tanh,
    Relu,
    /// `log(1 + exp(x))`.
    Softplus,
    /// `x^p`.
    Pow(f64),
}

impl UnaryOp {
    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            UnaryOp::Identity => x,
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Sign => {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    // keeps NaN as NaN
                    x * 0.0
                }
            }
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::LogOrZero => {
                if x > 0.0 {
                    x.ln()
                } else {
                    0.0
                }
            }
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Square => x * x,
            UnaryOp::Inv => 1.0 / x,
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::SteepSigmoid(k) => 1.0 / (1.0 + (-k * x).exp()),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Relu => {
                if x < 0.0 {
                    0.0
                } else {
                    x
                }
            }
            UnaryOp::Softplus => {
                if x > 20.0 {
                    x
                } else {
                    x.exp().ln_1p()
                }
            }
            UnaryOp::Pow(p) => x.powf(p),
        }
    }
}

/// Elementwise functions of two (broadcast) arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Max,
    Min,
    /// 1.0 where equal, 0.0 elsewhere.
    Eq,
}

impl BinaryOp {
    #[inline]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Max => {
                if a >= b {
                    a
                } else if a < b {
                    b
                } else {
                    f64::NAN
                }
            }
            BinaryOp::Min => {
                if a <= b {
                    a
                } else if a > b {
                    b
                } else {
                    f64::NAN
                }
            }
            BinaryOp::Eq => {
                if a == b {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Reductions, over everything or along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

impl ReduceOp {
    pub fn init(self) -> f64 {
        match self {
            ReduceOp::Sum | ReduceOp::Mean => 0.0,
            ReduceOp::Max => f64::NEG_INFINITY,
            ReduceOp::Min => f64::INFINITY,
        }
    }

    #[inline]
    pub fn combine(self, acc: f64, x: f64) -> f64 {
        match self {
            ReduceOp::Sum | ReduceOp::Mean => acc + x,
            ReduceOp::Max => BinaryOp::Max.apply(acc, x),
            ReduceOp::Min => BinaryOp::Min.apply(acc, x),
        }
    }

    pub fn finish(self, acc: f64, count: usize) -> f64 {
        match self {
            ReduceOp::Mean => acc / count as f64,
            ReduceOp::Sum | ReduceOp::Max | ReduceOp::Min => acc,
        }
    }
}

/// How an evaluated expression is combined with the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssignOp {
    /// `=`
    Set,
    /// `+=`
    Add,
    /// `-=`
    Sub,
    /// `*=`
    Mul,
    /// `/=`
    Div,
}

impl AssignOp {
    #[inline]
    pub fn apply(self, old: f64, value: f64) -> f64 {
        match self {
            AssignOp::Set => value,
            AssignOp::Add => old + value,
            AssignOp::Sub => old - value,
            AssignOp::Mul => old * value,
            AssignOp::Div => old / value,
        }
    }
}

/// A lazy expression tree.
///
/// The enum is closed: every traversal (`unfold`, shape inference, each
/// device lowering) matches all variants without a wildcard arm, so adding a
/// node kind does not compile until each traversal handles it.
#[derive(Clone)]
pub enum Expr {
    Leaf(Array),
    /// A constant broadcast to every position. Not a participant.
    Scalar(f64),
    Unary {
        op: UnaryOp,
        arg: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Reduce all elements to a rank-0 result.
    Reduce {
        op: ReduceOp,
        arg: Box<Expr>,
    },
    /// Reduce along one axis.
    AxisReduce {
        op: ReduceOp,
        axis: usize,
        keep_dims: bool,
        arg: Box<Expr>,
    },
}

impl Expr {
    pub fn scalar(value: f64) -> Expr {
        Expr::Scalar(value)
    }

    pub fn unary(self, op: UnaryOp) -> Expr {
        Expr::Unary {
            op,
            arg: Box::new(self),
        }
    }

    pub fn binary(self, op: BinaryOp, rhs: impl Into<Expr>) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(self),
            rhs: Box::new(rhs.into()),
        }
    }

    pub fn reduce(self, op: ReduceOp) -> Expr {
        Expr::Reduce {
            op,
            arg: Box::new(self),
        }
    }

    pub fn reduce_axis(self, op: ReduceOp, axis: usize, keep_dims: bool) -> Expr {
        Expr::AxisReduce {
            op,
            axis,
            keep_dims,
            arg: Box::new(self),
        }
    }

    /// Fold `step` over every array leaf, left to right, through any nesting
    /// of nodes. Scalars are skipped.
    pub fn unfold<S, F>(&self, state: S, step: &mut F) -> S
    where
        F: FnMut(S, &Array) -> S,
    {
        match self {
            Expr::Leaf(array) => step(state, array),
            Expr::Scalar(_) => state,
            Expr::Unary { arg, .. } => arg.unfold(state, step),
            Expr::Binary { lhs, rhs, .. } => {
                let state = lhs.unfold(state, step);
                rhs.unfold(state, step)
            }
            Expr::Reduce { arg, .. } => arg.unfold(state, step),
            Expr::AxisReduce { arg, .. } => arg.unfold(state, step),
        }
    }

    /// Distinct memory buffers read by this expression, in first-seen order.
    pub fn participants(&self) -> Vec<Arc<SynchronizedMemory>> {
        self.unfold(Vec::new(), &mut |mut acc: Vec<Arc<SynchronizedMemory>>, array| {
            if !acc.iter().any(|m| Arc::ptr_eq(m, array.memory())) {
                acc.push(Arc::clone(array.memory()));
            }
            acc
        })
    }

    /// The dtype shared by all leaves, `None` for a leaf-free expression.
    pub fn dtype(&self) -> Result<Option<DType>> {
        self.unfold(Ok(None), &mut |acc: Result<Option<DType>>, array| {
            match acc? {
                None => Ok(Some(array.dtype())),
                Some(dtype) if dtype == array.dtype() => Ok(Some(dtype)),
                Some(dtype) => Err(Error::DTypeMismatch {
                    expected: dtype,
                    got: array.dtype(),
                }),
            }
        })
    }

    /// The shape this expression evaluates to.
    pub fn shape(&self) -> Result<Shape> {
        match self {
            Expr::Leaf(array) => Ok(array.shape().clone()),
            Expr::Scalar(_) => Ok(Shape::scalar()),
            Expr::Unary { arg, .. } => arg.shape(),
            Expr::Binary { lhs, rhs, .. } => Shape::broadcast_shape(&lhs.shape()?, &rhs.shape()?),
            Expr::Reduce { arg, .. } => {
                arg.shape()?;
                Ok(Shape::scalar())
            }
            Expr::AxisReduce {
                axis,
                keep_dims,
                arg,
                ..
            } => {
                let shape = arg.shape()?;
                if *keep_dims {
                    shape.dim(*axis)?;
                    let mut dims = shape.dims().to_vec();
                    dims[*axis] = 1;
                    Ok(Shape::new(dims))
                } else {
                    shape.remove_dim(*axis)
                }
            }
        }
    }

    /// Evaluate into a fresh contiguous array of this expression's shape.
    pub fn eval(&self, dtype: DType) -> Result<Array> {
        let out = Array::zeros(self.shape()?, dtype)?;
        out.set(self.clone())?;
        Ok(out)
    }

    /// Evaluate a one-element expression and read it back on the host.
    pub fn eval_scalar(&self) -> Result<f64> {
        let shape = self.shape()?;
        if shape.elem_count() != 1 {
            return Err(Error::NotAScalar { shape });
        }
        let out = Array::zeros_on(shape, DType::F64, Device::Cpu)?;
        assign_any_dtype(&out, AssignOp::Set, self.clone())?;
        out.get_flat(0)
    }

    // Builders, named after what they compute.

    pub fn neg(self) -> Expr {
        self.unary(UnaryOp::Neg)
    }
    pub fn abs(self) -> Expr {
        self.unary(UnaryOp::Abs)
    }
    pub fn sign(self) -> Expr {
        self.unary(UnaryOp::Sign)
    }
    pub fn exp(self) -> Expr {
        self.unary(UnaryOp::Exp)
    }
    pub fn log(self) -> Expr {
        self.unary(UnaryOp::Log)
    }
    pub fn log_or_zero(self) -> Expr {
        self.unary(UnaryOp::LogOrZero)
    }
    pub fn sqrt(self) -> Expr {
        self.unary(UnaryOp::Sqrt)
    }
    pub fn square(self) -> Expr {
        self.unary(UnaryOp::Square)
    }
    pub fn inv(self) -> Expr {
        self.unary(UnaryOp::Inv)
    }
    pub fn sigmoid(self) -> Expr {
        self.unary(UnaryOp::Sigmoid)
    }
    pub fn steep_sigmoid(self, aggressiveness: f64) -> Expr {
        self.unary(UnaryOp::SteepSigmoid(aggressiveness))
    }
    pub fn tanh(self) -> Expr {
        self.unary(UnaryOp::Tanh)
    }
    pub fn relu(self) -> Expr {
        self.unary(UnaryOp::Relu)
    }
    pub fn softplus(self) -> Expr {
        self.unary(UnaryOp::Softplus)
    }
    pub fn powf(self, exponent: f64) -> Expr {
        self.unary(UnaryOp::Pow(exponent))
    }
    pub fn pow(self, exponent: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Pow, exponent)
    }
    pub fn maximum(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Max, rhs)
    }
    pub fn minimum(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Min, rhs)
    }
    pub fn eq_mask(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Eq, rhs)
    }
    pub fn sum(self) -> Expr {
        self.reduce(ReduceOp::Sum)
    }
    pub fn mean(self) -> Expr {
        self.reduce(ReduceOp::Mean)
    }
    pub fn max(self) -> Expr {
        self.reduce(ReduceOp::Max)
    }
    pub fn min(self) -> Expr {
        self.reduce(ReduceOp::Min)
    }
    pub fn sum_axis(self, axis: usize, keep_dims: bool) -> Expr {
        self.reduce_axis(ReduceOp::Sum, axis, keep_dims)
    }
    pub fn mean_axis(self, axis: usize, keep_dims: bool) -> Expr {
        self.reduce_axis(ReduceOp::Mean, axis, keep_dims)
    }
    pub fn max_axis(self, axis: usize, keep_dims: bool) -> Expr {
        self.reduce_axis(ReduceOp::Max, axis, keep_dims)
    }
    pub fn min_axis(self, axis: usize, keep_dims: bool) -> Expr {
        self.reduce_axis(ReduceOp::Min, axis, keep_dims)
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Leaf(array) => write!(f, "{:?}", array),
            Expr::Scalar(v) => write!(f, "{}", v),
            Expr::Unary { op, arg } => write!(f, "{:?}({:?})", op, arg),
            Expr::Binary { op, lhs, rhs } => write!(f, "{:?}({:?}, {:?})", op, lhs, rhs),
            Expr::Reduce { op, arg } => write!(f, "{:?}[all]({:?})", op, arg),
            Expr::AxisReduce {
                op,
                axis,
                keep_dims,
                arg,
            } => write!(
                f,
                "{:?}[axis={}, keep_dims={}]({:?})",
                op, axis, keep_dims, arg
            ),
        }
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::Scalar(v)
    }
}

impl From<f32> for Expr {
    fn from(v: f32) -> Self {
        Expr::Scalar(v as f64)
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::Scalar(v as f64)
    }
}

impl From<Array> for Expr {
    fn from(a: Array) -> Self {
        Expr::Leaf(a)
    }
}

impl From<&Array> for Expr {
    fn from(a: &Array) -> Self {
        Expr::Leaf(a.clone())
    }
}

impl From<&Expr> for Expr {
    fn from(e: &Expr) -> Self {
        e.clone()
    }
}

// Operator sugar: `Expr op X`, `&Array op X` and `f64 op Expr/&Array` all
// build a Binary node.
macro_rules! expr_binary_ops {
    ($($trait:ident, $method:ident, $op:expr;)*) => {$(
        impl<R: Into<Expr>> std::ops::$trait<R> for Expr {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                self.binary($op, rhs)
            }
        }

        impl<R: Into<Expr>> std::ops::$trait<R> for &Array {
            type Output = Expr;
            fn $method(self, rhs: R) -> Expr {
                Expr::from(self).binary($op, rhs)
            }
        }

        impl std::ops::$trait<Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::Scalar(self).binary($op, rhs)
            }
        }

        impl std::ops::$trait<&Array> for f64 {
            type Output = Expr;
            fn $method(self, rhs: &Array) -> Expr {
                Expr::Scalar(self).binary($op, rhs)
            }
        }
    )*};
}

expr_binary_ops! {
    Add, add, BinaryOp::Add;
    Sub, sub, BinaryOp::Sub;
    Mul, mul, BinaryOp::Mul;
    Div, div, BinaryOp::Div;
}

impl std::ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        self.unary(UnaryOp::Neg)
    }
}

impl std::ops::Neg for &Array {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::from(self).unary(UnaryOp::Neg)
    }
}
