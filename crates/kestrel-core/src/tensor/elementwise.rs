// Elementwise operations and their derivatives
//
// Forward: the output value is one lazy expression over the inputs' `w`.
// Backward: each input receives `local_derivative * out.dw`, summed over any
// axes along which the input was broadcast.
//
//   op              d out / d x
//   --------------  ---------------------
//   square          2x
//   sqrt            0.5 / out
//   elt_inv         -out^2
//   pow(p)          p * x^(p-1)
//   log             1 / x
//   exp             out
//   sigmoid         out * (1 - out)
//   steep_sigmoid   k * out * (1 - out)
//   tanh            1 - out^2
//   relu            sign(out)
//   abs             sign(x)
//   softplus        sigmoid(x)
//   sign            (no gradient)

use crate::error::Result;
use crate::lazy::{BinaryOp, Expr, UnaryOp};
use crate::tape;

use super::{accumulate, reduce_to_shape, Tensor};

impl Tensor {
    fn map_unary(
        &self,
        op: UnaryOp,
        derivative: impl Fn(&Tensor, &Tensor) -> Expr + 'static,
    ) -> Result<Tensor> {
        let w = self.w.expr().unary(op).eval(self.dtype())?;
        let out = Tensor::output(w, &[self])?;
        if Tensor::records(&[self]) {
            let (input, result) = (self.clone(), out.clone());
            tape::record(move || {
                let grad = derivative(&input, &result) * result.dw.expr();
                accumulate(&input, grad)
            });
        }
        Ok(out)
    }

    fn map_binary(
        &self,
        other: &Tensor,
        op: BinaryOp,
        derivatives: impl Fn(&Tensor, &Tensor, &Tensor) -> (Expr, Expr) + 'static,
    ) -> Result<Tensor> {
        let w = self.w.expr().binary(op, other.w.expr()).eval(self.dtype())?;
        let out = Tensor::output(w, &[self, other])?;
        if Tensor::records(&[self, other]) {
            let (lhs, rhs, result) = (self.clone(), other.clone(), out.clone());
            tape::record(move || {
                let (dl, dr) = derivatives(&lhs, &rhs, &result);
                if !lhs.constant {
                    accumulate(&lhs, reduce_to_shape(dl, lhs.shape())?)?;
                }
                if !rhs.constant {
                    accumulate(&rhs, reduce_to_shape(dr, rhs.shape())?)?;
                }
                Ok(())
            });
        }
        Ok(out)
    }

    // Binary, with numpy broadcasting

    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.map_binary(other, BinaryOp::Add, |_, _, out| {
            (out.dw.expr(), out.dw.expr())
        })
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.map_binary(other, BinaryOp::Sub, |_, _, out| {
            (out.dw.expr(), -out.dw.expr())
        })
    }

    /// Elementwise product.
    pub fn eltmul(&self, other: &Tensor) -> Result<Tensor> {
        self.map_binary(other, BinaryOp::Mul, |a, b, out| {
            (&out.dw * &b.w, &out.dw * &a.w)
        })
    }

    /// Elementwise quotient.
    pub fn eltdiv(&self, other: &Tensor) -> Result<Tensor> {
        self.map_binary(other, BinaryOp::Div, |_, b, out| {
            (
                &out.dw / &b.w,
                -(&out.dw * &out.w / &b.w),
            )
        })
    }

    // Scalar right-hand sides

    pub fn add_scalar(&self, value: f64) -> Result<Tensor> {
        let w = (&self.w + value).eval(self.dtype())?;
        let out = Tensor::output(w, &[self])?;
        if Tensor::records(&[self]) {
            let (input, result) = (self.clone(), out.clone());
            tape::record(move || accumulate(&input, result.dw.expr()));
        }
        Ok(out)
    }

    pub fn sub_scalar(&self, value: f64) -> Result<Tensor> {
        self.add_scalar(-value)
    }

    pub fn mul_scalar(&self, value: f64) -> Result<Tensor> {
        let w = (&self.w * value).eval(self.dtype())?;
        let out = Tensor::output(w, &[self])?;
        if Tensor::records(&[self]) {
            let (input, result) = (self.clone(), out.clone());
            tape::record(move || accumulate(&input, &result.dw * value));
        }
        Ok(out)
    }

    pub fn div_scalar(&self, value: f64) -> Result<Tensor> {
        self.mul_scalar(1.0 / value)
    }

    // Unary

    pub fn neg(&self) -> Result<Tensor> {
        self.map_unary(UnaryOp::Neg, |_, _| Expr::scalar(-1.0))
    }

    pub fn square(&self) -> Result<Tensor> {
        self.map_unary(UnaryOp::Square, |x, _| &x.w * 2.0)
    }

    pub fn sqrt(&self) -> Result<Tensor> {
        self.map_unary(UnaryOp::Sqrt, |_, out| 0.5 / &out.w)
    }

    /// Elementwise reciprocal.
    pub fn elt_inv(&self) -> Result<Tensor> {
        self.map_unary(UnaryOp::Inv, |_, out| -out.w.expr().square())
    }

    pub fn pow(&self, exponent: f64) -> Result<Tensor> {
        self.map_unary(UnaryOp::Pow(exponent), move |x, _| {
            exponent * x.w.expr().powf(exponent - 1.0)
        })
    }

    pub fn log(&self) -> Result<Tensor> {
        self.map_unary(UnaryOp::Log, |x, _| x.w.expr().inv())
    }

    pub fn exp(&self) -> Result<Tensor> {
        self.map_unary(UnaryOp::Exp, |_, out| out.w.expr())
    }

    pub fn sigmoid(&self) -> Result<Tensor> {
        self.map_unary(UnaryOp::Sigmoid, |_, out| &out.w * (1.0 - &out.w))
    }

    /// `1 / (1 + exp(-aggressiveness * x))`.
    pub fn steep_sigmoid(&self, aggressiveness: f64) -> Result<Tensor> {
        self.map_unary(UnaryOp::SteepSigmoid(aggressiveness), move |_, out| {
            aggressiveness * (&out.w * (1.0 - &out.w))
        })
    }

    pub fn tanh(&self) -> Result<Tensor> {
        self.map_unary(UnaryOp::Tanh, |_, out| 1.0 - out.w.expr().square())
    }

    pub fn relu(&self) -> Result<Tensor> {
        self.map_unary(UnaryOp::Relu, |_, out| out.w.expr().sign())
    }

    pub fn abs(&self) -> Result<Tensor> {
        self.map_unary(UnaryOp::Abs, |x, _| x.w.expr().sign())
    }

    /// `log(1 + exp(x))`.
    pub fn softplus(&self) -> Result<Tensor> {
        self.map_unary(UnaryOp::Softplus, |x, _| x.w.expr().sigmoid())
    }

    /// -1, 0 or 1; gradients stop here.
    pub fn sign(&self) -> Result<Tensor> {
        let w = self.w.expr().sign().eval(self.dtype())?;
        Tensor::output(w, &[self])
    }
}
