// CUDA evaluation of lazy expressions
//
// The expression tree is turned into the source of one elementwise kernel:
//
//   1. Full reductions are evaluated first (their subtree into a scratch
//      buffer, then summed on the host) and replaced by scalar constants.
//   2. Every distinct participant becomes a kernel parameter. Leaf reads are
//      emitted with the leaf's broadcast strides and offset baked in, so one
//      source string corresponds to one (shapes, layouts, ops) combination.
//   3. The tree is evaluated into an f64 scratch buffer (kernel 1), then
//      combined into the destination view with the assignment operator and
//      cast to its dtype (kernel 2).
//
// Compiled modules are cached per source text in the GPU context.

use std::ffi::c_void;
use std::fmt::Write;
use std::sync::Arc;

use super::{AssignOp, BinaryOp, Expr, ReduceOp, UnaryOp};
use crate::array::Array;
use crate::cuda::{self, ENTRY};
use crate::device::Device;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::memory::SynchronizedMemory;
use crate::shape::Shape;

const PRELUDE: &str = r#"
__device__ __forceinline__ double k_sign(double x) { return x > 0.0 ? 1.0 : (x < 0.0 ? -1.0 : x * 0.0); }
__device__ __forceinline__ double k_relu(double x) { return x < 0.0 ? 0.0 : x; }
__device__ __forceinline__ double k_log_or_zero(double x) { return x > 0.0 ? log(x) : 0.0; }
__device__ __forceinline__ double k_sigmoid(double x) { return 1.0 / (1.0 + exp(-x)); }
__device__ __forceinline__ double k_softplus(double x) { return x > 20.0 ? x : log1p(exp(x)); }
__device__ __forceinline__ double k_max(double a, double b) { return a >= b ? a : (a < b ? b : a + b); }
__device__ __forceinline__ double k_min(double a, double b) { return a <= b ? a : (a > b ? b : a + b); }
__device__ __forceinline__ double k_eq(double a, double b) { return a == b ? 1.0 : 0.0; }
"#;

fn double_literal(v: f64) -> String {
    format!("__longlong_as_double({}LL)", v.to_bits() as i64)
}

fn unary_c(op: UnaryOp, x: &str) -> String {
    match op {
        UnaryOp::Identity => format!("({x})"),
        UnaryOp::Neg => format!("(-({x}))"),
        UnaryOp::Abs => format!("fabs({x})"),
        UnaryOp::Sign => format!("k_sign({x})"),
        UnaryOp::Exp => format!("exp({x})"),
        UnaryOp::Log => format!("log({x})"),
        UnaryOp::LogOrZero => format!("k_log_or_zero({x})"),
        UnaryOp::Sqrt => format!("sqrt({x})"),
        UnaryOp::Square => format!("([](double v) {{ return v * v; }})({x})"),
        UnaryOp::Inv => format!("(1.0 / ({x}))"),
        UnaryOp::Sigmoid => format!("k_sigmoid({x})"),
        UnaryOp::SteepSigmoid(k) => format!("k_sigmoid({} * ({x}))", double_literal(k)),
        UnaryOp::Tanh => format!("tanh({x})"),
        UnaryOp::Relu => format!("k_relu({x})"),
        UnaryOp::Softplus => format!("k_softplus({x})"),
        UnaryOp::Pow(p) => format!("pow({x}, {})", double_literal(p)),
    }
}

fn binary_c(op: BinaryOp, a: &str, b: &str) -> String {
    match op {
        BinaryOp::Add => format!("(({a}) + ({b}))"),
        BinaryOp::Sub => format!("(({a}) - ({b}))"),
        BinaryOp::Mul => format!("(({a}) * ({b}))"),
        BinaryOp::Div => format!("(({a}) / ({b}))"),
        BinaryOp::Pow => format!("pow({a}, {b})"),
        BinaryOp::Max => format!("k_max({a}, {b})"),
        BinaryOp::Min => format!("k_min({a}, {b})"),
        BinaryOp::Eq => format!("k_eq({a}, {b})"),
    }
}

fn reduce_init_c(op: ReduceOp) -> &'static str {
    match op {
        ReduceOp::Sum | ReduceOp::Mean => "0.0",
        ReduceOp::Max => "(-1.0 / 0.0)",
        ReduceOp::Min => "(1.0 / 0.0)",
    }
}

fn assign_c(op: AssignOp, old: &str, value: &str) -> String {
    match op {
        AssignOp::Set => value.to_string(),
        AssignOp::Add => format!("{old} + {value}"),
        AssignOp::Sub => format!("{old} - {value}"),
        AssignOp::Mul => format!("{old} * {value}"),
        AssignOp::Div => format!("{old} / {value}"),
    }
}

/// Emit `long long {var}[rank]` holding the row-major unravel of `flat`.
fn emit_unravel(out: &mut String, var: &str, flat: &str, shape: &Shape) {
    let rank = shape.rank().max(1);
    let _ = writeln!(out, "    long long {var}[{rank}]; {var}[0] = 0;");
    let _ = writeln!(out, "    {{ long long rem = {flat};");
    for (d, &size) in shape.dims().iter().enumerate().rev() {
        let _ = writeln!(out, "      {var}[{d}] = rem % {size}LL; rem /= {size}LL;");
    }
    let _ = writeln!(out, "    }}");
}

fn position_c(layout: &Layout, index: &str) -> String {
    let mut pos = format!("{}LL", layout.offset());
    for (d, &stride) in layout.strides().iter().enumerate() {
        if stride != 0 {
            let _ = write!(pos, " + {index}[{d}] * {stride}LL");
        }
    }
    pos
}

struct Codegen<'p> {
    participants: &'p [Arc<SynchronizedMemory>],
    fresh_names: usize,
}

impl Codegen<'_> {
    fn param_of(&self, array: &Array) -> Result<usize> {
        self.participants
            .iter()
            .position(|m| Arc::ptr_eq(m, array.memory()))
            .ok_or_else(|| Error::msg("expression leaf missing from kernel parameters"))
    }

    fn fresh(&mut self, prefix: &str) -> String {
        self.fresh_names += 1;
        format!("{prefix}{}", self.fresh_names)
    }

    /// A C expression for `expr` at `index` (an array variable of `target`'s rank).
    fn emit(&mut self, expr: &Expr, target: &Shape, index: &str) -> Result<String> {
        match expr {
            Expr::Leaf(array) => {
                let layout = array.layout().broadcast_to(target)?;
                let param = self.param_of(array)?;
                Ok(format!("((double)p{param}[{}])", position_c(&layout, index)))
            }
            Expr::Scalar(value) => Ok(double_literal(*value)),
            Expr::Unary { op, arg } => {
                let arg = self.emit(arg, target, index)?;
                Ok(unary_c(*op, &arg))
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.emit(lhs, target, index)?;
                let rhs = self.emit(rhs, target, index)?;
                Ok(binary_c(*op, &lhs, &rhs))
            }
            Expr::Reduce { .. } => Err(Error::msg(
                "full reductions must be folded before kernel generation",
            )),
            Expr::AxisReduce {
                op,
                axis,
                keep_dims,
                arg,
            } => {
                let arg_shape = arg.shape()?;
                let extent = arg_shape.dim(*axis)?;
                let own_shape = expr.shape()?;
                let lead = target.rank() - own_shape.rank();
                let inner_index = self.fresh("j");
                let k = self.fresh("k");
                let acc = self.fresh("acc");
                let inner = self.emit(arg, &arg_shape, &inner_index)?;

                let mut body = String::new();
                let _ = write!(
                    body,
                    "([&]() {{ long long {inner_index}[{}]; ",
                    arg_shape.rank().max(1)
                );
                let mut own_axis = 0;
                for d in 0..arg_shape.rank() {
                    if d == *axis {
                        if *keep_dims {
                            own_axis += 1;
                        }
                        continue;
                    }
                    if own_shape.dims()[own_axis] == 1 {
                        let _ = write!(body, "{inner_index}[{d}] = 0; ");
                    } else {
                        let _ = write!(body, "{inner_index}[{d}] = {index}[{}]; ", own_axis + lead);
                    }
                    own_axis += 1;
                }
                let combine = match op {
                    ReduceOp::Sum | ReduceOp::Mean => format!("{acc} + {inner}"),
                    ReduceOp::Max => format!("k_max({acc}, {inner})"),
                    ReduceOp::Min => format!("k_min({acc}, {inner})"),
                };
                let finish = match op {
                    ReduceOp::Mean => format!("{acc} / {extent}.0"),
                    ReduceOp::Sum | ReduceOp::Max | ReduceOp::Min => acc.clone(),
                };
                let _ = write!(
                    body,
                    "double {acc} = {}; for (long long {k} = 0; {k} < {extent}LL; ++{k}) {{ {inner_index}[{axis}] = {k}; {acc} = {combine}; }} return {finish}; }})()",
                    reduce_init_c(*op),
                );
                Ok(body)
            }
        }
    }
}

/// Replace every full reduction by its value.
fn fold_reductions(expr: &Expr, ordinal: usize) -> Result<Expr> {
    Ok(match expr {
        Expr::Leaf(_) | Expr::Scalar(_) => expr.clone(),
        Expr::Unary { op, arg } => fold_reductions(arg, ordinal)?.unary(*op),
        Expr::Binary { op, lhs, rhs } => {
            fold_reductions(lhs, ordinal)?.binary(*op, fold_reductions(rhs, ordinal)?)
        }
        Expr::Reduce { op, arg } => {
            let arg = fold_reductions(arg, ordinal)?;
            let shape = arg.shape()?;
            let scratch = Array::zeros_on(shape, DType::F64, Device::Gpu(ordinal))?;
            super::assign_any_dtype(&scratch, AssignOp::Set, arg)?;
            let values = scratch.to_vec_f64()?;
            let acc = values.iter().fold(op.init(), |acc, &v| op.combine(acc, v));
            Expr::Scalar(op.finish(acc, values.len()))
        }
        Expr::AxisReduce {
            op,
            axis,
            keep_dims,
            arg,
        } => fold_reductions(arg, ordinal)?.reduce_axis(*op, *axis, *keep_dims),
    })
}

fn kernel_signature(params: &[String]) -> String {
    format!(
        "extern \"C\" __global__ void {ENTRY}({}, long long n)",
        params.join(", ")
    )
}

/// Evaluate `expr` on GPU `ordinal` and combine it into `dst` with `op`.
pub(super) fn run(dst: &Array, op: AssignOp, expr: &Expr, ordinal: usize) -> Result<()> {
    let ctx = cuda::context(ordinal)?;
    let expr = fold_reductions(expr, ordinal)?;
    let shape = dst.shape().clone();
    let n = shape.elem_count();
    let scratch = ctx.alloc_f64(n)?;

    // kernel 1: expression -> f64 scratch
    {
        let participants = expr.participants();
        let mut codegen = Codegen {
            participants: &participants,
            fresh_names: 0,
        };
        let value = codegen.emit(&expr, &shape, "idx")?;

        let mut params: Vec<String> = participants
            .iter()
            .enumerate()
            .map(|(i, m)| format!("const {}* p{i}", m.dtype().c_type()))
            .collect();
        params.push("double* out".to_string());
        let mut source = String::from(PRELUDE);
        let _ = writeln!(source, "{} {{", kernel_signature(&params));
        let _ = writeln!(
            source,
            "    long long i = (long long)blockIdx.x * blockDim.x + threadIdx.x;\n    if (i >= n) return;"
        );
        emit_unravel(&mut source, "idx", "i", &shape);
        let _ = writeln!(source, "    out[i] = {value};\n}}");

        let reads = participants
            .iter()
            .map(|m| m.gpu_data(ordinal))
            .collect::<Result<Vec<_>>>()?;
        let mut pointers = reads
            .iter()
            .map(|r| r.buffer().map(|b| b.device_ptr()))
            .collect::<Result<Vec<u64>>>()?;
        pointers.push(cuda::device_ptr_f64(&scratch));
        let mut count = n as i64;
        let mut args: Vec<*mut c_void> = pointers
            .iter_mut()
            .map(|p| p as *mut u64 as *mut c_void)
            .collect();
        args.push(&mut count as *mut i64 as *mut c_void);

        let func = ctx.kernel(&source)?;
        // SAFETY: one u64 device pointer per declared pointer parameter, then n;
        // the read guards keep every input allocated until the launch returns.
        unsafe { ctx.launch(func, n, &mut args)? };
    }

    // kernel 2: scratch -> destination view
    let mut source = String::from(PRELUDE);
    let params = vec![
        format!("{}* dst", dst.dtype().c_type()),
        "const double* src".to_string(),
    ];
    let _ = writeln!(source, "{} {{", kernel_signature(&params));
    let _ = writeln!(
        source,
        "    long long i = (long long)blockIdx.x * blockDim.x + threadIdx.x;\n    if (i >= n) return;"
    );
    emit_unravel(&mut source, "idx", "i", &shape);
    let _ = writeln!(
        source,
        "    long long pos = {};\n    double old = (double)dst[pos];\n    dst[pos] = ({})({});\n}}",
        position_c(dst.layout(), "idx"),
        dst.dtype().c_type(),
        assign_c(op, "old", "src[i]"),
    );

    let mut write = dst.memory().mutable_gpu_data(ordinal)?;
    let mut pointers = [
        write.buffer_mut()?.device_ptr(),
        cuda::device_ptr_f64(&scratch),
    ];
    let mut count = n as i64;
    let mut args: Vec<*mut c_void> = pointers
        .iter_mut()
        .map(|p| p as *mut u64 as *mut c_void)
        .collect();
    args.push(&mut count as *mut i64 as *mut c_void);
    let func = ctx.kernel(&source)?;
    // SAFETY: as above; the write guard holds the destination for the launch.
    unsafe { ctx.launch(func, n, &mut args) }
}
