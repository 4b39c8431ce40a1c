// Host evaluation of lazy expressions
//
// An expression is lowered once into a tree of boxed closures, each mapping
// an index in the destination's shape to an f64. Leaves capture their typed
// slice plus broadcast strides, so the hot loop does no dtype dispatch and no
// locking. Full reductions are computed while lowering and become constants;
// axis reductions loop over their axis inside the closure, building their
// argument index in a slice of a per-worker scratch buffer that is allocated
// once per evaluation (see `scratch_len`).
//
// All participant buffers are read-locked (and made host-fresh) up front in a
// LeafTable. Values are computed into a scratch Vec, the read locks are
// released, and only then is the destination write-locked, so an expression
// may freely read the array it is assigned into.

use std::sync::Arc;

use rayon::prelude::*;

use super::{AssignOp, Expr, ReduceOp};
use crate::array::Array;
use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::memory::{HostBuffer, HostRead, SynchronizedMemory};
use crate::shape::Shape;

/// Element count above which host kernels are split across the rayon pool.
pub const PAR_THRESHOLD: usize = 100_000;

/// Maps a destination index to a value. The second argument is scratch space
/// of at least `scratch_len` elements for the lowered expression.
type Kernel<'a> = Box<dyn Fn(&[usize], &mut [usize]) -> f64 + Send + Sync + 'a>;

/// Scratch needed to evaluate `expr` once: every axis reduction holds an
/// argument index while its operand runs in the space after it.
fn scratch_len(expr: &Expr) -> Result<usize> {
    Ok(match expr {
        Expr::Leaf(_) | Expr::Scalar(_) => 0,
        Expr::Unary { arg, .. } => scratch_len(arg)?,
        Expr::Binary { lhs, rhs, .. } => scratch_len(lhs)?.max(scratch_len(rhs)?),
        // evaluated while lowering, with its own buffers
        Expr::Reduce { .. } => 0,
        Expr::AxisReduce { arg, .. } => arg.shape()?.rank() + scratch_len(arg)?,
    })
}

/// Host-fresh read guards for every distinct buffer an expression reads.
struct LeafTable<'m> {
    reads: Vec<(&'m Arc<SynchronizedMemory>, HostRead<'m>)>,
}

impl<'m> LeafTable<'m> {
    /// Guards are taken in `MemoryId` order, so two expressions reading the
    /// same buffers in different orders cannot wait on each other.
    fn lock(participants: &'m [Arc<SynchronizedMemory>]) -> Result<Self> {
        let mut ordered: Vec<&'m Arc<SynchronizedMemory>> = participants.iter().collect();
        ordered.sort_by_key(|memory| memory.id());
        let mut reads = Vec::with_capacity(ordered.len());
        for memory in ordered {
            reads.push((memory, memory.cpu_data()?));
        }
        Ok(LeafTable { reads })
    }

    fn buffer(&self, memory: &Arc<SynchronizedMemory>) -> Result<&HostBuffer> {
        self.reads
            .iter()
            .find(|(m, _)| Arc::ptr_eq(m, memory))
            .map(|(_, read)| &**read)
            .ok_or_else(|| Error::msg("expression leaf was not locked for evaluation"))
    }
}

fn leaf_kernel<'a, T: WithDType>(data: &'a [T], layout: Layout) -> Kernel<'a> {
    let offset = layout.offset() as isize;
    let strides = layout.strides().to_vec();
    Box::new(move |index: &[usize], _: &mut [usize]| {
        let mut pos = offset;
        for (&i, &stride) in index.iter().zip(&strides) {
            pos += i as isize * stride;
        }
        data[pos as usize].to_f64()
    })
}

fn lower<'a>(expr: &Expr, target: &Shape, table: &'a LeafTable<'_>) -> Result<Kernel<'a>> {
    match expr {
        Expr::Leaf(array) => {
            let layout = array.layout().broadcast_to(target)?;
            Ok(match table.buffer(array.memory())? {
                HostBuffer::F32(v) => leaf_kernel(v.as_slice(), layout),
                HostBuffer::F64(v) => leaf_kernel(v.as_slice(), layout),
                HostBuffer::I32(v) => leaf_kernel(v.as_slice(), layout),
            })
        }
        Expr::Scalar(value) => {
            let value = *value;
            Ok(Box::new(move |_: &[usize], _: &mut [usize]| value))
        }
        Expr::Unary { op, arg } => {
            let op = *op;
            let arg = lower(arg, target, table)?;
            Ok(Box::new(move |index: &[usize], scratch: &mut [usize]| {
                op.apply(arg(index, &mut *scratch))
            }))
        }
        Expr::Binary { op, lhs, rhs } => {
            let op = *op;
            let lhs = lower(lhs, target, table)?;
            let rhs = lower(rhs, target, table)?;
            Ok(Box::new(move |index: &[usize], scratch: &mut [usize]| {
                let a = lhs(index, &mut *scratch);
                op.apply(a, rhs(index, &mut *scratch))
            }))
        }
        Expr::Reduce { op, arg } => {
            let value = reduce_all(*op, arg, table)?;
            Ok(Box::new(move |_: &[usize], _: &mut [usize]| value))
        }
        Expr::AxisReduce {
            op,
            axis,
            keep_dims,
            arg,
        } => {
            let op = *op;
            let axis = *axis;
            let arg_shape = arg.shape()?;
            let extent = arg_shape.dim(axis)?;
            let own_shape = expr.shape()?;
            if !own_shape.broadcasts_to(target) {
                return Err(Error::ShapeMismatch {
                    expected: target.clone(),
                    got: own_shape,
                });
            }
            // where each arg axis (other than `axis`) reads from in the target index
            let lead = target.rank() - own_shape.rank();
            let mut sources = Vec::with_capacity(arg_shape.rank());
            let mut own_axis = 0;
            for d in 0..arg_shape.rank() {
                if d == axis {
                    sources.push(None);
                    if *keep_dims {
                        own_axis += 1;
                    }
                    continue;
                }
                let broadcast = own_shape.dims()[own_axis] == 1;
                sources.push(if broadcast {
                    None
                } else {
                    Some(own_axis + lead)
                });
                own_axis += 1;
            }
            let rank = arg_shape.rank();
            let inner = lower(arg, &arg_shape, table)?;
            Ok(Box::new(move |index: &[usize], scratch: &mut [usize]| {
                let (arg_index, rest) = scratch.split_at_mut(rank);
                for (slot, src) in arg_index.iter_mut().zip(&sources) {
                    *slot = src.map_or(0, |s| index[s]);
                }
                let mut acc = op.init();
                for k in 0..extent {
                    arg_index[axis] = k;
                    acc = op.combine(acc, inner(arg_index, &mut *rest));
                }
                op.finish(acc, extent)
            }))
        }
    }
}

fn reduce_all(op: ReduceOp, arg: &Expr, table: &LeafTable<'_>) -> Result<f64> {
    let shape = arg.shape()?;
    let kernel = lower(arg, &shape, table)?;
    let n = shape.elem_count();
    let rank = shape.rank();
    let extra = scratch_len(arg)?;
    let acc = if n >= PAR_THRESHOLD {
        (0..n)
            .into_par_iter()
            .map_init(
                || (vec![0usize; rank], vec![0usize; extra]),
                |(index, scratch), flat| {
                    shape.unravel_into(flat, index);
                    kernel(index.as_slice(), scratch.as_mut_slice())
                },
            )
            .reduce(|| op.init(), |a, b| op.combine(a, b))
    } else {
        let mut index = vec![0usize; rank];
        let mut scratch = vec![0usize; extra];
        let mut acc = op.init();
        for flat in 0..n {
            shape.unravel_into(flat, &mut index);
            acc = op.combine(acc, kernel(&index, &mut scratch));
        }
        acc
    };
    Ok(op.finish(acc, n))
}

fn evaluate(expr: &Expr, shape: &Shape, table: &LeafTable<'_>) -> Result<Vec<f64>> {
    let kernel = lower(expr, shape, table)?;
    let n = shape.elem_count();
    let rank = shape.rank();
    let extra = scratch_len(expr)?;
    if n >= PAR_THRESHOLD {
        Ok((0..n)
            .into_par_iter()
            .map_init(
                || (vec![0usize; rank], vec![0usize; extra]),
                |(index, scratch), flat| {
                    shape.unravel_into(flat, index);
                    kernel(index.as_slice(), scratch.as_mut_slice())
                },
            )
            .collect())
    } else {
        let mut index = vec![0usize; rank];
        let mut scratch = vec![0usize; extra];
        Ok((0..n)
            .map(|flat| {
                shape.unravel_into(flat, &mut index);
                kernel(&index, &mut scratch)
            })
            .collect())
    }
}

/// Evaluate `expr` on the host and combine it into `dst` with `op`.
pub(super) fn run(
    dst: &Array,
    op: AssignOp,
    expr: &Expr,
    participants: &[Arc<SynchronizedMemory>],
) -> Result<()> {
    let values = {
        let table = LeafTable::lock(participants)?;
        evaluate(expr, dst.shape(), &table)?
    };

    let memory = dst.memory();
    let mut data = if op == AssignOp::Set && dst.spans_entire_memory() {
        memory.overwrite_cpu_data()?
    } else {
        memory.mutable_cpu_data()?
    };
    for (pos, value) in dst.layout().strided_indices().zip(values) {
        let old = match op {
            AssignOp::Set => 0.0,
            _ => data.get_f64(pos),
        };
        data.set_f64(pos, op.apply(old, value));
    }
    Ok(())
}
