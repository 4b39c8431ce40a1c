// Integration tests for arrays, lazy expressions and tensors
//
// These exercise the public surface end to end through the facade: lazy
// allocation, compound assignment, views, gradient checking on random inputs
// and the tape's recording states.

use kestrel::gradcheck::check_grad;
use kestrel::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

// Dense arrays

#[test]
fn test_compound_assignment_sequence() -> kestrel::Result<()> {
    let x = Array::zeros((3, 2), DType::F32)?;
    x.set(13.0)?;
    x.add_assign(2.0)?;
    assert_eq!(x.sum()?, 13.0 * 6.0 + 2.0 * 6.0);
    x.add_assign(&Array::arange((3, 2), DType::F32)?)?;
    for i in 0..6 {
        assert_eq!(x.get_flat(i)?, 15.0 + i as f64);
    }
    Ok(())
}

#[test]
fn test_zeros_are_lazy_until_touched() -> kestrel::Result<()> {
    let t = Tensor::new((10, 10), Init::Zeros, DType::F32)?;
    assert!(!t.w().memory().is_any_allocated()?);
    assert!(!t.dw().memory().is_any_allocated()?);
    assert_eq!(t.w().sum()?, 0.0);
    assert!(t.w().memory().is_allocated(Device::Cpu)?);
    assert!(!t.dw().memory().is_any_allocated()?);
    Ok(())
}

#[test]
fn test_in_place_update_of_strided_view() -> kestrel::Result<()> {
    let x = Array::arange((3, 4), DType::F64)?;
    let id = x.memory_id();
    let column = x.slice(1, &Slice::new(1, None, 2)?)?;
    column.mul_assign(10.0)?;
    assert_eq!(x.memory_id(), id);
    assert_eq!(
        x.to_vec_f64()?,
        vec![0.0, 10.0, 2.0, 30.0, 4.0, 50.0, 6.0, 70.0, 8.0, 90.0, 10.0, 110.0]
    );
    Ok(())
}

#[test]
fn test_pluck_axis_offsets_and_strides() -> kestrel::Result<()> {
    let x = Array::arange((2, 3, 4), DType::F32)?;
    let a = x.pluck_axis(0, 1)?;
    assert_eq!((a.dims(), a.offset()), (&[3usize, 4][..], 12));
    let b = x.pluck_axis(1, 2)?;
    assert_eq!((b.dims(), b.offset(), b.strides()), (&[2usize, 4][..], 8, &[12isize, 1][..]));
    let c = x.pluck_axis(2, 1)?;
    assert_eq!((c.dims(), c.offset(), c.strides()), (&[2usize, 3][..], 1, &[12isize, 4][..]));
    assert_eq!(c.to_vec_f64()?, vec![1.0, 5.0, 9.0, 13.0, 17.0, 21.0]);
    Ok(())
}

#[test]
fn test_log_then_exp_recovers_input() -> kestrel::Result<()> {
    random::set_seed(1234);
    let x = Init::Uniform {
        lower: 0.1,
        upper: 5.0,
    }
    .build((4, 7), DType::F64)?;
    let back = x.expr().log().exp().eval(DType::F64)?;
    assert!(back.allclose(&x, 1e-9)?);
    Ok(())
}

#[test]
fn test_fused_expression_with_reduction() -> kestrel::Result<()> {
    // softmax over the last axis in one assignment
    let logits = Array::from_vec(vec![1.0f64, 2.0, 3.0, 0.0, 0.0, 0.0], (2, 3))?;
    let shifted = &logits - logits.expr().max_axis(1, true);
    let exps = shifted.exp();
    let probs = (exps.clone() / exps.sum_axis(1, true)).eval(DType::F64)?;
    let row0_norm = 1.0 + (-1.0f64).exp() + (-2.0f64).exp();
    assert_vec_approx(
        &probs.to_vec_f64()?,
        &[
            (-2.0f64).exp() / row0_norm,
            (-1.0f64).exp() / row0_norm,
            1.0 / row0_norm,
            1.0 / 3.0,
            1.0 / 3.0,
            1.0 / 3.0,
        ],
        1e-12,
    );
    Ok(())
}

// Tensors and the tape

#[test]
fn test_random_inputs_pass_gradient_check() -> kestrel::Result<()> {
    random::set_seed(42);
    let x = Tensor::new((3, 4), Init::uniform(1.0), DType::F64)?;
    let weights = Tensor::new((4, 2), Init::uniform(1.0), DType::F64)?;
    let bias = Tensor::new((1, 2), Init::uniform(1.0), DType::F64)?;
    check_grad(
        &x,
        |x| x.dot(&weights)?.add(&bias)?.tanh()?.square()?.mean(),
        1e-5,
        1e-4,
    )?;
    check_grad(
        &weights,
        |w| x.dot(w)?.sigmoid()?.sum_axis(0, false)?.l2_norm(),
        1e-5,
        1e-4,
    )?;
    Ok(())
}

#[test]
fn test_axis_reductions_on_random_shapes() -> kestrel::Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    random::set_seed(7);
    for _ in 0..6 {
        let rows = rng.gen_range(1..5);
        let cols = rng.gen_range(1..6);
        let axis = rng.gen_range(0..2);
        let keep_dims = rng.gen_bool(0.5);
        let x = Tensor::new((rows, cols), Init::uniform(2.0), DType::F64)?;
        check_grad(
            &x,
            |x| x.sum_axis(axis, keep_dims)?.square()?.mean(),
            1e-5,
            1e-4,
        )?;
        check_grad(&x, |x| x.mean_axis(axis, keep_dims)?.l2_norm(), 1e-5, 1e-4)?;
    }
    Ok(())
}

#[test]
fn test_transposed_view_aliases_memory() -> kestrel::Result<()> {
    let x = Tensor::new((2, 5), Init::gaussian(1.0), DType::F32)?;
    let t = x.transpose();
    assert!(t.w().shares_memory(x.w()));
    assert!(t.dw().shares_memory(x.dw()));
    let r = x.reshape(10)?;
    assert!(r.w().shares_memory(x.w()));
    Ok(())
}

#[test]
fn test_shared_operand_accumulates_both_paths() -> kestrel::Result<()> {
    tape::scoped(|| {
        let x = Tensor::from_vec(vec![3.0f64], 1)?;
        // y = x * x + x  =>  dy/dx = 2x + 1
        let y = x.eltmul(&x)?.add(&x)?.sum()?;
        y.grad()?;
        tape::backward()?;
        assert_eq!(x.dw().to_vec_f64()?, vec![7.0]);
        Ok(())
    })
}

#[test]
fn test_nested_no_backprop_restores_state() -> kestrel::Result<()> {
    tape::scoped(|| {
        let x = Tensor::new(3, Init::Ones, DType::F32)?;
        {
            let _outer = NoBackprop::new();
            {
                let _inner = NoBackprop::when(true);
                x.exp()?;
            }
            assert_eq!(tape::state(), TapeState::Disabled);
            let _skipped = NoBackprop::when(false);
            x.exp()?;
        }
        assert_eq!(tape::state(), TapeState::Recording);
        assert!(tape::is_empty());
        x.exp()?;
        assert_eq!(tape::len(), 1);
        tape::clear();
        Ok(())
    })
}

#[test]
fn test_backward_without_seed_is_not_an_error() -> kestrel::Result<()> {
    tape::scoped(|| {
        let x = Tensor::new((2, 2), Init::Ones, DType::F32)?;
        x.square()?.sum()?;
        tape::backward()?;
        assert_eq!(x.dw().sum()?, 0.0);
        assert!(tape::is_empty());
        Ok(())
    })
}

#[test]
fn test_usage_errors_are_reported() -> kestrel::Result<()> {
    let x = Tensor::new((2, 3), Init::Zeros, DType::F32)?;
    assert!(matches!(x.grad(), Err(Error::NotAScalar { .. })));
    assert!(matches!(x.w().get(&[2, 0]), Err(Error::IndexOutOfRange { .. })));
    assert!(matches!(Slice::new(0, None, 0), Err(Error::ZeroStep)));
    let y = Tensor::new((3, 2), Init::Zeros, DType::F32)?;
    assert!(x.add(&y).is_err());
    assert!(matches!(
        x.w().set(&Array::zeros((4, 5), DType::F32)?),
        Err(Error::ShapeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn test_numeric_edge_cases_propagate() -> kestrel::Result<()> {
    tape::scoped(|| {
        let x = Tensor::from_vec(vec![0.0f64, -1.0], 2)?;
        let logs = x.log()?;
        let values = logs.w().to_vec_f64()?;
        assert_eq!(values[0], f64::NEG_INFINITY);
        assert!(values[1].is_nan());
        let inv = x.elt_inv()?;
        assert_eq!(inv.w().get_flat(0)?, f64::INFINITY);
        tape::clear();
        Ok(())
    })
}
