// Integration tests for kestrel-optim
//
// Every solver minimizes the L2 norm of a 5-element tensor that starts far
// from zero, driving it below 0.1 within 200 steps.

use kestrel::prelude::*;

fn far_from_zero() -> kestrel::Result<Tensor> {
    Tensor::from_vec(vec![12.0f64, -6.0, 4.0, -3.0, 8.0], 5)
}

/// Run at most 200 steps; returns the last observed norm.
fn minimize_norm(solver: &mut dyn Solver) -> kestrel::Result<f64> {
    tape::scoped(|| {
        let x = far_from_zero()?;
        let params = vec![x.clone()];
        assert!(x.w().l2_norm()? > 10.0);
        let mut last_error = f64::INFINITY;
        for _ in 0..200 {
            let error = x.l2_norm()?;
            error.grad()?;
            tape::backward()?;
            solver.step(&params)?;
            last_error = error.w().get(&[])?;
            if last_error < 0.1 {
                break;
            }
        }
        Ok(last_error)
    })
}

#[test]
fn test_sgd_converges() -> kestrel::Result<()> {
    let mut solver = Sgd::new().with_step_size(0.5);
    solver.clip_norm = 0.0;
    assert!(minimize_norm(&mut solver)? < 0.1);
    Ok(())
}

#[test]
fn test_adagrad_converges() -> kestrel::Result<()> {
    let mut solver = AdaGrad::new().with_step_size(1.0);
    solver.clip_norm = 0.0;
    assert!(minimize_norm(&mut solver)? < 0.1);
    Ok(())
}

#[test]
fn test_rmsprop_converges() -> kestrel::Result<()> {
    let mut solver = RMSProp::new().with_step_size(0.2);
    solver.clip_norm = 0.0;
    solver.decay_rate = 0.95;
    assert!(minimize_norm(&mut solver)? < 0.1);
    Ok(())
}

#[test]
fn test_rmsprop_momentum_converges() -> kestrel::Result<()> {
    let mut solver = RMSPropMomentum::new().with_step_size(0.5);
    solver.momentum = 0.2;
    assert!(minimize_norm(&mut solver)? < 0.1);
    Ok(())
}

#[test]
fn test_adadelta_converges() -> kestrel::Result<()> {
    let mut solver = AdaDelta::new();
    solver.clip_norm = 0.0;
    solver.smooth_eps = 1e-2;
    assert!(minimize_norm(&mut solver)? < 0.1);
    Ok(())
}

#[test]
fn test_adam_converges() -> kestrel::Result<()> {
    let mut solver = Adam::new().with_step_size(0.2);
    solver.clip_norm = 0.0;
    assert!(minimize_norm(&mut solver)? < 0.1);
    Ok(())
}

#[test]
fn test_boxed_solver_from_name() -> kestrel::Result<()> {
    let mut solver = create_solver("SGD", 0.5)?;
    assert!(minimize_norm(solver.as_mut())? < 0.1);
    Ok(())
}

#[test]
fn test_quadratic_objective_decreases() -> kestrel::Result<()> {
    // minimize x^T W x + v . x over W and v, with x held constant
    random::set_seed(5000);
    tape::scoped(|| {
        let x = Tensor::from_vec(vec![0.5f64, -1.0, 0.25, 2.0, -0.75], (5, 1))?.consider_constant();
        let a = Tensor::new((5, 5), Init::uniform(1.0), DType::F64)?;
        let w = {
            let _guard = NoBackprop::new();
            Tensor::from_array(a.dot(&a.transpose())?.w().copy()?)?
        };
        let v = Tensor::new((1, 5), Init::uniform(1.0), DType::F64)?;
        let params = vec![w.clone(), v.clone()];
        let mut solver = AdaGrad::new().with_step_size(0.01);

        let mut last_error = f64::INFINITY;
        for iter in 0..10 {
            let error = Tensor::quadratic_form(&x, &w, &x)?.add(&v.dot(&x)?)?;
            error.grad()?;
            tape::backward()?;
            solver.step(&params)?;
            let value = error.w().get_flat(0)?;
            if iter > 1 {
                assert!(value + 1e-5 < last_error);
            }
            last_error = value;
        }
        Ok(())
    })
}
