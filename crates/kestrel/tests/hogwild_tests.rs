// Integration tests for Hogwild-style training
//
// Worker threads hold shallow copies that share the parameter value but own
// their gradients and their thread-local tapes.

use std::thread;

use kestrel::prelude::*;

#[test]
fn test_workers_share_value_and_keep_private_gradients() -> kestrel::Result<()> {
    let x = Tensor::from_vec(vec![1.0f64, 2.0, 3.0], 3)?;
    let scales = [1.0, 2.0, 3.0, 4.0];

    let workers: Vec<_> = scales
        .iter()
        .map(|&scale| {
            let local = Tensor::from_tensor(&x, true)?;
            Ok(thread::spawn(move || -> kestrel::Result<Vec<f64>> {
                assert!(tape::is_empty());
                // d/dx sum(scale * x) = scale
                local.mul_scalar(scale)?.sum()?.grad()?;
                tape::backward()?;
                let grad = local.dw().to_vec_f64()?;
                let mut solver = Sgd::new().with_step_size(0.1);
                solver.clip_norm = 0.0;
                solver.step(&[local.clone()])?;
                Ok(grad)
            }))
        })
        .collect::<kestrel::Result<_>>()?;

    for (worker, scale) in workers.into_iter().zip(scales) {
        let grad = worker.join().expect("worker panicked")?;
        assert_eq!(grad, vec![scale; 3]);
    }

    // the shared value received every worker's update; the original's
    // gradient was never touched
    let total: f64 = scales.iter().sum();
    let expected = Array::from_vec(
        vec![1.0 - 0.1 * total, 2.0 - 0.1 * total, 3.0 - 0.1 * total],
        3,
    )?;
    assert!(x.w().allclose(&expected, 1e-12)?);
    assert_eq!(x.dw().sum()?, 0.0);
    assert!(!x.dw().memory().is_any_allocated()?);
    Ok(())
}

#[test]
fn test_deep_copy_does_not_share_updates() -> kestrel::Result<()> {
    let x = Tensor::from_vec(vec![1.0f32, 1.0], 2)?;
    let copy = Tensor::from_tensor(&x, false)?;
    copy.w().add_assign(5.0)?;
    assert_eq!(x.w().to_vec_f64()?, vec![1.0, 1.0]);
    assert_eq!(copy.w().to_vec_f64()?, vec![6.0, 6.0]);
    Ok(())
}

#[test]
fn test_tapes_are_per_thread() -> kestrel::Result<()> {
    tape::scoped(|| {
        let x = Tensor::new(2, Init::Ones, DType::F32)?;
        x.exp()?;
        assert_eq!(tape::len(), 1);
        let other = thread::spawn(tape::len).join().expect("thread panicked");
        assert_eq!(other, 0);
        tape::clear();
        Ok(())
    })
}

#[test]
fn test_readers_in_opposite_orders_with_writers_complete() -> kestrel::Result<()> {
    let x = Array::ones(64, DType::F64)?;
    let y = Array::ones(64, DType::F64)?;
    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let (x, y) = (x.clone(), y.clone());
            thread::spawn(move || -> kestrel::Result<()> {
                let out = Array::zeros(64, DType::F64)?;
                for _ in 0..2_000 {
                    match worker % 4 {
                        0 => out.set(&x + &y)?,
                        1 => out.set(&y + &x)?,
                        2 => x.add_assign(&out * 0.0)?,
                        _ => y.add_assign(&out * 0.0)?,
                    }
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked")?;
    }
    assert_eq!(x.sum()?, 64.0);
    assert_eq!(y.sum()?, 64.0);
    Ok(())
}
