use std::cell::RefCell;

use rand::rngs::StdRng;
use rand::{thread_rng, SeedableRng};

// Per-thread random source for initializers. Unseeded threads draw a
// StdRng from the OS-seeded thread_rng on first use; `set_seed` makes the
// calling thread's subsequent draws reproducible.

thread_local! {
    static RNG: RefCell<Option<StdRng>> = const { RefCell::new(None) };
}

/// Reseed the calling thread's generator.
pub fn set_seed(seed: u64) {
    RNG.with(|rng| *rng.borrow_mut() = Some(StdRng::seed_from_u64(seed)));
}

/// Run `f` with the calling thread's generator.
pub fn with_rng<R>(f: impl FnOnce(&mut StdRng) -> R) -> R {
    RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        let rng = rng.get_or_insert_with(|| {
            StdRng::from_rng(thread_rng()).unwrap_or_else(|_| StdRng::seed_from_u64(0))
        });
        f(rng)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_seed_makes_draws_reproducible() {
        set_seed(100);
        let a: Vec<f64> = with_rng(|rng| (0..4).map(|_| rng.gen()).collect());
        set_seed(100);
        let b: Vec<f64> = with_rng(|rng| (0..4).map(|_| rng.gen()).collect());
        assert_eq!(a, b);
    }
}
