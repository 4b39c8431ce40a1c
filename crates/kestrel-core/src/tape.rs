use std::cell::RefCell;

use crate::error::Result;

// Gradient tape
//
// Reverse-mode differentiation by replay: every differentiable tensor
// operation performed while the tape is recording pushes a closure that knows
// how to push its output gradient back into its inputs' gradients. `backward`
// pops and runs the closures newest-first, which visits every operation after
// all operations that consumed its output, then leaves the tape empty.
//
// Tapes are per thread. Each thread starts with its own recording tape, so
// Hogwild-style workers never see each other's closures. `scoped` pushes an
// independent tape for the duration of a closure (used by tests and by
// numerical gradient checks), restoring the outer tape afterwards.
//
// Nothing here knows about tensors: a closure only needs to return
// `Result<()>`. Closures run with the tape in the Replaying state, so work
// they do through tensor operations is not re-recorded.

/// What the current thread's tape does with new operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapeState {
    /// Operations append backward closures.
    Recording,
    /// `backward` is running; nothing is recorded.
    Replaying,
    /// Recording suppressed (see [`NoBackprop`]).
    Disabled,
}

type Backward = Box<dyn FnOnce() -> Result<()>>;

struct Tape {
    closures: Vec<Backward>,
    state: TapeState,
}

impl Tape {
    const fn new() -> Self {
        Tape {
            closures: Vec::new(),
            state: TapeState::Recording,
        }
    }
}

thread_local! {
    static TAPES: RefCell<Vec<Tape>> = const { RefCell::new(Vec::new()) };
}

fn with_tape<R>(f: impl FnOnce(&mut Tape) -> R) -> R {
    TAPES.with(|tapes| {
        let mut tapes = tapes.borrow_mut();
        if tapes.is_empty() {
            tapes.push(Tape::new());
        }
        let last = tapes.len() - 1;
        f(&mut tapes[last])
    })
}

/// The current thread's tape state.
pub fn state() -> TapeState {
    with_tape(|tape| tape.state)
}

pub fn is_recording() -> bool {
    state() == TapeState::Recording
}

fn set_state(state: TapeState) -> TapeState {
    with_tape(|tape| std::mem::replace(&mut tape.state, state))
}

/// Switches the tape to a state and puts the old one back on drop, including
/// while unwinding.
struct StateRestore {
    previous: TapeState,
    clear_on_panic: bool,
}

impl StateRestore {
    fn enter(state: TapeState, clear_on_panic: bool) -> Self {
        StateRestore {
            previous: set_state(state),
            clear_on_panic,
        }
    }
}

impl Drop for StateRestore {
    fn drop(&mut self) {
        if self.clear_on_panic && std::thread::panicking() {
            clear();
        }
        set_state(self.previous);
    }
}

/// Append a backward closure if the tape is recording; otherwise drop it.
pub fn record(backward: impl FnOnce() -> Result<()> + 'static) {
    with_tape(|tape| {
        if tape.state == TapeState::Recording {
            tape.closures.push(Box::new(backward));
        }
    })
}

/// Number of closures waiting to be replayed.
pub fn len() -> usize {
    with_tape(|tape| tape.closures.len())
}

pub fn is_empty() -> bool {
    len() == 0
}

/// Drop every recorded closure without running it.
pub fn clear() {
    with_tape(|tape| tape.closures.clear())
}

/// Replay the tape newest-first, then leave it empty.
///
/// Gradients flow from whatever the caller seeded (usually via
/// `Tensor::grad`); with nothing seeded every closure propagates zeros. If a
/// closure fails, the rest of the tape is discarded and the error returned.
pub fn backward() -> Result<()> {
    // a closure that panics leaves the rest of the tape unusable
    let _replaying = StateRestore::enter(TapeState::Replaying, true);
    loop {
        // pop outside the closure call so a closure may touch the tape
        let Some(step) = with_tape(|tape| tape.closures.pop()) else {
            break Ok(());
        };
        if let Err(e) = step() {
            clear();
            break Err(e);
        }
    }
}

struct ScopeGuard;

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        TAPES.with(|tapes| {
            tapes.borrow_mut().pop();
        });
    }
}

/// Run `f` against a fresh, empty tape; the outer tape is untouched.
pub fn scoped<R>(f: impl FnOnce() -> R) -> R {
    TAPES.with(|tapes| {
        let mut tapes = tapes.borrow_mut();
        if tapes.is_empty() {
            tapes.push(Tape::new());
        }
        tapes.push(Tape::new());
    });
    let _guard = ScopeGuard;
    f()
}

/// Suppresses recording on the current thread while alive.
///
/// ```ignore
/// {
///     let _guard = NoBackprop::new();
///     let prediction = model.forward(&input)?; // nothing recorded
/// }
/// ```
#[must_use = "recording resumes as soon as the guard is dropped"]
pub struct NoBackprop {
    _restore: Option<StateRestore>,
}

impl NoBackprop {
    pub fn new() -> Self {
        NoBackprop {
            _restore: Some(StateRestore::enter(TapeState::Disabled, false)),
        }
    }

    /// Suppress recording only if `condition` holds.
    pub fn when(condition: bool) -> Self {
        if condition {
            Self::new()
        } else {
            NoBackprop { _restore: None }
        }
    }
}

impl Default for NoBackprop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_backward_replays_newest_first_and_clears() {
        scoped(|| {
            let order = Rc::new(RefCell::new(Vec::new()));
            for i in 0..3 {
                let order = Rc::clone(&order);
                record(move || {
                    order.borrow_mut().push(i);
                    Ok(())
                });
            }
            assert_eq!(len(), 3);
            backward().unwrap();
            assert_eq!(*order.borrow(), vec![2, 1, 0]);
            assert!(is_empty());
            assert_eq!(state(), TapeState::Recording);
        });
    }

    #[test]
    fn test_no_backprop_guard_restores() {
        scoped(|| {
            {
                let _guard = NoBackprop::new();
                assert_eq!(state(), TapeState::Disabled);
                record(|| Ok(()));
                {
                    let _inner = NoBackprop::when(false);
                    assert_eq!(state(), TapeState::Disabled);
                }
            }
            assert_eq!(state(), TapeState::Recording);
            assert!(is_empty());
        });
    }

    #[test]
    fn test_nothing_recorded_while_replaying() {
        scoped(|| {
            record(|| {
                assert_eq!(state(), TapeState::Replaying);
                record(|| Ok(()));
                Ok(())
            });
            backward().unwrap();
            assert!(is_empty());
        });
    }

    #[test]
    fn test_failing_closure_discards_rest() {
        scoped(|| {
            record(|| Ok(()));
            record(|| Err(crate::Error::msg("boom")));
            assert!(backward().is_err());
            assert!(is_empty());
            assert!(is_recording());
        });
    }

    #[test]
    fn test_panicking_closure_restores_recording() {
        scoped(|| {
            record(|| Ok(()));
            record(|| panic!("backward closure failed"));
            let caught = std::panic::catch_unwind(|| backward());
            assert!(caught.is_err());
            assert_eq!(state(), TapeState::Recording);
            assert!(is_empty());
            record(|| Ok(()));
            assert_eq!(len(), 1);
            clear();
        });
    }

    #[test]
    fn test_no_backprop_restores_while_unwinding() {
        scoped(|| {
            let caught = std::panic::catch_unwind(|| {
                let _guard = NoBackprop::new();
                panic!("forward failed");
            });
            assert!(caught.is_err());
            assert_eq!(state(), TapeState::Recording);
        });
    }

    #[test]
    fn test_scoped_tapes_are_independent() {
        scoped(|| {
            record(|| Ok(()));
            scoped(|| {
                assert!(is_empty());
                record(|| Ok(()));
                record(|| Ok(()));
                assert_eq!(len(), 2);
            });
            assert_eq!(len(), 1);
            clear();
        });
    }

    #[test]
    fn test_tapes_are_per_thread() {
        scoped(|| {
            record(|| Ok(()));
            let other = std::thread::spawn(len).join().unwrap();
            assert_eq!(other, 0);
            clear();
        });
    }
}
