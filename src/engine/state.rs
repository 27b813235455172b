//! Two-phase initialization of the secondary hooks.
//!
//! The compiler-info table the token and string hooks live on is only reachable through the
//! arguments of a compile call, so those hooks are installed lazily by the first compile that
//! passes through the primary hook. [`TwoPhaseInit`] makes sure exactly one thread does it.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Mutex,
};

use strum::Display;

use crate::Result;

/// Progress of a [`TwoPhaseInit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[repr(u8)]
pub enum InitPhase {
    /// Nothing has run yet
    Uninitialized = 0,
    /// The initializer is running on some thread
    Bootstrapping = 1,
    /// The initializer completed
    Active = 2,
    /// The initializer failed; it is not retried
    Failed = 3,
}

impl InitPhase {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => InitPhase::Uninitialized,
            1 => InitPhase::Bootstrapping,
            2 => InitPhase::Active,
            _ => InitPhase::Failed,
        }
    }
}

/// Runs an initializer at most once, with a lock-free fast path once it has run.
pub struct TwoPhaseInit {
    phase: AtomicU8,
    lock: Mutex<()>,
}

impl TwoPhaseInit {
    /// A fresh, uninitialized state.
    #[must_use]
    pub fn new() -> Self {
        TwoPhaseInit {
            phase: AtomicU8::new(InitPhase::Uninitialized as u8),
            lock: Mutex::new(()),
        }
    }

    /// The current phase.
    #[must_use]
    pub fn phase(&self) -> InitPhase {
        InitPhase::from_raw(self.phase.load(Ordering::Acquire))
    }

    /// Runs `init` if nothing has run yet.
    ///
    /// Threads arriving while another one is bootstrapping do not wait; they see
    /// [`InitPhase::Bootstrapping`] and carry on without the secondary hooks.
    ///
    /// # Returns
    ///
    /// `Ok(true)` if this call ran the initializer, `Ok(false)` otherwise.
    ///
    /// # Errors
    /// Propagates the initializer's error; the state becomes [`InitPhase::Failed`].
    pub fn run<F>(&self, init: F) -> Result<bool>
    where
        F: FnOnce() -> Result<()>,
    {
        if self.phase() != InitPhase::Uninitialized {
            return Ok(false);
        }

        let _guard = lock!(self.lock);
        if self.phase() != InitPhase::Uninitialized {
            return Ok(false);
        }

        self.phase
            .store(InitPhase::Bootstrapping as u8, Ordering::Release);
        match init() {
            Ok(()) => {
                self.phase.store(InitPhase::Active as u8, Ordering::Release);
                Ok(true)
            }
            Err(error) => {
                self.phase.store(InitPhase::Failed as u8, Ordering::Release);
                Err(error)
            }
        }
    }

    /// Returns to [`InitPhase::Uninitialized`], e.g. after the hooks were removed.
    pub fn reset(&self) {
        let _guard = lock!(self.lock);
        self.phase
            .store(InitPhase::Uninitialized as u8, Ordering::Release);
    }
}

impl Default for TwoPhaseInit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn runs_once_across_threads() {
        let state = Arc::new(TwoPhaseInit::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                let runs = Arc::clone(&runs);
                std::thread::spawn(move || {
                    state
                        .run(|| {
                            runs.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap()
                })
            })
            .collect();

        let ran: usize = handles
            .into_iter()
            .map(|handle| usize::from(handle.join().unwrap()))
            .sum();
        assert_eq!(ran, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(state.phase(), InitPhase::Active);
    }

    #[test]
    fn failure_is_sticky_until_reset() {
        let state = TwoPhaseInit::new();
        assert!(state.run(|| Err(Error::NotInstalled)).is_err());
        assert_eq!(state.phase(), InitPhase::Failed);
        assert!(!state.run(|| Ok(())).unwrap());

        state.reset();
        assert!(state.run(|| Ok(())).unwrap());
        assert_eq!(state.phase(), InitPhase::Active);
    }

    #[test]
    fn nested_run_is_skipped() {
        let state = TwoPhaseInit::new();
        let mut nested = None;
        state
            .run(|| {
                nested = Some(state.phase());
                Ok(())
            })
            .unwrap();
        assert_eq!(nested, Some(InitPhase::Bootstrapping));
    }
}
