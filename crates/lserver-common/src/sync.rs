//! Synchronization primitives shared by the server runtime.
//!
//! [`TriggerGuard`] is a quiescence barrier: short critical sections take a
//! scoped guard, and `trigger()` blocks until every guard has been dropped,
//! after which new guards come back inert. It protects the accept/dispatch
//! path from a concurrent server shutdown.
//!
//! [`ResettableOnceFlag`] is a reusable `call_once`: it runs a closure at most
//! once between `reset()` calls. The session engine uses it to make the
//! per-activation finalize sequence idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crate::error::{LserverError, Result};

/// Quiescence barrier between short critical sections and a one-shot trigger.
#[derive(Default)]
pub struct TriggerGuard {
    triggered: AtomicBool,
    refs: Mutex<usize>,
    cv: Condvar,
    wake: tokio::sync::Notify,
}

impl TriggerGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires a scoped guard that blocks `trigger()` for its lifetime.
    ///
    /// If the trigger has already fired, the returned guard is inert and
    /// reports `false` from [`ScopedGuard::is_active`]; the caller should
    /// bail out of its critical section.
    pub fn acquire_scoped(&self) -> ScopedGuard<'_> {
        let mut refs = self.refs.lock().unwrap();
        if self.triggered.load(Ordering::Acquire) {
            return ScopedGuard {
                owner: self,
                active: false,
            };
        }
        *refs += 1;
        drop(refs);
        ScopedGuard {
            owner: self,
            active: true,
        }
    }

    /// Fires the trigger: waits until the reference count drops to zero,
    /// then marks the guard triggered and wakes async waiters.
    ///
    /// Returns [`LserverError::AlreadyTriggered`] on a second invocation.
    pub fn trigger(&self) -> Result<()> {
        let mut refs = self.refs.lock().unwrap();
        if self.triggered.load(Ordering::Acquire) {
            return Err(LserverError::AlreadyTriggered);
        }
        while *refs > 0 {
            refs = self.cv.wait(refs).unwrap();
        }
        self.triggered.store(true, Ordering::Release);
        self.wake.notify_waiters();
        Ok(())
    }

    pub fn triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Resolves once the trigger has fired. Usable inside `select!` to wake
    /// an accept loop that is otherwise parked on I/O.
    pub async fn triggered_wait(&self) {
        loop {
            if self.triggered() {
                return;
            }
            let notified = self.wake.notified();
            if self.triggered() {
                return;
            }
            notified.await;
        }
    }

    fn release(&self) {
        let mut refs = self.refs.lock().unwrap();
        debug_assert!(*refs > 0);
        *refs -= 1;
        drop(refs);
        self.cv.notify_all();
    }
}

/// RAII token blocking its [`TriggerGuard`] from triggering while in scope.
pub struct ScopedGuard<'a> {
    owner: &'a TriggerGuard,
    active: bool,
}

impl ScopedGuard<'_> {
    /// False when the guard was acquired after the trigger fired.
    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for ScopedGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            self.owner.release();
        }
    }
}

/// A reusable run-at-most-once flag.
#[derive(Default)]
pub struct ResettableOnceFlag {
    invoked: Mutex<bool>,
}

impl ResettableOnceFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the flag so the next `run_once` invocation fires again.
    pub fn reset(&self) {
        *self.invoked.lock().unwrap() = false;
    }

    /// Runs `f` iff nothing has run since the last `reset()`.
    pub fn run_once<F: FnOnce()>(&self, f: F) {
        let mut invoked = self.invoked.lock().unwrap();
        if !*invoked {
            f();
        }
        *invoked = true;
    }
}
