//! The virtual machine VScripts run against.
//!
//! Resources are exclusive locks keyed by an unsigned integer, created
//! lazily on first use and never destroyed. A condition variable rather
//! than a plain mutex backs each resource so a lock taken on one worker
//! thread can be released from another, and so the holder of a dead
//! session can be evicted by [`VirtualMachine::cleanup`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

/// Cadence at which a blocked LOCK rechecks its cancellation flag.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct ResourceState {
    taken: bool,
    /// Session that currently holds the resource; consulted by cleanup.
    holder_id: u64,
}

#[derive(Default)]
struct VmResource {
    state: Mutex<ResourceState>,
    cv: Condvar,
}

/// Shared simulation machine: one instance per server, shared by all
/// sessions attached to it.
#[derive(Default)]
pub struct VirtualMachine {
    resources: RwLock<HashMap<u64, Arc<VmResource>>>,
}

impl VirtualMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires exclusive hold of resource `num` on behalf of `session_id`.
    ///
    /// Blocks the calling OS thread, waking every 100 ms to observe
    /// `cancellation`; returns without acquiring when it becomes true.
    pub fn lock(&self, session_id: u64, num: u64, cancellation: &AtomicBool) {
        let res = self.resource(num);
        let mut state = res.state.lock().unwrap();
        while !cancellation.load(Ordering::Acquire) {
            if !state.taken {
                state.taken = true;
                state.holder_id = session_id;
                return;
            }
            let (guard, _timeout) = res.cv.wait_timeout(state, LOCK_POLL_INTERVAL).unwrap();
            state = guard;
        }
    }

    /// Releases resource `num` and signals one waiter. The caller need not
    /// be the current holder; releasing a free resource is a no-op apart
    /// from the signal.
    pub fn unlock(&self, _session_id: u64, num: u64) {
        let res = self.resource(num);
        let mut state = res.state.lock().unwrap();
        state.taken = false;
        res.cv.notify_one();
    }

    /// Releases every resource held by `session_id`, signalling one waiter
    /// per released resource. Resources held by other sessions are left
    /// untouched.
    pub fn cleanup(&self, session_id: u64) {
        let resources = self.resources.read().unwrap();
        for res in resources.values() {
            let mut state = res.state.lock().unwrap();
            if state.taken && state.holder_id == session_id {
                state.taken = false;
                res.cv.notify_one();
            }
        }
    }

    /// Blocks the calling thread for `micros` microseconds.
    pub fn sleep(&self, micros: u64) {
        std::thread::sleep(Duration::from_micros(micros));
    }

    /// Spins for `iterations` compiler-opaque loop iterations.
    pub fn spin(&self, iterations: u64) {
        for i in 0..iterations {
            std::hint::black_box(i);
        }
    }

    /// Number of resources materialized so far. The table only grows.
    pub fn resource_count(&self) -> usize {
        self.resources.read().unwrap().len()
    }

    fn resource(&self, num: u64) -> Arc<VmResource> {
        if let Some(res) = self.resources.read().unwrap().get(&num) {
            return res.clone();
        }
        let mut resources = self.resources.write().unwrap();
        resources.entry(num).or_default().clone()
    }
}
