//! The pool of worker contexts behind one server.
//!
//! Slots are created up front and live for the life of the pool; a
//! deactivated slot keeps its index and is preferentially reused by
//! `add_context`. Round-robin selection takes the slot `hold` atomically
//! with the pick, so a context can never be deactivated between being
//! chosen for a connection and receiving it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use lserver_common::{ContextInfo, LserverError, Poi, Result};

use crate::context::Context;

pub struct ContextPool {
    slots: RwLock<Vec<Arc<Context>>>,
    max_pool_size: usize,
    cursor: AtomicUsize,
}

impl ContextPool {
    /// Creates `pool_size` active contexts of `threads_per_context` threads
    /// each, with room to grow to `max_pool_size` slots.
    pub fn new(pool_size: usize, max_pool_size: usize, threads_per_context: usize) -> Result<Self> {
        let pool = Self {
            slots: RwLock::new(Vec::with_capacity(max_pool_size)),
            max_pool_size,
            cursor: AtomicUsize::new(0),
        };
        for _ in 0..pool_size {
            pool.add_context(threads_per_context)?;
        }
        Ok(pool)
    }

    /// Picks the next active context round-robin and takes a hold on it.
    ///
    /// The returned [`Poi`] is the slot index, used to tag pool borrows for
    /// forced recovery. Returns `None` when no slot is active (only
    /// possible during shutdown). Fairness across concurrent
    /// deactivation is approximate: the cursor may skip slots.
    pub fn get_round_robin(&self) -> Option<(Arc<Context>, Poi)> {
        let slots = self.slots.read().unwrap();
        if slots.is_empty() {
            return None;
        }
        for _ in 0..slots.len() {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % slots.len();
            let slot = &slots[idx];
            if slot.is_active() {
                slot.hold();
                return Some((slot.clone(), idx as Poi));
            }
        }
        None
    }

    /// Adds a context with `num_threads` threads: reuses a drained inactive
    /// slot when one exists, otherwise appends a new slot.
    ///
    /// # Errors
    ///
    /// [`LserverError::ContextPoolFull`] at capacity,
    /// [`LserverError::BadThreadCount`] for counts outside 1..=64.
    pub fn add_context(&self, num_threads: usize) -> Result<()> {
        let mut slots = self.slots.write().unwrap();

        for slot in slots.iter() {
            if slot.reusable() {
                return slot.reuse(num_threads);
            }
        }

        if slots.len() >= self.max_pool_size {
            return Err(LserverError::ContextPoolFull);
        }
        slots.push(Arc::new(Context::started(num_threads)?));
        Ok(())
    }

    /// Deactivates the context at `index`.
    ///
    /// # Errors
    ///
    /// Bad index, already-inactive slot, or last active slot are logic
    /// errors; [`LserverError::Busy`] reports a positive hold count and may
    /// be retried.
    pub fn deactivate_context(&self, index: usize) -> Result<()> {
        let slots = self.slots.write().unwrap();

        let slot = slots
            .get(index)
            .ok_or(LserverError::BadContextIndex(index))?;
        if !slot.is_active() {
            return Err(LserverError::ContextNotActive(index));
        }
        if slots.iter().filter(|s| s.is_active()).count() < 2 {
            return Err(LserverError::LastActiveContext);
        }

        slot.stop(false)
    }

    /// Force-stops every context. Used at server shutdown.
    ///
    /// The slot list is snapshotted first: dropping a runtime waits for its
    /// tasks' current polls, and the accept task polls `get_round_robin`,
    /// which takes the slots lock. Holding it across the stop would wedge
    /// both sides.
    pub fn stop_all(&self) {
        let slots: Vec<Arc<Context>> = self.slots.read().unwrap().clone();
        for slot in &slots {
            // Force-stop cannot fail.
            let _ = slot.stop(true);
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.is_active())
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contexts_info(&self) -> Vec<ContextInfo> {
        let slots = self.slots.read().unwrap();
        slots
            .iter()
            .enumerate()
            .map(|(i, slot)| slot.info(i))
            .collect()
    }
}
