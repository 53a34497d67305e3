//! Worker contexts: one event loop plus its thread group.
//!
//! A [`Context`] wraps a multi-threaded tokio runtime and a strand sub-pool.
//! Sessions attach to a context for their whole lifetime (`ref`), while
//! dispatch takes short-lived `hold`s that block deactivation mid-handoff.
//! A context can be deactivated (runtime dropped, threads joined, in-flight
//! session tasks cancelled through their finalize guards) and later reused
//! with a different thread count without giving up its slot.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Runtime;

use lserver_common::{ContextInfo, LserverError, ObjectPool, Result};

use crate::strand::Strand;

const MAX_THREADS_PER_CONTEXT: usize = 64;

struct ContextCore {
    runtime: Runtime,
    num_threads: usize,
    strands: Arc<ObjectPool<Strand>>,
}

/// An event loop + thread group slot. Inactive slots hold no runtime and no
/// threads; `reuse` rebuilds both.
pub struct Context {
    core: Mutex<Option<ContextCore>>,
    active: AtomicBool,
    /// Sessions currently attached.
    ref_cnt: AtomicUsize,
    /// Transient dispatch usage; blocks deactivation while positive.
    hold_cnt: AtomicUsize,
}

impl Context {
    /// Creates an inactive slot. Call [`reuse`] to bring it up.
    ///
    /// [`reuse`]: Context::reuse
    pub fn new() -> Self {
        Self {
            core: Mutex::new(None),
            active: AtomicBool::new(false),
            ref_cnt: AtomicUsize::new(0),
            hold_cnt: AtomicUsize::new(0),
        }
    }

    /// Creates a slot and starts it with `num_threads` threads.
    pub fn started(num_threads: usize) -> Result<Self> {
        let context = Self::new();
        context.reuse(num_threads)?;
        Ok(context)
    }

    /// (Re)activates the context with a fresh runtime of `num_threads`
    /// worker threads and a fresh strand sub-pool.
    pub fn reuse(&self, num_threads: usize) -> Result<()> {
        if !(1..=MAX_THREADS_PER_CONTEXT).contains(&num_threads) {
            return Err(LserverError::BadThreadCount(num_threads));
        }

        let mut core = self.core.lock().unwrap();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(num_threads)
            .thread_name("lserver-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let strands = Arc::new(ObjectPool::new(0, false, move || {
            Arc::new(Strand::new(&handle))
        }));
        *core = Some(ContextCore {
            runtime,
            num_threads,
            strands,
        });
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    /// Deactivates the context: drops the runtime, joining its threads and
    /// cancelling in-flight tasks (whose finalize guards run during the
    /// drop). Returns [`LserverError::Busy`] while `hold_cnt` is positive,
    /// unless `force` is set.
    ///
    /// Must not be called from a task running on this context's runtime.
    pub fn stop(&self, force: bool) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if !force && self.hold_cnt.load(Ordering::Acquire) > 0 {
            return Err(LserverError::Busy);
        }
        self.active.store(false, Ordering::Release);
        if let Some(old) = core.take() {
            drop(old);
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn stopped(&self) -> bool {
        !self.is_active()
    }

    /// True when this inactive slot has fully drained and can be restarted.
    pub fn reusable(&self) -> bool {
        !self.is_active() && self.ref_cnt.load(Ordering::Acquire) == 0
    }

    pub fn ref_inc(&self) {
        self.ref_cnt.fetch_add(1, Ordering::AcqRel);
    }

    pub fn ref_dec(&self) {
        let prev = self.ref_cnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    pub fn hold(&self) {
        self.hold_cnt.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unhold(&self) {
        let prev = self.hold_cnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    pub fn ref_count(&self) -> usize {
        self.ref_cnt.load(Ordering::Acquire)
    }

    pub fn hold_count(&self) -> usize {
        self.hold_cnt.load(Ordering::Acquire)
    }

    /// Rents a strand from this context's sub-pool. Returns `None` on a
    /// single-threaded context, where the one worker thread already
    /// serializes every task, and on an inactive context.
    pub fn borrow_strand(&self) -> Option<StrandLease> {
        let core = self.core.lock().unwrap();
        let core = core.as_ref()?;
        if core.num_threads == 1 {
            return None;
        }
        // The strand pool is unbounded, so borrow always succeeds.
        let strand = core.strands.borrow()?;
        Some(StrandLease {
            strand,
            pool: core.strands.clone(),
        })
    }

    /// Spawns a session task, through `strand` when one was rented so its
    /// steps serialize with anything else posted there, directly otherwise.
    /// On an inactive context the future is dropped, which runs its
    /// finalize guard.
    pub fn spawn_session<F>(&self, strand: Option<Arc<Strand>>, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let core = self.core.lock().unwrap();
        let Some(core) = core.as_ref() else {
            return;
        };
        match strand {
            Some(strand) => strand.post(fut),
            None => {
                core.runtime.spawn(fut);
            }
        }
    }

    pub fn info(&self, index: usize) -> ContextInfo {
        let core = self.core.lock().unwrap();
        match core.as_ref() {
            Some(core) => ContextInfo {
                index,
                threads: core.num_threads,
                active_sessions: self.ref_count(),
                strand_pool_size: core.strands.size(),
                strand_pool_in_flight: core.strands.in_flight(),
                active: self.is_active(),
            },
            None => ContextInfo {
                index,
                threads: 0,
                active_sessions: self.ref_count(),
                strand_pool_size: 0,
                strand_pool_in_flight: 0,
                active: false,
            },
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// A rented strand. Returns itself to the owning context's strand pool on
/// drop, so a session cannot forget to give it back.
pub struct StrandLease {
    strand: Arc<Strand>,
    pool: Arc<ObjectPool<Strand>>,
}

impl StrandLease {
    pub fn strand(&self) -> Arc<Strand> {
        self.strand.clone()
    }
}

impl Drop for StrandLease {
    fn drop(&mut self) {
        self.pool.put_back(self.strand.clone());
    }
}
