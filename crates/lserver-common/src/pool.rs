//! Generic object pool with in-flight tracking and forced recovery.
//!
//! Items are borrowed in LIFO order for cache affinity. Each borrow may tag
//! the item with a pool-of-items id ([`Poi`]); [`ObjectPool::recover`] later
//! invokes the [`PoolItem::finalize`] hook on every in-flight item carrying a
//! given tag, asking it to wind down and return itself through the normal
//! lifecycle. A single asynchronous waiter can be parked on an exhausted
//! pool; the next `put_back` hands the item to it directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{LserverError, Result};

/// Pool-of-items id: an opaque tag recorded per borrowed item.
pub type Poi = u64;

/// Tag value of items currently resting in the pool.
pub const POI_INVALID: Poi = u64::MAX;

/// Contract for types managed by [`ObjectPool`].
pub trait PoolItem: Send + Sync {
    /// Force-recovery hook. Implementations should initiate an orderly
    /// shutdown that eventually returns the item via `put_back`; they must
    /// not block.
    fn finalize(&self);
}

type Factory<T> = Box<dyn Fn() -> Arc<T> + Send + Sync>;
type Waiter<T> = Box<dyn FnOnce(Arc<T>) + Send>;

struct PoolInner<T> {
    /// Idle items, borrowed back-to-front.
    idle: Vec<Arc<T>>,
    /// Every item ever created by this pool, with its current tag.
    items: HashMap<usize, (Arc<T>, Poi)>,
    in_flight: usize,
    waiter: Option<Waiter<T>>,
}

/// Bounded or unbounded LIFO pool of shared items.
pub struct ObjectPool<T: PoolItem> {
    factory: Factory<T>,
    /// Zero means unbounded.
    max_size: usize,
    inner: Mutex<PoolInner<T>>,
}

fn key<T>(item: &Arc<T>) -> usize {
    Arc::as_ptr(item) as usize
}

impl<T: PoolItem> ObjectPool<T> {
    /// Creates a pool.
    ///
    /// # Arguments
    ///
    /// * `max_size` - Maximum number of concurrently borrowed items; 0 means
    ///   unbounded.
    /// * `eager` - Pre-create `max_size` idle items up front.
    /// * `factory` - Called to create fresh items on demand.
    ///
    /// # Panics
    ///
    /// Panics when `eager` is requested on an unbounded pool; that is a
    /// programming fault, not a runtime condition.
    pub fn new<F>(max_size: usize, eager: bool, factory: F) -> Self
    where
        F: Fn() -> Arc<T> + Send + Sync + 'static,
    {
        assert!(
            !(eager && max_size == 0),
            "eager pool requires a bounded max_size"
        );

        let pool = Self {
            factory: Box::new(factory),
            max_size,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                items: HashMap::new(),
                in_flight: 0,
                waiter: None,
            }),
        };
        if eager {
            let mut inner = pool.inner.lock().unwrap();
            for _ in 0..max_size {
                let item = (pool.factory)();
                inner.items.insert(key(&item), (item.clone(), POI_INVALID));
                inner.idle.push(item);
            }
        }
        pool
    }

    /// Borrows an item, tagging it with `id`.
    ///
    /// Pops the most recently returned item, or creates a fresh one while
    /// the in-flight count is below `max_size`. Returns `None` when the pool
    /// is exhausted.
    pub fn borrow_tagged(&self, id: Poi) -> Option<Arc<T>> {
        let mut inner = self.inner.lock().unwrap();
        self.try_borrow(&mut inner, id)
    }

    /// Borrows with the default (zero) tag.
    pub fn borrow(&self) -> Option<Arc<T>> {
        self.borrow_tagged(0)
    }

    /// Borrows an item, or parks `callback` as the single waiter when the
    /// pool is exhausted. The callback is also invoked immediately when an
    /// item is available.
    ///
    /// # Errors
    ///
    /// [`LserverError::PoolWaiterOccupied`] when a waiter is already
    /// registered; this signals a programming error in the caller.
    pub fn borrow_async<F>(&self, callback: F, id: Poi) -> Result<Option<Arc<T>>>
    where
        F: FnOnce(Arc<T>) + Send + 'static,
    {
        let borrowed = {
            let mut inner = self.inner.lock().unwrap();
            match self.try_borrow(&mut inner, id) {
                Some(item) => Some((item, callback)),
                None => {
                    if inner.waiter.is_some() {
                        return Err(LserverError::PoolWaiterOccupied);
                    }
                    inner.waiter = Some(Box::new(callback));
                    None
                }
            }
        };
        // Invoked outside the lock; the callback may re-enter the pool.
        match borrowed {
            Some((item, callback)) => {
                callback(item.clone());
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    /// Returns an item to the pool.
    ///
    /// If a waiter is parked, the item is handed to it directly and stays
    /// in flight (ownership transfers). Otherwise the item's tag is
    /// invalidated and it rejoins the idle stack.
    pub fn put_back(&self, item: Arc<T>) {
        let waiter = {
            let mut inner = self.inner.lock().unwrap();
            match inner.waiter.take() {
                Some(cb) => Some(cb),
                None => {
                    debug_assert!(inner.in_flight > 0);
                    if let Some(entry) = inner.items.get_mut(&key(&item)) {
                        entry.1 = POI_INVALID;
                    }
                    inner.in_flight -= 1;
                    inner.idle.push(item.clone());
                    None
                }
            }
        };
        if let Some(cb) = waiter {
            cb(item);
        }
    }

    /// Invokes the finalize hook on every in-flight item whose recorded tag
    /// equals `id`.
    pub fn recover(&self, id: Poi) {
        let matching: Vec<Arc<T>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .items
                .values()
                .filter(|(_, tag)| *tag == id)
                .map(|(item, _)| item.clone())
                .collect()
        };
        for item in matching {
            item.finalize();
        }
    }

    /// Total number of items ever created and still tracked.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().in_flight
    }

    /// Runs `f` over every tracked item. Used by stats aggregation.
    pub fn for_each_item<F: FnMut(&Arc<T>)>(&self, mut f: F) {
        let items: Vec<Arc<T>> = {
            let inner = self.inner.lock().unwrap();
            inner.items.values().map(|(item, _)| item.clone()).collect()
        };
        for item in &items {
            f(item);
        }
    }

    fn try_borrow(&self, inner: &mut PoolInner<T>, id: Poi) -> Option<Arc<T>> {
        let item = if let Some(item) = inner.idle.pop() {
            item
        } else if self.max_size == 0 || inner.in_flight < self.max_size {
            let item = (self.factory)();
            inner.items.insert(key(&item), (item.clone(), POI_INVALID));
            item
        } else {
            return None;
        };
        if let Some(entry) = inner.items.get_mut(&key(&item)) {
            entry.1 = id;
        }
        inner.in_flight += 1;
        Some(item)
    }
}
