//! The pool of sessions behind one server.
//!
//! The factory wires each new session with a unique id and a finalize
//! callback that returns it here, closing the borrow/activate/finalize/
//! repool cycle. Aggregated statistics drain the per-session delta counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lserver_common::{BufferPool, ObjectPool, Poi};

use crate::session::{Protocol, Session};

pub struct SessionPool<P: Protocol> {
    pool: ObjectPool<Session<P>>,
}

impl<P: Protocol> SessionPool<P> {
    /// Creates the pool.
    ///
    /// # Arguments
    ///
    /// * `max_size` - Maximum concurrent sessions (0 = unbounded).
    /// * `eager` - Pre-create `max_size` sessions at startup.
    /// * `buffers` - Shared outgoing-buffer pool handed to every session.
    /// * `make_protocol` - Builds the upper-layer protocol for each session.
    pub fn new<F>(
        max_size: usize,
        eager: bool,
        buffers: Arc<BufferPool>,
        make_protocol: F,
    ) -> Arc<Self>
    where
        F: Fn() -> P + Send + Sync + 'static,
    {
        Arc::new_cyclic(|weak: &Weak<SessionPool<P>>| {
            let next_id = AtomicU64::new(1);
            let weak = weak.clone();
            let pool = ObjectPool::new(max_size, eager, move || {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let repool = weak.clone();
                Arc::new(Session::new(
                    id,
                    make_protocol(),
                    buffers.clone(),
                    Box::new(move |session| {
                        if let Some(pool) = repool.upgrade() {
                            pool.pool.put_back(session);
                        }
                    }),
                ))
            });
            Self { pool }
        })
    }

    /// Borrows a session tagged with the dispatching context's slot index,
    /// so a context's sessions can be force-recovered as a group.
    pub fn borrow(&self, id: Poi) -> Option<Arc<Session<P>>> {
        self.pool.borrow_tagged(id)
    }

    /// Requests close of every in-flight session tagged with `id`.
    pub fn recover(&self, id: Poi) {
        self.pool.recover(id);
    }

    pub fn size(&self) -> usize {
        self.pool.size()
    }

    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Drains and sums the delta counters of every session:
    /// `(transactions, bytes_received, bytes_sent)`.
    pub fn take_deltas(&self) -> (u64, u64, u64) {
        let mut totals = (0, 0, 0);
        self.pool.for_each_item(|session| {
            let (transactions, received, sent) = session.stats().take();
            totals.0 += transactions;
            totals.1 += received;
            totals.2 += sent;
        });
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Feedback, SessionIo};

    struct NullProtocol;

    impl Protocol for NullProtocol {
        fn start(&mut self, io: &mut SessionIo) {
            io.reset_buffers();
        }
        fn on_data(&mut self, _io: &mut SessionIo) -> Feedback {
            Feedback::Close
        }
        fn on_sent(&mut self, _io: &mut SessionIo) -> Feedback {
            Feedback::Close
        }
        fn on_error(&mut self, _error: &std::io::Error) {}
        fn on_closed(&mut self) {}
    }

    fn pool(max: usize, eager: bool) -> Arc<SessionPool<NullProtocol>> {
        SessionPool::new(max, eager, Arc::new(BufferPool::new()), || NullProtocol)
    }

    #[test]
    fn test_sessions_have_unique_ids() {
        let pool = pool(0, false);
        let a = pool.borrow(0).unwrap();
        let b = pool.borrow(0).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_pool_respects_max_size() {
        let pool = pool(2, false);
        let _a = pool.borrow(0).unwrap();
        let _b = pool.borrow(0).unwrap();
        assert!(pool.borrow(0).is_none());
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.in_flight(), 2);
    }

    #[test]
    fn test_eager_pool_preallocates() {
        let pool = pool(3, true);
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_take_deltas_aggregates_and_resets() {
        let pool = pool(0, false);
        let a = pool.borrow(0).unwrap();
        let b = pool.borrow(0).unwrap();
        a.stats().add_bytes_received(10);
        b.stats().add_bytes_received(5);
        b.stats().add_transaction();

        assert_eq!(pool.take_deltas(), (1, 15, 0));
        assert_eq!(pool.take_deltas(), (0, 0, 0));
    }
}
