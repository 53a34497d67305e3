//! Serial executors over a multi-threaded context.
//!
//! A [`Strand`] runs posted jobs one at a time on its context's runtime, so
//! work posted through the same strand never executes concurrently even
//! when the runtime has many worker threads. Sessions on multi-threaded
//! contexts rent a strand for the length of one connection and return it to
//! the context's strand pool on finalize; single-threaded contexts skip the
//! strand entirely because their one thread already serializes everything.

use std::future::Future;
use std::pin::Pin;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use lserver_common::PoolItem;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct Strand {
    jobs: mpsc::UnboundedSender<Job>,
}

impl Strand {
    /// Creates a strand whose worker loop runs on `handle`'s runtime.
    /// The worker exits when the last sender is dropped.
    pub fn new(handle: &Handle) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        Self { jobs }
    }

    /// Posts a job. Jobs run in post order, never concurrently.
    ///
    /// Posting to a strand whose runtime has shut down silently drops the
    /// job; the runtime owner is responsible for draining sessions first.
    pub fn post<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.jobs.send(Box::pin(fut));
    }
}

impl PoolItem for Strand {
    fn finalize(&self) {}
}
