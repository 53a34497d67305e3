//! The TCP server: listener, dispatch loop, graceful stop.
//!
//! Dispatch picks a worker context round-robin (taking a hold), accepts a
//! connection on it, then borrows a session tagged with the context's slot
//! index and hands both over. The whole handoff runs under a scoped guard
//! of the shutdown trigger, so `stop()` can wait out in-flight handoffs
//! before tearing contexts down.
//!
//! Accepted sockets are deregistered from the acceptor's runtime and
//! re-registered on the chosen worker context when the session task first
//! polls, which keeps each connection's I/O on its own context.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};

use lserver_common::{
    Config, LserverError, Result, ServerInfo, ServerStats, StatsRecord, TriggerGuard,
};

use crate::context::Context;
use crate::context_pool::ContextPool;
use crate::session::Protocol;
use crate::session_pool::SessionPool;

/// The surface the manager and control plane use, independent of the
/// concrete protocol type.
pub trait ManagedServer: Send + Sync {
    fn stop(&self);
    fn wait(&self);
    fn add_context(&self, num_threads: usize) -> Result<()>;
    fn deactivate_context(&self, index: usize) -> Result<()>;
    fn server_info(&self) -> ServerInfo;
    fn stats(&self) -> StatsRecord;
    fn local_addr(&self) -> SocketAddr;
}

pub struct Server<P: Protocol> {
    workers: Arc<ContextPool>,
    sessions: Arc<SessionPool<P>>,
    /// Dedicated acceptor context, when configured. Otherwise the acceptor
    /// runs on a worker context which keeps a permanent hold, protecting
    /// its loop from deactivation.
    acceptor: Option<Arc<Context>>,
    shutdown: Arc<TriggerGuard>,
    stats: Arc<ServerStats>,
    local_addr: SocketAddr,
    accept_done: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
}

impl<P: Protocol> Server<P> {
    /// Binds the listen endpoint, starts the worker pool, and begins
    /// dispatching. Returns once the listener is live (or failed to bind).
    pub fn start<F>(config: Config, make_protocol: F) -> Result<Arc<Self>>
    where
        F: Fn() -> P + Send + Sync + 'static,
    {
        let addr = config.listen_addr()?;
        let workers = Arc::new(ContextPool::new(
            config.concurrency.num_workers,
            config.concurrency.max_num_workers,
            config.concurrency.num_threads_per_worker,
        )?);
        let buffers = Arc::new(lserver_common::BufferPool::new());
        let sessions = SessionPool::new(
            config.sessions.max_session_pool_size,
            config.sessions.eager_session_pool,
            buffers,
            make_protocol,
        );

        let (acceptor, host) = if config.listen.separate_acceptor_thread {
            let context = Arc::new(Context::started(1)?);
            (Some(context.clone()), context)
        } else {
            let (context, _) = workers
                .get_round_robin()
                .ok_or_else(|| LserverError::Listen("no active worker context".to_string()))?;
            // The hold is kept for the server's lifetime: deactivating the
            // context hosting the accept loop would kill the acceptor.
            (None, context)
        };

        let shutdown = Arc::new(TriggerGuard::new());
        let stats = Arc::new(ServerStats::default());
        let linger = config
            .networking
            .socket_close_linger
            .then(|| Duration::from_secs(config.networking.socket_close_linger_timeout));
        let reuse_address = config.listen.reuse_address;

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        {
            let workers = workers.clone();
            let sessions = sessions.clone();
            let shutdown = shutdown.clone();
            let stats = stats.clone();
            host.spawn_session(None, async move {
                let listener = match bind_listener(addr, reuse_address) {
                    Ok(listener) => listener,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let local = match listener.local_addr() {
                    Ok(local) => local,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(local));
                accept_loop(listener, workers, sessions, shutdown, stats, linger).await;
                drop(done_tx);
            });
        }

        let local_addr = ready_rx
            .recv()
            .map_err(|_| LserverError::Listen("acceptor task did not start".to_string()))?
            .map_err(|e| LserverError::Listen(format!("cannot listen on {}: {}", addr, e)))?;
        tracing::info!("listening on {}", local_addr);

        Ok(Arc::new(Self {
            workers,
            sessions,
            acceptor,
            shutdown,
            stats,
            local_addr,
            accept_done: Mutex::new(Some(done_rx)),
        }))
    }
}

impl<P: Protocol> ManagedServer for Server<P> {
    /// Graceful stop: fire the shutdown trigger (waits for in-flight
    /// dispatch handoffs and wakes the accept loop), then force-stop the
    /// contexts, cancelling remaining session tasks through their finalize
    /// guards.
    fn stop(&self) {
        if self.shutdown.trigger().is_err() {
            return; // already stopped
        }
        if let Some(acceptor) = &self.acceptor {
            let _ = acceptor.stop(true);
        }
        self.workers.stop_all();
        tracing::info!("workers pool stopped");
    }

    fn wait(&self) {
        let receiver = self.accept_done.lock().unwrap().take();
        if let Some(receiver) = receiver {
            let _ = receiver.recv();
        }
    }

    fn add_context(&self, num_threads: usize) -> Result<()> {
        self.workers.add_context(num_threads)
    }

    fn deactivate_context(&self, index: usize) -> Result<()> {
        self.workers.deactivate_context(index)
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            contexts: self.workers.contexts_info(),
        }
    }

    fn stats(&self) -> StatsRecord {
        let (transactions, received, sent) = self.sessions.take_deltas();
        StatsRecord {
            time_us: lserver_common::stats::now_micros(),
            accepted: self.stats.accepted(),
            sessions_total: self.sessions.size() as u64,
            sessions_in_flight: self.sessions.in_flight() as u64,
            transactions_delta: transactions,
            bytes_received_delta: received,
            bytes_sent_delta: sent,
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn bind_listener(addr: SocketAddr, reuse_address: bool) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(reuse_address)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

async fn accept_loop<P: Protocol>(
    listener: TcpListener,
    workers: Arc<ContextPool>,
    sessions: Arc<SessionPool<P>>,
    shutdown: Arc<TriggerGuard>,
    stats: Arc<ServerStats>,
    linger: Option<Duration>,
) {
    loop {
        let Some((context, poi)) = workers.get_round_robin() else {
            tracing::error!("no active worker context, acceptor exiting");
            break;
        };

        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = shutdown.triggered_wait() => {
                context.unhold();
                break;
            }
        };

        let scoped = shutdown.acquire_scoped();
        if !scoped.is_active() {
            context.unhold();
            break;
        }

        match accepted {
            Ok((stream, peer)) => {
                if let Some(linger) = linger {
                    if let Err(e) = stream.set_linger(Some(linger)) {
                        tracing::debug!("set_linger failed for {}: {}", peer, e);
                    }
                }
                match stream.into_std() {
                    Ok(socket) => match sessions.borrow(poi) {
                        Some(session) => {
                            // The session releases the context hold once its
                            // first receive is armed.
                            session.activate(context.clone(), socket);
                            stats.add_accepted();
                        }
                        None => {
                            tracing::debug!("session pool exhausted, dropping {}", peer);
                            context.unhold();
                        }
                    },
                    Err(e) => {
                        tracing::debug!("cannot detach accepted socket: {}", e);
                        context.unhold();
                    }
                }
            }
            Err(e) => {
                context.unhold();
                tracing::warn!("accept failed: {}", e);
            }
        }
    }
}
