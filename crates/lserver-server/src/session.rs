//! The per-connection session engine.
//!
//! A session is a pooled object that carries its buffers and protocol state
//! across activations. Each activation binds a freshly accepted socket and a
//! worker context and runs one async task: the read loop, the protocol
//! callbacks, and the write drain all execute inside it, which is what
//! guarantees that no two completions for one session ever run concurrently.
//! On multi-threaded contexts the task is additionally posted through a
//! rented strand.
//!
//! Finalization is RAII: an [`Activation`] guard owns the session state for
//! the lifetime of the task, and its drop handler performs the single
//! finalize sequence (socket already closed, `on_closed`, strand returned,
//! context deref'd, session repooled) whether the task ran to completion,
//! hit an error, or was cancelled by a context shutdown.

use std::io;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;

use lserver_common::{
    BufferPool, DynamicBuffer, DynamicQueue, PoolItem, ResettableOnceFlag, SessionStatsDelta,
};

use crate::context::{Context, StrandLease};

/// Upper bound for a single receive.
pub const MAX_TRANSFER_SIZE: usize = 256 * 1024;

/// Minimum spare room given to a read when the expected size is unknown.
const READ_CHUNK: usize = 4096;

/// Protocol verdict after a data or send completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
    /// Re-arm the receive.
    Continue,
    /// Close the connection.
    Close,
    /// Input stream complete; a response send is in progress.
    Finished,
    /// More outgoing data was queued.
    Data,
}

/// The pluggable upper layer driven by the session engine.
pub trait Protocol: Send + 'static {
    /// Called once per activation before the first receive.
    fn start(&mut self, io: &mut SessionIo);
    /// Called after every successful receive.
    fn on_data(&mut self, io: &mut SessionIo) -> Feedback;
    /// Called when the outgoing queue has fully drained.
    fn on_sent(&mut self, io: &mut SessionIo) -> Feedback;
    /// Called on I/O errors other than a plain peer close.
    fn on_error(&mut self, error: &io::Error);
    /// Called exactly once during finalize, after the socket is gone.
    fn on_closed(&mut self);
}

/// The engine state a [`Protocol`] works against: receive buffer, outgoing
/// queue, transaction accounting.
pub struct SessionIo {
    session_id: u64,
    recv: Vec<u8>,
    outgoing: DynamicQueue,
    expected_len: u64,
    expected_set: bool,
    bytes_received: u64,
    bytes_sent: u64,
    stats: Arc<SessionStatsDelta>,
}

impl SessionIo {
    pub(crate) fn new(session_id: u64, buffers: Arc<BufferPool>, stats: Arc<SessionStatsDelta>) -> Self {
        Self {
            session_id,
            recv: Vec::new(),
            outgoing: DynamicQueue::new(buffers),
            expected_len: 0,
            expected_set: false,
            bytes_received: 0,
            bytes_sent: 0,
            stats,
        }
    }

    /// Stable identifier of the owning session, unique within the server.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn data(&self) -> &[u8] {
        &self.recv
    }

    pub fn data_size(&self) -> usize {
        self.recv.len()
    }

    /// Discards `length` bytes from the front of the receive buffer.
    pub fn consume(&mut self, length: usize) {
        self.recv.drain(..length);
    }

    /// Discards all buffered data.
    pub fn consume_all(&mut self) {
        self.recv.clear();
    }

    /// Borrows a send buffer of at least `n` bytes from the buffer pool.
    pub fn prepare_send_buffer(&self, n: usize) -> DynamicBuffer {
        self.outgoing.prepare(n)
    }

    /// Returns an unused send buffer to the pool.
    pub fn release_send_buffer(&self, buf: DynamicBuffer) {
        self.outgoing.free(buf);
    }

    /// Queues a buffer for transmission. Buffers go out in FIFO order with
    /// at most one write in flight; the engine drains the queue once the
    /// protocol returns `Finished` or `Data`.
    pub fn send(&mut self, buf: DynamicBuffer) {
        self.outgoing.push(buf);
    }

    /// Memoizes the total number of bytes this transaction is expected to
    /// carry, enabling sized reads.
    pub fn set_expected_data_length(&mut self, len: u64) {
        self.expected_len = len;
        self.expected_set = true;
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// True once the expected length is set and fully received.
    pub fn check_finished(&self) -> bool {
        self.expected_set && self.bytes_received >= self.expected_len
    }

    pub fn transaction_started(&self) {
        self.stats.add_transaction();
    }

    /// Statistics boundary only; the protocol marks the logical end of a
    /// request/response cycle here.
    pub fn transaction_finished(&self) {}

    /// Resets buffers and counters for a fresh transaction.
    pub fn reset_buffers(&mut self) {
        self.expected_len = 0;
        self.expected_set = false;
        self.bytes_received = 0;
        self.bytes_sent = 0;
        self.recv.clear();
    }

    /// Simulates a completed receive. Unit tests drive protocols with this
    /// instead of a socket.
    #[cfg(test)]
    pub(crate) fn test_push(&mut self, data: &[u8]) {
        self.recv.extend_from_slice(data);
        self.bytes_received += data.len() as u64;
    }

    #[cfg(test)]
    pub(crate) fn test_pop_outgoing(&mut self) -> Option<DynamicBuffer> {
        self.outgoing.pop()
    }
}

type FinalizeCb<P> = Box<dyn Fn(Arc<Session<P>>) + Send + Sync>;

struct SessionState<P> {
    io: SessionIo,
    protocol: P,
}

/// A pooled connection handler. Buffers and protocol state persist across
/// activations; the socket and context binding are per-activation.
pub struct Session<P: Protocol> {
    id: u64,
    stats: Arc<SessionStatsDelta>,
    state: Mutex<Option<SessionState<P>>>,
    close_once: ResettableOnceFlag,
    cancel: Mutex<Option<watch::Sender<bool>>>,
    finalized_cb: FinalizeCb<P>,
}

impl<P: Protocol> Session<P> {
    /// Creates a session. `finalized_cb` runs as the last step of every
    /// finalize and normally returns the session to its pool.
    pub fn new(id: u64, protocol: P, buffers: Arc<BufferPool>, finalized_cb: FinalizeCb<P>) -> Self {
        let stats = Arc::new(SessionStatsDelta::default());
        Self {
            id,
            stats: stats.clone(),
            state: Mutex::new(Some(SessionState {
                io: SessionIo::new(id, buffers, stats),
                protocol,
            })),
            close_once: ResettableOnceFlag::new(),
            cancel: Mutex::new(None),
            finalized_cb,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stats(&self) -> &SessionStatsDelta {
        &self.stats
    }

    /// Requests an asynchronous close of the current activation. Idempotent;
    /// a no-op when the session is idle in its pool.
    pub fn request_close(&self) {
        if let Some(cancel) = &*self.cancel.lock().unwrap() {
            let _ = cancel.send(true);
        }
    }

    /// Binds an accepted socket to `context` and starts the session task.
    ///
    /// The caller transfers its dispatch hold on `context` to the session,
    /// which releases it once the first receive is armed.
    pub fn activate(self: &Arc<Self>, context: Arc<Context>, socket: std::net::TcpStream) {
        context.ref_inc();
        let strand_lease = context.borrow_strand();
        let strand = strand_lease.as_ref().map(|lease| lease.strand());
        self.close_once.reset();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        *self.cancel.lock().unwrap() = Some(cancel_tx);

        let state = self
            .state
            .lock()
            .unwrap()
            .take()
            .expect("session activated while already active");

        let activation = Activation {
            session: self.clone(),
            context: context.clone(),
            strand_lease,
            state: Some(state),
            held: true,
        };
        context.spawn_session(strand, drive(activation, socket, cancel_rx));
    }
}

impl<P: Protocol> PoolItem for Session<P> {
    fn finalize(&self) {
        self.request_close();
    }
}

/// RAII owner of one activation. Dropping it - on normal completion, error,
/// or task cancellation - performs the finalize sequence exactly once.
struct Activation<P: Protocol> {
    session: Arc<Session<P>>,
    context: Arc<Context>,
    strand_lease: Option<StrandLease>,
    state: Option<SessionState<P>>,
    held: bool,
}

impl<P: Protocol> Activation<P> {
    fn state_mut(&mut self) -> &mut SessionState<P> {
        self.state.as_mut().expect("state owned by activation")
    }

    fn split(&mut self) -> (&mut SessionIo, &mut P) {
        let state = self.state.as_mut().expect("state owned by activation");
        (&mut state.io, &mut state.protocol)
    }

    fn release_hold(&mut self) {
        if self.held {
            self.held = false;
            self.context.unhold();
        }
    }
}

impl<P: Protocol> Drop for Activation<P> {
    fn drop(&mut self) {
        if self.held {
            self.held = false;
            self.context.unhold();
        }
        if let Some(mut state) = self.state.take() {
            self.session
                .close_once
                .run_once(|| state.protocol.on_closed());
            state.io.outgoing.clear();
            *self.session.state.lock().unwrap() = Some(state);
        }
        // Returns the strand to the context's sub-pool.
        self.strand_lease = None;
        self.context.ref_dec();
        *self.session.cancel.lock().unwrap() = None;
        (self.session.finalized_cb)(self.session.clone());
    }
}

fn is_peer_close(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::UnexpectedEof
}

/// Resolves when the activation's close channel fires.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone: no close will ever arrive.
            std::future::pending::<()>().await;
        }
    }
}

/// Reads until at least `need` bytes have been appended to `buf`.
async fn read_at_least(
    rd: &mut OwnedReadHalf,
    buf: &mut Vec<u8>,
    need: usize,
) -> io::Result<usize> {
    let mut got = 0;
    while got < need {
        let start = buf.len();
        let room = (need - got).max(READ_CHUNK).min(MAX_TRANSFER_SIZE);
        buf.resize(start + room, 0);
        match rd.read(&mut buf[start..]).await {
            Ok(0) => {
                buf.truncate(start);
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
            }
            Ok(n) => {
                buf.truncate(start + n);
                got += n;
            }
            Err(e) => {
                buf.truncate(start);
                return Err(e);
            }
        }
    }
    Ok(got)
}

enum WriteOutcome {
    NextTransaction,
    Close,
}

/// Writes one buffer fully. A close request observed mid-write flips
/// `shutdown_pending` instead of aborting, so queued data drains first.
async fn write_buffer(
    wr: &mut OwnedWriteHalf,
    buf: &DynamicBuffer,
    cancel: &mut watch::Receiver<bool>,
    shutdown_pending: &mut bool,
) -> io::Result<()> {
    let mut off = 0;
    while off < buf.len() {
        let res = if *shutdown_pending {
            wr.write(&buf.data()[off..]).await
        } else {
            tokio::select! {
                r = wr.write(&buf.data()[off..]) => r,
                _ = cancelled(cancel) => {
                    *shutdown_pending = true;
                    continue;
                }
            }
        };
        let n = res?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write stalled"));
        }
        off += n;
    }
    Ok(())
}

/// Drains the outgoing queue, then loops on `on_sent` until the protocol
/// stops producing data.
async fn write_phase<P: Protocol>(
    act: &mut Activation<P>,
    wr: &mut OwnedWriteHalf,
    cancel: &mut watch::Receiver<bool>,
) -> WriteOutcome {
    let mut shutdown_pending = false;
    loop {
        while let Some(buf) = act.state_mut().io.outgoing.pop() {
            match write_buffer(wr, &buf, cancel, &mut shutdown_pending).await {
                Ok(()) => {
                    let state = act.state_mut();
                    state.io.bytes_sent += buf.len() as u64;
                    state.io.stats.add_bytes_sent(buf.len() as u64);
                    state.io.outgoing.free(buf);
                }
                Err(e) => {
                    let state = act.state_mut();
                    state.io.outgoing.free(buf);
                    state.io.outgoing.clear();
                    if !is_peer_close(&e) {
                        state.protocol.on_error(&e);
                    }
                    return WriteOutcome::Close;
                }
            }
        }

        // Queue drained. A close requested during the drain goes through
        // now, exactly once.
        if shutdown_pending {
            return WriteOutcome::Close;
        }

        let feedback = {
            let (io, protocol) = act.split();
            protocol.on_sent(io)
        };
        match feedback {
            Feedback::Data => continue,
            Feedback::Continue => return WriteOutcome::NextTransaction,
            Feedback::Close => return WriteOutcome::Close,
            Feedback::Finished => unreachable!("on_sent never returns Finished"),
        }
    }
}

/// The session task: read loop, protocol dispatch, write drain.
async fn drive<P: Protocol>(
    mut act: Activation<P>,
    socket: std::net::TcpStream,
    mut cancel: watch::Receiver<bool>,
) {
    let stream = match TcpStream::from_std(socket) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("failed to register accepted socket: {}", e);
            return;
        }
    };
    let (mut rd, mut wr) = stream.into_split();

    {
        let (io, protocol) = act.split();
        protocol.start(io);
    }
    // The receive is armed from here on; the acceptor's hold can go.
    act.release_hold();

    'transactions: loop {
        let need = {
            let state = act.state_mut();
            if state.io.expected_set {
                let remaining = state.io.expected_len.saturating_sub(state.io.bytes_received);
                if remaining == 0 {
                    // A receive was armed with nothing left to expect.
                    let e = io::Error::new(io::ErrorKind::InvalidData, "bad reception state");
                    state.protocol.on_error(&e);
                    None
                } else {
                    Some(remaining.min(MAX_TRANSFER_SIZE as u64) as usize)
                }
            } else {
                Some(1)
            }
        };
        let Some(need) = need else {
            break 'transactions;
        };

        let read = {
            let state = act.state.as_mut().expect("state owned by activation");
            tokio::select! {
                r = read_at_least(&mut rd, &mut state.io.recv, need) => Some(r),
                _ = cancelled(&mut cancel) => None,
            }
        };
        let n = match read {
            None => break 'transactions,
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                if !is_peer_close(&e) {
                    act.state_mut().protocol.on_error(&e);
                }
                break 'transactions;
            }
        };
        {
            let state = act.state_mut();
            state.io.bytes_received += n as u64;
            state.io.stats.add_bytes_received(n as u64);
        }

        let feedback = {
            let (io, protocol) = act.split();
            protocol.on_data(io)
        };
        match feedback {
            Feedback::Continue => continue 'transactions,
            Feedback::Close => break 'transactions,
            Feedback::Finished | Feedback::Data => {
                match write_phase(&mut act, &mut wr, &mut cancel).await {
                    WriteOutcome::NextTransaction => continue 'transactions,
                    WriteOutcome::Close => break 'transactions,
                }
            }
        }
    }
    // rd/wr drop here closing the socket, then `act` finalizes.
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Echoes one message back, then closes.
    struct EchoOnce {
        closed: Arc<AtomicUsize>,
    }

    impl Protocol for EchoOnce {
        fn start(&mut self, io: &mut SessionIo) {
            io.reset_buffers();
        }

        fn on_data(&mut self, io: &mut SessionIo) -> Feedback {
            let mut buf = io.prepare_send_buffer(io.data_size());
            buf.extend_from_slice(io.data());
            io.consume_all();
            io.send(buf);
            Feedback::Finished
        }

        fn on_sent(&mut self, _io: &mut SessionIo) -> Feedback {
            Feedback::Close
        }

        fn on_error(&mut self, _error: &io::Error) {}

        fn on_closed(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_session_echoes_and_finalizes_once() {
        let context = Arc::new(crate::context::Context::started(1).unwrap());
        let buffers = Arc::new(BufferPool::new());
        let closed = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicUsize::new(0));

        let fin = finalized.clone();
        let session = Arc::new(Session::new(
            1,
            EchoOnce {
                closed: closed.clone(),
            },
            buffers,
            Box::new(move |_s| {
                fin.fetch_add(1, Ordering::SeqCst);
            }),
        ));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        context.hold();
        session.activate(context.clone(), accepted);

        client.write_all(b"hello").unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"hello");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while finalized.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(context.ref_count(), 0);
        assert_eq!(context.hold_count(), 0);

        // Repeated close requests after finalize are harmless no-ops.
        session.request_close();
        session.request_close();
        assert_eq!(finalized.load(Ordering::SeqCst), 1);

        let (_transactions, bytes_received, bytes_sent) = session.stats().take();
        assert_eq!(bytes_received, 5);
        assert_eq!(bytes_sent, 5);

        context.stop(true).unwrap();
    }

    #[test]
    fn test_external_close_interrupts_idle_read() {
        let context = Arc::new(crate::context::Context::started(1).unwrap());
        let buffers = Arc::new(BufferPool::new());
        let closed = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicUsize::new(0));

        let fin = finalized.clone();
        let session = Arc::new(Session::new(
            2,
            EchoOnce {
                closed: closed.clone(),
            },
            buffers,
            Box::new(move |_s| {
                fin.fetch_add(1, Ordering::SeqCst);
            }),
        ));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        context.hold();
        session.activate(context.clone(), accepted);

        // No data sent; the session parks in its read. Force recovery.
        std::thread::sleep(Duration::from_millis(50));
        session.finalize();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while finalized.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        drop(client);
        context.stop(true).unwrap();
    }
}
