//! The LServer runtime.
//!
//! A dynamically reconfigurable, multithreaded TCP application server.
//! Connections carry HTTP/1.1 request/response cycles whose bodies drive
//! VScript programs on an embedded virtual machine, letting clients
//! reproduce arbitrary server-side workloads: lock contention, CPU burn,
//! blocking waits, and sized downloads.
//!
//! # Architecture
//!
//! - [`context`] / [`context_pool`] - worker contexts (one event loop plus
//!   a thread group each) with runtime add/deactivate/reuse
//! - [`strand`] - pooled serial executors over multi-threaded contexts
//! - [`session`] / [`session_pool`] - the per-connection state machine and
//!   the pool that recycles it
//! - [`http`] - the HTTP upper layer dispatching `/vscript/` and
//!   `/sinkhole/` requests into programs
//! - [`server`] / [`manager`] - acceptor, round-robin dispatch, graceful
//!   stop, and the multi-server fleet surface
//! - [`control`] / [`portal`] - the control-plane RPC adapter and the
//!   periodic stats printer
//!
//! Accepts flow into the context pool, sessions rent strands and buffers
//! from pools, programs run on the server's shared VM inside session
//! tasks. Worker threads block on purpose during SLEEP/LOCK/LOOP ops;
//! thread counts are configuration, not heuristics.

pub mod context;
pub mod context_pool;
pub mod control;
pub mod http;
pub mod manager;
pub mod portal;
pub mod server;
pub mod session;
pub mod session_pool;
pub mod strand;

pub use context::Context;
pub use context_pool::ContextPool;
pub use control::{ControlClient, ControlRequest, ControlResponse, ControlServer};
pub use http::HttpProtocol;
pub use manager::{ServerHandle, ServerManager};
pub use portal::Portal;
pub use server::{ManagedServer, Server};
pub use session::{Feedback, Protocol, Session, SessionIo};
pub use session_pool::SessionPool;
pub use strand::Strand;
