//! Shared building blocks for LServer.
//!
//! This crate carries the pieces every other crate leans on:
//!
//! - [`pool`] - generic LIFO object pool with in-flight tracking, a single
//!   parked waiter, and id-keyed forced recovery
//! - [`buffer`] - growable byte buffers, the shared buffer pool, and the
//!   per-session outgoing FIFO
//! - [`sync`] - the shutdown quiescence barrier and the resettable
//!   run-once flag
//! - [`config`] - YAML configuration with defaults and validation
//! - [`stats`] - delta counters and the serde types spoken by the control
//!   plane
//! - [`error`] - the workspace error enum and `Result` alias

pub mod buffer;
pub mod config;
pub mod error;
pub mod pool;
pub mod stats;
pub mod sync;

pub use buffer::{BufferPool, DynamicBuffer, DynamicQueue};
pub use config::Config;
pub use error::{LserverError, Result};
pub use pool::{ObjectPool, Poi, PoolItem, POI_INVALID};
pub use stats::{ContextInfo, ServerInfo, ServerStats, SessionStatsDelta, StatsRecord};
pub use sync::{ResettableOnceFlag, TriggerGuard};
