//! Statistics types shared between the server, the portal, and the control
//! plane.
//!
//! Per-session counters use "delta" semantics: readers exchange them to zero,
//! so the session can keep counting without coordination and the aggregated
//! numbers stay additive across polls.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Per-session counters, reset on read.
#[derive(Debug, Default)]
pub struct SessionStatsDelta {
    transactions: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl SessionStatsDelta {
    pub fn add_transaction(&self) {
        self.transactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns `(transactions, bytes_received, bytes_sent)` and resets all
    /// three counters.
    pub fn take(&self) -> (u64, u64, u64) {
        (
            self.transactions.swap(0, Ordering::AcqRel),
            self.bytes_received.swap(0, Ordering::AcqRel),
            self.bytes_sent.swap(0, Ordering::AcqRel),
        )
    }
}

/// Counters owned by the acceptor.
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
}

impl ServerStats {
    pub fn add_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

/// One sampled statistics row for a single server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRecord {
    /// Sample time, microseconds since the unix epoch.
    pub time_us: u64,
    pub accepted: u64,
    pub sessions_total: u64,
    pub sessions_in_flight: u64,
    pub transactions_delta: u64,
    pub bytes_received_delta: u64,
    pub bytes_sent_delta: u64,
}

/// Control-plane view of a single worker context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextInfo {
    pub index: usize,
    pub threads: usize,
    pub active_sessions: usize,
    pub strand_pool_size: usize,
    pub strand_pool_in_flight: usize,
    pub active: bool,
}

/// Control-plane view of one server: one entry per context slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub contexts: Vec<ContextInfo>,
}

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
