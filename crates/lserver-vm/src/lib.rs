//! The VScript virtual machine.
//!
//! VScripts are tiny per-request micro-programs that shape server-side
//! behavior: grab and release named exclusive locks, burn CPU, block the
//! worker thread, and schedule a sized download. Clients use them to
//! reproduce arbitrary backend workloads against a real network stack.
//!
//! # Components
//!
//! - [`VirtualMachine`] - the shared machine: a lazily grown table of
//!   lockable resources plus sleep/spin primitives. One instance per
//!   server, shared by every session.
//! - [`Program`] - a parsed VScript: a priority queue of operations
//!   triggered by request-body byte offsets, download accounting, and
//!   cancellation.
//!
//! Lock waits block OS worker threads on purpose - this is a
//! load-simulation machine, not a pure I/O server - but poll their
//! cancellation flag every 100 ms so a closing session never wedges a
//! worker permanently.

pub mod program;
pub mod vm;

pub use program::{Op, OpKind, ParseOutcome, Program, ProgramResponse, SEND_BUFFER_SIZE};
pub use vm::VirtualMachine;
