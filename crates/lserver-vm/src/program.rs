//! VScript programs: parsing and byte-triggered execution.
//!
//! A program is a priority queue of operations, each eligible once the
//! session has fed at least `exec_point` body bytes through it. The wire
//! format is a decimal length line (`N<LF>`, no carriage return) followed by
//! N bytes of JSON: an array of single-key objects
//! `{"<exec_point>": {"<OPNAME>": "<operand>"}}` with decimal string values.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lserver_common::DynamicBuffer;

use crate::vm::VirtualMachine;

/// Download payloads are streamed in chunks of this size.
pub const SEND_BUFFER_SIZE: usize = 64 * 1024;

/// Operation kinds, in tie-break order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpKind {
    Download,
    Lock,
    Unlock,
    Sleep,
    Loop,
}

impl OpKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "DOWNLOAD" => Some(Self::Download),
            "LOCK" => Some(Self::Lock),
            "UNLOCK" => Some(Self::Unlock),
            "SLEEP" => Some(Self::Sleep),
            "LOOP" => Some(Self::Loop),
            _ => None,
        }
    }
}

/// A single operation. The derived order sorts by `exec_point` first; ties
/// resolve by kind declaration order, then operand, which makes pop order
/// deterministic for equal trigger points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Op {
    pub exec_point: u64,
    pub kind: OpKind,
    pub operand: u64,
}

/// Outcome of [`Program::try_parse`] on a byte stream.
pub enum ParseOutcome {
    /// A program was parsed; `consumed` bytes (length line + body) should be
    /// discarded from the stream.
    Success { program: Program, consumed: usize },
    /// The stream does not yet hold a complete program.
    NeedMoreData,
    /// The stream can never yield a program; the connection should close.
    Failed,
}

/// Summary of an executed program, used to frame the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramResponse {
    pub code: u16,
    pub download_size: u64,
}

pub struct Program {
    ops: BinaryHeap<Reverse<Op>>,
    bytes_processed: u64,
    download_size: u64,
    result_code: u16,
    finished: bool,
    vm: Option<Arc<VirtualMachine>>,
    session_id: u64,
    cancel: Arc<AtomicBool>,
}

impl Program {
    fn with_ops(ops: BinaryHeap<Reverse<Op>>) -> Self {
        Self {
            ops,
            bytes_processed: 0,
            download_size: 0,
            result_code: 200,
            finished: false,
            vm: None,
            session_id: 0,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The sinkhole program: no operations, accepts any amount of input,
    /// responds 200 with an empty body.
    pub fn sinkhole() -> Self {
        Self::with_ops(BinaryHeap::new())
    }

    /// Tries to parse a program from the head of `data`.
    pub fn try_parse(data: &[u8]) -> ParseOutcome {
        let Some(newline) = data.iter().position(|&b| b == b'\n') else {
            return ParseOutcome::NeedMoreData;
        };

        let header = &data[..newline];
        let Some(body_len) = std::str::from_utf8(header)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        else {
            tracing::debug!("invalid program size line");
            return ParseOutcome::Failed;
        };
        if body_len == 0 {
            tracing::debug!("invalid program size: 0");
            return ParseOutcome::Failed;
        }

        let body = &data[newline + 1..];
        if body.len() < body_len {
            return ParseOutcome::NeedMoreData;
        }

        match parse_ops(&body[..body_len]) {
            Some(ops) => ParseOutcome::Success {
                program: Self::with_ops(ops),
                consumed: newline + 1 + body_len,
            },
            None => {
                tracing::debug!("invalid program text");
                ParseOutcome::Failed
            }
        }
    }

    /// Binds the VM this program's operations run against, on behalf of
    /// `session_id`. Must happen before the first `feed`.
    pub fn bind_vm(&mut self, vm: Arc<VirtualMachine>, session_id: u64) {
        self.vm = Some(vm);
        self.session_id = session_id;
    }

    /// Feeds `data.len()` body bytes into the program and runs every
    /// operation whose trigger point has been reached, in ascending
    /// `exec_point` order. `eof` marks the end of the input stream and is
    /// returned as the finished flag.
    pub fn feed(&mut self, data: &[u8], eof: bool) -> bool {
        self.bytes_processed += data.len() as u64;

        while !self.cancel.load(Ordering::Acquire) {
            match self.ops.peek() {
                Some(Reverse(op)) if op.exec_point <= self.bytes_processed => {
                    let Reverse(op) = self.ops.pop().expect("peeked op");
                    self.run(op);
                }
                _ => break,
            }
        }

        self.finished = eof;
        self.finished
    }

    /// True when the finished program still owes the peer download bytes.
    pub fn has_more_data(&self) -> bool {
        debug_assert!(self.finished);
        self.download_size > 0
    }

    /// Moves up to 64 KiB of download payload into `buf` and decrements the
    /// remaining size. Callers check [`has_more_data`] first.
    ///
    /// [`has_more_data`]: Program::has_more_data
    pub fn get_data(&mut self, buf: &mut DynamicBuffer) {
        debug_assert!(self.finished && self.download_size > 0);
        let n = SEND_BUFFER_SIZE.min(self.download_size as usize);
        buf.fill(n);
        self.download_size -= n as u64;
    }

    /// Requests cancellation: observed by the feed loop and by a LOCK
    /// currently polling for its resource.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn response(&self) -> ProgramResponse {
        ProgramResponse {
            code: self.result_code,
            download_size: self.download_size,
        }
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }

    /// Releases resources still held on the bound VM, clears the operation
    /// queue, and unbinds the VM.
    pub fn reset(&mut self) {
        if let Some(vm) = self.vm.take() {
            vm.cleanup(self.session_id);
        }
        self.ops.clear();
    }

    fn run(&mut self, op: Op) {
        match op.kind {
            OpKind::Download => {
                self.result_code = 200;
                self.download_size = op.operand;
            }
            OpKind::Lock => {
                if let Some(vm) = &self.vm {
                    vm.lock(self.session_id, op.operand, &self.cancel);
                }
            }
            OpKind::Unlock => {
                if let Some(vm) = &self.vm {
                    vm.unlock(self.session_id, op.operand);
                }
            }
            OpKind::Sleep => {
                if let Some(vm) = &self.vm {
                    vm.sleep(op.operand);
                }
            }
            OpKind::Loop => {
                if let Some(vm) = &self.vm {
                    vm.spin(op.operand);
                }
            }
        }
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Parses the JSON body of a program. Any deviation from the wire format
/// (non-array, extra keys, unknown op name, non-decimal values) is a
/// permanent failure.
fn parse_ops(body: &[u8]) -> Option<BinaryHeap<Reverse<Op>>> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let items = value.as_array()?;

    let mut ops = BinaryHeap::with_capacity(items.len());
    for item in items {
        let entry = item.as_object()?;
        if entry.len() != 1 {
            return None;
        }
        let (point, inner) = entry.iter().next()?;
        let exec_point: u64 = point.parse().ok()?;

        let inner = inner.as_object()?;
        if inner.len() != 1 {
            return None;
        }
        let (name, operand) = inner.iter().next()?;
        let kind = OpKind::from_name(name)?;
        let operand: u64 = operand.as_str()?.parse().ok()?;

        ops.push(Reverse(Op {
            exec_point,
            kind,
            operand,
        }));
    }
    Some(ops)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(json: &str) -> Vec<u8> {
        format!("{}\n{}", json.len(), json).into_bytes()
    }

    fn parse(data: &[u8]) -> Program {
        match Program::try_parse(data) {
            ParseOutcome::Success { program, consumed } => {
                assert_eq!(consumed, data.len());
                program
            }
            _ => panic!("expected successful parse"),
        }
    }

    #[test]
    fn test_parse_download_program() {
        let mut program = parse(&wire(r#"[{"0":{"DOWNLOAD":"16"}}]"#));
        assert!(program.feed(b"", true));
        let resp = program.response();
        assert_eq!(resp.code, 200);
        assert_eq!(resp.download_size, 16);
    }

    #[test]
    fn test_parse_ignores_trailing_payload() {
        let mut data = wire(r#"[{"0":{"DOWNLOAD":"1"}}]"#);
        let wire_len = data.len();
        data.extend_from_slice(b"payload");
        match Program::try_parse(&data) {
            ParseOutcome::Success { consumed, .. } => assert_eq!(consumed, wire_len),
            _ => panic!("expected successful parse"),
        }
    }

    #[test]
    fn test_parse_needs_length_line() {
        assert!(matches!(
            Program::try_parse(b"123"),
            ParseOutcome::NeedMoreData
        ));
    }

    #[test]
    fn test_parse_needs_full_body() {
        assert!(matches!(
            Program::try_parse(b"10\n[{\"0\""),
            ParseOutcome::NeedMoreData
        ));
    }

    #[test]
    fn test_parse_rejects_zero_length() {
        assert!(matches!(Program::try_parse(b"0\n"), ParseOutcome::Failed));
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        assert!(matches!(Program::try_parse(b"x\nyy"), ParseOutcome::Failed));
    }

    #[test]
    fn test_parse_rejects_garbage_body() {
        assert!(matches!(Program::try_parse(b"3\nxxx"), ParseOutcome::Failed));
    }

    #[test]
    fn test_parse_rejects_unknown_op() {
        let data = wire(r#"[{"0":{"UPLOAD":"1"}}]"#);
        assert!(matches!(Program::try_parse(&data), ParseOutcome::Failed));
    }

    #[test]
    fn test_parse_rejects_multi_key_entries() {
        let data = wire(r#"[{"0":{"DOWNLOAD":"1"},"1":{"SLEEP":"1"}}]"#);
        assert!(matches!(Program::try_parse(&data), ParseOutcome::Failed));
    }

    #[test]
    fn test_parse_rejects_numeric_operand() {
        let data = wire(r#"[{"0":{"DOWNLOAD":16}}]"#);
        assert!(matches!(Program::try_parse(&data), ParseOutcome::Failed));
    }

    #[test]
    fn test_ops_execute_in_exec_point_order() {
        // Both eligible at once; ascending order means the later trigger
        // point's DOWNLOAD overwrites the earlier one.
        let mut program = parse(&wire(
            r#"[{"5":{"DOWNLOAD":"111"}},{"2":{"DOWNLOAD":"222"}}]"#,
        ));
        program.feed(b"12345", true);
        assert_eq!(program.response().download_size, 111);
    }

    #[test]
    fn test_equal_exec_points_pop_by_operand() {
        let mut program = parse(&wire(r#"[{"0":{"DOWNLOAD":"2"}},{"0":{"DOWNLOAD":"1"}}]"#));
        program.feed(b"", true);
        assert_eq!(program.response().download_size, 2);
    }

    #[test]
    fn test_feed_runs_only_reached_ops() {
        let mut program = parse(&wire(
            r#"[{"0":{"DOWNLOAD":"1"}},{"10":{"DOWNLOAD":"2"}}]"#,
        ));

        assert!(!program.feed(b"12345", false));
        assert!(!program.finished());
        assert_eq!(program.response().download_size, 1);
        assert_eq!(program.bytes_processed(), 5);

        assert!(program.feed(b"67890", true));
        assert!(program.finished());
        assert_eq!(program.response().download_size, 2);
    }

    #[test]
    fn test_get_data_chunks_download() {
        let mut program = parse(&wire(r#"[{"0":{"DOWNLOAD":"100000"}}]"#));
        program.feed(b"", true);

        let mut buf = DynamicBuffer::with_capacity(SEND_BUFFER_SIZE);
        assert!(program.has_more_data());
        program.get_data(&mut buf);
        assert_eq!(buf.len(), SEND_BUFFER_SIZE);

        assert!(program.has_more_data());
        program.get_data(&mut buf);
        assert_eq!(buf.len(), 100_000 - SEND_BUFFER_SIZE);
        assert!(!program.has_more_data());
    }

    #[test]
    fn test_stop_prevents_execution() {
        let mut program = parse(&wire(r#"[{"0":{"DOWNLOAD":"16"}}]"#));
        program.stop();
        program.feed(b"", true);
        assert_eq!(program.response().download_size, 0);
    }

    #[test]
    fn test_lock_unlock_through_vm() {
        let vm = Arc::new(VirtualMachine::new());
        let mut program = parse(&wire(r#"[{"0":{"LOCK":"1"}},{"1":{"UNLOCK":"1"}}]"#));
        program.bind_vm(vm.clone(), 42);
        program.feed(b"x", true);

        // Both ops ran: the resource is free again.
        let cancel = AtomicBool::new(false);
        vm.lock(7, 1, &cancel);
    }

    #[test]
    fn test_reset_releases_held_resources() {
        let vm = Arc::new(VirtualMachine::new());
        let mut program = parse(&wire(r#"[{"0":{"LOCK":"9"}}]"#));
        program.bind_vm(vm.clone(), 42);
        program.feed(b"", true);

        program.reset();

        // Cleanup released resource 9; this would block forever otherwise.
        let cancel = AtomicBool::new(false);
        vm.lock(7, 9, &cancel);
    }

    #[test]
    fn test_sinkhole_is_empty_success() {
        let mut program = Program::sinkhole();
        assert!(program.feed(b"some string", true));
        let resp = program.response();
        assert_eq!(resp.code, 200);
        assert_eq!(resp.download_size, 0);
        assert!(!program.has_more_data());
    }
}
