//! The HTTP upper layer of the session engine.
//!
//! Two URL prefixes carry meaning: `/vscript/` bodies start with a VScript
//! program that runs against the server's VM, `/sinkhole/` bodies are
//! swallowed whole. Anything else closes the connection without a response.
//! Responses are `HTTP/1.1` with a mandatory `Content-Length` and an
//! explicit `Connection` disposition; download payloads stream out in
//! 64 KiB chunks behind the header.

pub mod header;

use std::sync::Arc;

use lserver_vm::{ParseOutcome, Program, VirtualMachine, SEND_BUFFER_SIZE};

use crate::session::{Feedback, Protocol, SessionIo};

use self::header::RequestHeader;

const VSCRIPT_URL: &str = "/vscript/";
const SINKHOLE_URL: &str = "/sinkhole/";

/// Minimum VScript body: `0<LF>`.
const MIN_PROGRAM_SIZE: u64 = 2;

pub struct HttpProtocol {
    vm: Arc<VirtualMachine>,
    request_header: RequestHeader,
    program: Option<Program>,
    response_sent: bool,
}

impl HttpProtocol {
    /// `vm` is the server-wide machine shared by every HTTP session.
    pub fn new(vm: Arc<VirtualMachine>) -> Self {
        Self {
            vm,
            request_header: RequestHeader::new(),
            program: None,
            response_sent: false,
        }
    }

    fn respond(&mut self, io: &mut SessionIo, code: u16, download_size: u64) {
        debug_assert!(!self.response_sent);
        let mut buf = io.prepare_send_buffer(64);
        header::write_response_header(&mut buf, code, download_size, self.request_header.keep_alive());
        io.send(buf);
        self.response_sent = true;
    }

    fn reset(&mut self, io: &mut SessionIo) {
        if let Some(mut program) = self.program.take() {
            program.reset();
        }
        self.request_header.reset();
        self.response_sent = false;
        io.reset_buffers();
    }
}

impl Protocol for HttpProtocol {
    fn start(&mut self, io: &mut SessionIo) {
        self.reset(io);
    }

    fn on_data(&mut self, io: &mut SessionIo) -> Feedback {
        if !self.request_header.is_ready() {
            io.transaction_started();
            let Some(header_end) = self.request_header.try_parse(io.data()) else {
                return Feedback::Continue;
            };
            // The engine counts header bytes into bytes_received, so the
            // expected stream length for this transaction is header + body.
            io.set_expected_data_length(header_end as u64 + self.request_header.content_length());
            io.consume(header_end);
        }

        if self.program.is_none() {
            let is_vscript = self.request_header.url().starts_with(VSCRIPT_URL);
            let is_sinkhole = self.request_header.url().starts_with(SINKHOLE_URL);

            if is_vscript {
                if self.request_header.content_length() < MIN_PROGRAM_SIZE {
                    return Feedback::Close;
                }
                match Program::try_parse(io.data()) {
                    ParseOutcome::Success {
                        mut program,
                        consumed,
                    } => {
                        io.consume(consumed);
                        program.bind_vm(self.vm.clone(), io.session_id());
                        self.program = Some(program);
                    }
                    ParseOutcome::NeedMoreData => return Feedback::Continue,
                    ParseOutcome::Failed => return Feedback::Close,
                }
            } else if is_sinkhole {
                let mut program = Program::sinkhole();
                program.bind_vm(self.vm.clone(), io.session_id());
                self.program = Some(program);
            } else {
                return Feedback::Close;
            }
        }

        let finished = {
            let program = self.program.as_mut().expect("program selected above");
            let eof = io.check_finished();
            let finished = program.feed(io.data(), eof);
            io.consume_all();
            finished
        };

        if finished {
            let response = self.program.as_ref().expect("program present").response();
            self.respond(io, response.code, response.download_size);
            Feedback::Finished
        } else {
            Feedback::Continue
        }
    }

    fn on_sent(&mut self, io: &mut SessionIo) -> Feedback {
        let has_more = self
            .program
            .as_ref()
            .map(|p| p.has_more_data())
            .unwrap_or(false);
        if has_more {
            let mut buf = io.prepare_send_buffer(SEND_BUFFER_SIZE);
            self.program
                .as_mut()
                .expect("program present")
                .get_data(&mut buf);
            io.send(buf);
            return Feedback::Data;
        }

        io.transaction_finished();
        if self.request_header.keep_alive() {
            self.reset(io);
            Feedback::Continue
        } else {
            Feedback::Close
        }
    }

    fn on_error(&mut self, error: &std::io::Error) {
        tracing::debug!("http service: {}", error);
    }

    fn on_closed(&mut self) {
        // Releases any VM resources the program still holds.
        if let Some(mut program) = self.program.take() {
            program.reset();
        }
    }
}
