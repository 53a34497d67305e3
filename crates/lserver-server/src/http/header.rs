//! HTTP request-header handling.
//!
//! A deliberately small parser: it waits for the `\r\n\r\n` terminator,
//! then extracts the URL, `Content-Length`, and `Connection` disposition.
//! Keep-alive defaults to off and is only enabled by an explicit
//! `Connection: Keep-Alive`. Everything else in the header is ignored.

use lserver_common::DynamicBuffer;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Default)]
pub struct RequestHeader {
    ready: bool,
    keep_alive: bool,
    content_length: u64,
    url: String,
}

impl RequestHeader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks for a complete header at the front of `data`. On success parses
    /// it and returns the offset one past the terminator (the number of
    /// bytes the caller should consume); returns `None` until the full
    /// header has arrived.
    pub fn try_parse(&mut self, data: &[u8]) -> Option<usize> {
        debug_assert!(!self.ready);
        let terminator = data
            .windows(HEADER_TERMINATOR.len())
            .position(|w| w == HEADER_TERMINATOR)?;
        let header_end = terminator + HEADER_TERMINATOR.len();

        self.parse_lines(&data[..terminator]);
        self.ready = true;
        Some(header_end)
    }

    /// Clears all state for the next transaction on the connection.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Content length from the header; zero when absent.
    pub fn content_length(&self) -> u64 {
        debug_assert!(self.ready);
        self.content_length
    }

    pub fn keep_alive(&self) -> bool {
        debug_assert!(self.ready);
        self.keep_alive
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn parse_lines(&mut self, header: &[u8]) {
        let text = String::from_utf8_lossy(header);
        let mut lines = text.split("\r\n");

        // Request line: METHOD URL VERSION. A malformed line leaves the URL
        // empty, which the dispatch layer treats as an unknown prefix.
        if let Some(request_line) = lines.next() {
            let mut parts = request_line.split_ascii_whitespace();
            let _method = parts.next();
            if let Some(url) = parts.next() {
                self.url = url.to_string();
            }
        }

        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                self.content_length = value.parse().unwrap_or(0);
            } else if name.eq_ignore_ascii_case("connection") {
                if value.eq_ignore_ascii_case("keep-alive") {
                    self.keep_alive = true;
                } else if value.eq_ignore_ascii_case("close") {
                    self.keep_alive = false;
                }
            }
        }
    }
}

/// Maps a status code to its reason phrase.
pub fn status_reason(code: u16) -> &'static str {
    match code {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Formats a response header into `buf`.
pub fn write_response_header(buf: &mut DynamicBuffer, code: u16, content_length: u64, keep_alive: bool) {
    buf.append_fmt(format_args!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        code,
        status_reason(code),
        content_length,
        if keep_alive { "Keep-Alive" } else { "Close" },
    ));
}
