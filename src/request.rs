//! Incremental HTTP/1.1 request decoder. Fed accumulated bytes, it reports
//! how many it consumed so the caller can shift its read buffer, and whether
//! the request is complete, still growing, or malformed.

use std::collections::HashMap;
use std::str::FromStr;

use crate::config::Method;
use crate::util::find;

/// Ceiling for the request line and for any single header line.
pub const MAX_LINE: usize = 8192;
/// Ceiling on the number of headers.
pub const MAX_HEADERS: usize = 100;
/// Parser body ceiling before the routed location's limit is known.
const DEFAULT_BODY_CEILING: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestLine,
    Headers,
    Body,
    ChunkSize,
    ChunkData,
    ChunkTrailer,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    Incomplete,
    Success,
    Failed,
}

#[derive(Debug)]
pub struct Request {
    method: Option<Method>,
    uri: String,
    path: String,
    query: String,
    version: String,
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
    content_length: u64,
    chunked: bool,
    chunk_size: u64,
    chunk_read: u64,
    state: State,
    error: String,
    body_too_large: bool,
    max_body: u64,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Request {
            method: None,
            uri: String::new(),
            path: String::new(),
            query: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            content_length: 0,
            chunked: false,
            chunk_size: 0,
            chunk_read: 0,
            state: State::RequestLine,
            error: String::new(),
            body_too_large: false,
            max_body: DEFAULT_BODY_CEILING,
        }
    }

    /// Reset in place for keep-alive reuse.
    pub fn reset(&mut self) {
        *self = Request::new();
    }

    pub fn method(&self) -> Method {
        self.method.unwrap_or(Method::Get)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Look up a header by name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// All headers, keys lowercased.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn error_message(&self) -> &str {
        &self.error
    }

    pub fn body_too_large(&self) -> bool {
        self.body_too_large
    }

    /// True once the header section has been fully consumed.
    pub fn headers_complete(&self) -> bool {
        !matches!(self.state, State::RequestLine | State::Headers)
    }

    /// Host header without any port suffix.
    pub fn host(&self) -> String {
        let host = self.header("host").unwrap_or("");
        match host.find(':') {
            Some(colon) => host[..colon].to_string(),
            None => host.to_string(),
        }
    }

    /// HTTP/1.1 defaults to keep-alive unless `Connection: close`; HTTP/1.0
    /// is close-by-default unless `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        let connection = self
            .header("connection")
            .map(str::to_lowercase)
            .unwrap_or_default();
        if self.version == "HTTP/1.0" {
            connection == "keep-alive"
        } else {
            connection != "close"
        }
    }

    /// Lower the body ceiling once routing has identified the location. Takes
    /// effect immediately so an oversized Content-Length fails before any
    /// body byte is buffered.
    pub fn set_body_limit(&mut self, limit: u64) {
        self.max_body = limit;
        if self.headers_complete() && !self.chunked && self.content_length > limit {
            self.fail_body_too_large();
        }
        if self.body.len() as u64 > limit {
            self.fail_body_too_large();
        }
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.state = State::Error;
        self.error = message.into();
    }

    fn fail_body_too_large(&mut self) {
        self.body_too_large = true;
        self.fail("body exceeds maximum size");
    }

    /// Feed accumulated bytes. Returns the parse status and how many bytes
    /// were consumed; the caller drains that many from its buffer.
    pub fn parse(&mut self, data: &[u8]) -> (ParseStatus, usize) {
        let mut pos = 0;

        while pos < data.len() && !matches!(self.state, State::Complete | State::Error) {
            match self.state {
                State::RequestLine => match take_line(&data[pos..]) {
                    None => {
                        if data.len() - pos > MAX_LINE {
                            self.fail("request line too long");
                        }
                        break;
                    }
                    Some((line, after)) => {
                        if line.len() > MAX_LINE {
                            self.fail("request line too long");
                            break;
                        }
                        self.parse_request_line(line);
                        pos += after;
                    }
                },
                State::Headers => match take_line(&data[pos..]) {
                    None => {
                        if data.len() - pos > MAX_LINE {
                            self.fail("header line too long");
                        }
                        break;
                    }
                    Some((line, after)) => {
                        if line.len() > MAX_LINE {
                            self.fail("header line too long");
                            break;
                        }
                        pos += after;
                        if line.is_empty() {
                            self.finish_headers();
                        } else {
                            self.parse_header_line(line);
                        }
                    }
                },
                State::Body => {
                    let remaining = (self.content_length - self.body.len() as u64) as usize;
                    let take = remaining.min(data.len() - pos);
                    self.body.extend_from_slice(&data[pos..pos + take]);
                    pos += take;
                    if self.body.len() as u64 >= self.content_length {
                        self.state = State::Complete;
                    }
                }
                State::ChunkSize => match take_line(&data[pos..]) {
                    None => break,
                    Some((line, after)) => {
                        pos += after;
                        self.parse_chunk_size(line);
                    }
                },
                State::ChunkData => {
                    let remaining = (self.chunk_size - self.chunk_read) as usize;
                    let take = remaining.min(data.len() - pos);
                    if self.body.len() as u64 + take as u64 > self.max_body {
                        self.fail_body_too_large();
                        break;
                    }
                    self.body.extend_from_slice(&data[pos..pos + take]);
                    self.chunk_read += take as u64;
                    pos += take;
                    if self.chunk_read >= self.chunk_size {
                        // The chunk terminator must follow the data.
                        if data.len() - pos < 2 {
                            break;
                        }
                        if &data[pos..pos + 2] != b"\r\n" {
                            self.fail("invalid chunk terminator");
                            break;
                        }
                        pos += 2;
                        self.state = State::ChunkSize;
                    }
                }
                State::ChunkTrailer => match take_line(&data[pos..]) {
                    None => break,
                    Some((line, after)) => {
                        pos += after;
                        if line.is_empty() {
                            self.state = State::Complete;
                        }
                    }
                },
                State::Complete | State::Error => unreachable!(),
            }
        }

        let status = match self.state {
            State::Complete => ParseStatus::Success,
            State::Error => ParseStatus::Failed,
            _ => ParseStatus::Incomplete,
        };
        (status, pos)
    }

    fn parse_request_line(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line).into_owned();
        let mut words = line.split(' ');

        let method = words.next().unwrap_or("");
        match Method::from_str(method) {
            Ok(method) => self.method = Some(method),
            Err(()) => {
                self.fail(format!("invalid HTTP method: {}", method));
                return;
            }
        }

        let uri = match words.next() {
            Some(uri) if !uri.is_empty() => uri,
            _ => {
                self.fail("request line is missing the URI");
                return;
            }
        };
        self.uri = uri.to_string();
        match uri.find('?') {
            Some(mark) => {
                self.path = uri[..mark].to_string();
                self.query = uri[mark + 1..].to_string();
            }
            None => {
                self.path = uri.to_string();
                self.query = String::new();
            }
        }

        let version = match words.next() {
            Some(version) => version,
            None => {
                self.fail("request line is missing the HTTP version");
                return;
            }
        };
        if version != "HTTP/1.0" && version != "HTTP/1.1" {
            self.fail(format!("unsupported HTTP version: {}", version));
            return;
        }
        self.version = version.to_string();

        if words.next().is_some() {
            self.fail("malformed request line");
            return;
        }
        self.state = State::Headers;
    }

    fn parse_header_line(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line).into_owned();
        let colon = match line.find(':') {
            Some(colon) => colon,
            None => {
                self.fail("header line is missing a colon");
                return;
            }
        };
        let name = line[..colon].to_lowercase();
        let value = line[colon + 1..].trim().to_string();

        if name == "content-length" {
            match value.parse::<u64>() {
                Ok(length) => self.content_length = length,
                Err(_) => {
                    self.fail("invalid Content-Length value");
                    return;
                }
            }
        }

        self.headers.insert(name, value);
        if self.headers.len() > MAX_HEADERS {
            self.fail("too many headers");
        }
    }

    fn finish_headers(&mut self) {
        let transfer_encoding = self
            .header("transfer-encoding")
            .map(str::to_lowercase)
            .unwrap_or_default();
        if transfer_encoding == "chunked" {
            self.chunked = true;
            self.state = State::ChunkSize;
        } else if self.content_length > 0 {
            if self.content_length > self.max_body {
                self.body_too_large = true;
                self.fail("Content-Length exceeds maximum body size");
                return;
            }
            self.state = State::Body;
        } else {
            self.state = State::Complete;
        }
    }

    fn parse_chunk_size(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line).into_owned();
        let size_text = match line.find(';') {
            Some(semicolon) => &line[..semicolon],
            None => line.as_str(),
        };
        let size_text = size_text.trim();
        match u64::from_str_radix(size_text, 16) {
            Ok(0) => self.state = State::ChunkTrailer,
            Ok(size) => {
                self.chunk_size = size;
                self.chunk_read = 0;
                self.state = State::ChunkData;
            }
            Err(_) => self.fail("invalid chunk size"),
        }
    }
}

/// Split off one CRLF-terminated line. Returns the line (without CRLF) and
/// the number of bytes it spans including the terminator.
fn take_line(data: &[u8]) -> Option<(&[u8], usize)> {
    let end = find(b"\r\n", data)?;
    Some((&data[..end], end + 2))
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    fn parse_all(request: &mut Request, stream: &[u8]) -> ParseStatus {
        let mut buffer = stream.to_vec();
        loop {
            let (status, consumed) = request.parse(&buffer);
            buffer.drain(..consumed);
            if status != ParseStatus::Incomplete || consumed == 0 {
                return status;
            }
        }
    }

    #[test]
    fn parses_a_simple_get() {
        let mut request = Request::new();
        let status = parse_all(
            &mut request,
            b"GET /index.html?x=1 HTTP/1.1\r\nHost: localhost\r\n\r\n",
        );
        assert_eq!(status, ParseStatus::Success);
        assert_eq!(request.method(), Method::Get);
        assert_eq!(request.path(), "/index.html");
        assert_eq!(request.query(), "x=1");
        assert_eq!(request.version(), "HTTP/1.1");
        assert_eq!(request.header("HOST"), Some("localhost"));
        assert!(request.is_keep_alive());
    }

    #[test_case(1)]
    #[test_case(2)]
    #[test_case(3)]
    #[test_case(7)]
    #[test_case(64)]
    fn chunk_split_streams_parse_identically(step: usize) {
        let stream: &[u8] =
            b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello world";
        let mut whole = Request::new();
        assert_eq!(parse_all(&mut whole, stream), ParseStatus::Success);

        let mut split = Request::new();
        let mut buffer = Vec::new();
        let mut status = ParseStatus::Incomplete;
        for piece in stream.chunks(step) {
            buffer.extend_from_slice(piece);
            let (s, consumed) = split.parse(&buffer);
            buffer.drain(..consumed);
            status = s;
        }
        assert_eq!(status, ParseStatus::Success);
        assert_eq!(split.method(), whole.method());
        assert_eq!(split.path(), whole.path());
        assert_eq!(split.body, whole.body);
        assert_eq!(split.header("content-length"), whole.header("content-length"));
    }

    #[test]
    fn decodes_chunked_bodies() {
        let mut request = Request::new();
        let status = parse_all(
            &mut request,
            b"POST /u HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
              5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nTrailer: v\r\n\r\n",
        );
        assert_eq!(status, ParseStatus::Success);
        assert!(request.is_chunked());
        assert_eq!(request.body, b"hello world");
    }

    #[test]
    fn chunk_without_terminator_fails() {
        let mut request = Request::new();
        let status = parse_all(
            &mut request,
            b"POST /u HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhelloXX",
        );
        assert_eq!(status, ParseStatus::Failed);
    }

    #[test]
    fn oversized_request_line_fails() {
        let mut request = Request::new();
        let line = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(MAX_LINE));
        let status = parse_all(&mut request, line.as_bytes());
        assert_eq!(status, ParseStatus::Failed);
    }

    #[test]
    fn hundred_and_first_header_fails() {
        let mut stream = String::from("GET / HTTP/1.1\r\n");
        for i in 0..=MAX_HEADERS {
            stream.push_str(&format!("x-header-{}: {}\r\n", i, i));
        }
        stream.push_str("\r\n");
        let mut request = Request::new();
        assert_eq!(parse_all(&mut request, stream.as_bytes()), ParseStatus::Failed);
        assert_eq!(request.error_message(), "too many headers");
    }

    #[test]
    fn content_length_over_limit_fails_before_body() {
        let mut request = Request::new();
        let (status, _) = request.parse(b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\n");
        assert_eq!(status, ParseStatus::Incomplete);
        request.set_body_limit(10);
        assert!(request.body_too_large());
        assert!(request.body.is_empty());
    }

    #[test]
    fn chunked_body_over_limit_fails() {
        let mut request = Request::new();
        let (_, consumed) = request.parse(
            b"POST /u HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert!(consumed > 0);
        request.set_body_limit(4);
        let (status, _) = request.parse(b"5\r\nhello\r\n0\r\n\r\n");
        assert_eq!(status, ParseStatus::Failed);
        assert!(request.body_too_large());
    }

    #[test_case("PUT / HTTP/1.1\r\n\r\n" ; "unsupported method")]
    #[test_case("GET / HTTP/2.0\r\n\r\n" ; "unsupported version")]
    #[test_case("GET /\r\n\r\n" ; "missing version")]
    #[test_case("GET / HTTP/1.1 extra\r\n\r\n" ; "trailing token")]
    #[test_case("GET / HTTP/1.1\r\nno-colon-here\r\n\r\n" ; "header missing colon")]
    #[test_case("POST / HTTP/1.1\r\nContent-Length: ten\r\n\r\n" ; "bad content length")]
    fn rejects(stream: &str) {
        let mut request = Request::new();
        assert_eq!(parse_all(&mut request, stream.as_bytes()), ParseStatus::Failed);
    }

    #[test]
    fn keep_alive_follows_version_defaults() {
        let mut request = Request::new();
        parse_all(&mut request, b"GET / HTTP/1.0\r\n\r\n");
        assert!(!request.is_keep_alive());

        let mut request = Request::new();
        parse_all(
            &mut request,
            b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",
        );
        assert!(request.is_keep_alive());

        let mut request = Request::new();
        parse_all(&mut request, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(!request.is_keep_alive());
    }

    #[test]
    fn reset_allows_reuse() {
        let mut request = Request::new();
        parse_all(&mut request, b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n");
        request.reset();
        let status = parse_all(&mut request, b"GET /b HTTP/1.1\r\nHost: y\r\n\r\n");
        assert_eq!(status, ParseStatus::Success);
        assert_eq!(request.path(), "/b");
        assert_eq!(request.header("host"), Some("y"));
    }

    #[test]
    fn host_strips_port() {
        let mut request = Request::new();
        parse_all(&mut request, b"GET / HTTP/1.1\r\nHost: example.com:8080\r\n\r\n");
        assert_eq!(request.host(), "example.com");
    }
}
