//! Per-client connection state: buffers, the embedded request parser, and
//! the read/process/write lifecycle flags the event loop drives.

use std::net::{IpAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::request::Request;

/// Requests served over one connection before it is closed.
pub const MAX_REQUESTS: u32 = 100;
/// Idle ceiling in seconds.
pub const IDLE_TIMEOUT_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ReadingRequest,
    /// Waiting on a CGI child; the session enqueues the response.
    Processing,
    WritingResponse,
    Done,
    Error,
}

#[derive(Debug)]
pub struct Connection {
    // RAII close on drop.
    socket: TcpStream,
    pub peer_ip: IpAddr,
    pub peer_port: u16,
    /// Port of the listener that accepted this connection; routing needs it.
    pub local_port: u16,
    pub state: ConnState,
    /// Distinguishes reuses of the same fd; CGI sessions compare it before
    /// handing a response to what they believe is their owner.
    pub generation: u64,
    pub read_buf: Vec<u8>,
    pub write_buf: Vec<u8>,
    pub written: usize,
    pub request: Request,
    pub keep_alive: bool,
    pub request_count: u32,
    pub last_active: i64,
    /// Status of the response in flight, for the access log.
    pub status: u16,
    /// Whether the routed location's body limit was applied to the parser.
    pub body_limit_applied: bool,
    // Request details kept for the access log after the parser is reset.
    pub log_method: String,
    pub log_uri: String,
    pub log_referer: String,
    pub log_user_agent: String,
}

impl Connection {
    pub fn new(socket: TcpStream, peer_ip: IpAddr, peer_port: u16, local_port: u16, now: i64) -> Self {
        Connection {
            socket,
            peer_ip,
            peer_port,
            local_port,
            state: ConnState::ReadingRequest,
            generation: 0,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            written: 0,
            request: Request::new(),
            keep_alive: false,
            request_count: 0,
            last_active: now,
            status: 0,
            body_limit_applied: false,
            log_method: String::new(),
            log_uri: String::new(),
            log_referer: String::new(),
            log_user_agent: String::new(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn touch(&mut self, now: i64) {
        self.last_active = now;
    }

    pub fn idle_since(&self, now: i64) -> i64 {
        now - self.last_active
    }

    pub fn has_pending_output(&self) -> bool {
        self.written < self.write_buf.len()
    }

    pub fn unsent(&self) -> &[u8] {
        &self.write_buf[self.written..]
    }

    /// Queue serialised response bytes and move to the writing state.
    pub fn enqueue_response(&mut self, status: u16, keep_alive: bool, wire: Vec<u8>) {
        self.status = status;
        self.keep_alive = keep_alive;
        self.write_buf = wire;
        self.written = 0;
        self.state = ConnState::WritingResponse;
    }

    /// Reset in place for the next keep-alive request.
    pub fn recycle(&mut self, now: i64) {
        self.request.reset();
        self.read_buf.clear();
        self.write_buf.clear();
        self.written = 0;
        self.keep_alive = false;
        self.status = 0;
        self.body_limit_applied = false;
        self.log_method.clear();
        self.log_uri.clear();
        self.log_referer.clear();
        self.log_user_agent.clear();
        self.request_count += 1;
        self.state = ConnState::ReadingRequest;
        self.touch(now);
    }
}
