//! The event loop: owns the listeners, the readiness multiplexer, the
//! connection table and the CGI session tables, and dispatches readiness into
//! the per-connection and per-session state machines.

use std::collections::HashMap;
use std::net::TcpStream;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::socket;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, read as fd_read, write as fd_write};

use crate::access_log;
use crate::cgi;
use crate::config::{Method, ServerConfig};
use crate::connection::{ConnState, Connection, IDLE_TIMEOUT_SECS, MAX_REQUESTS};
use crate::fileserv;
use crate::listener::{self, Listener};
use crate::poller::{Interest, Poller, Readiness};
use crate::request::ParseStatus;
use crate::response::Response;
use crate::router;
use crate::upload;

const WAIT_TICK_MS: isize = 1000;
const READ_CHUNK: usize = 8192;
const SERVER_SOFTWARE: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Cooperative shutdown flag; signal handlers only store to it.
pub static RUNNING: AtomicBool = AtomicBool::new(true);

pub fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

pub fn request_shutdown() {
    RUNNING.store(false, Ordering::Relaxed);
}

pub struct Server {
    config: Vec<ServerConfig>,
    poller: Poller,
    listeners: Vec<Listener>,
    // listener fd -> local port, consulted on every accept
    listener_ports: HashMap<RawFd, u16>,
    connections: HashMap<RawFd, Connection>,
    // CGI sessions keyed by the child's stdout fd
    cgi_sessions: HashMap<RawFd, cgi::Session>,
    // stdin fd -> stdout fd, so stdin readiness finds its session
    cgi_stdin: HashMap<RawFd, RawFd>,
    now: i64,
    last_sweep: i64,
    next_generation: u64,
    pub num_requests: u64,
    pub total_in: u64,
    pub total_out: u64,
}

impl Server {
    pub fn new(config: Vec<ServerConfig>) -> Result<Self> {
        let poller = Poller::new()?;
        let listeners = listener::bind_all(&config)?;
        let mut listener_ports = HashMap::new();
        for listener in &listeners {
            poller
                .add(listener.fd, Interest::Read)
                .with_context(|| format!("failed to register listener {}", listener.endpoint))?;
            listener_ports.insert(listener.fd, listener.port());
            println!("listening on http://{}/", listener.endpoint);
        }
        Ok(Server {
            config,
            poller,
            listeners,
            listener_ports,
            connections: HashMap::new(),
            cgi_sessions: HashMap::new(),
            cgi_stdin: HashMap::new(),
            now: Utc::now().timestamp(),
            last_sweep: 0,
            next_generation: 0,
            num_requests: 0,
            total_in: 0,
            total_out: 0,
        })
    }

    /// Ports the listeners actually bound, in listener order.
    pub fn bound_ports(&self) -> Vec<u16> {
        self.listeners
            .iter()
            .map(|listener| match socket::getsockname(listener.fd) {
                Ok(socket::SockAddr::Inet(addr)) => addr.port(),
                _ => listener.port(),
            })
            .collect()
    }

    pub fn run(&mut self) -> Result<()> {
        while is_running() {
            self.step()?;
        }
        self.shutdown();
        Ok(())
    }

    /// One loop iteration: wait, dispatch, sweep.
    pub fn step(&mut self) -> Result<()> {
        let mut events: Vec<Readiness> = Vec::new();
        self.poller.wait(WAIT_TICK_MS, &mut events)?;
        self.now = Utc::now().timestamp();

        for readiness in events {
            if self.listener_ports.contains_key(&readiness.fd) {
                self.accept_ready(readiness.fd);
            } else if self.cgi_sessions.contains_key(&readiness.fd) {
                self.cgi_stdout_event(readiness.fd);
            } else if let Some(&stdout_fd) = self.cgi_stdin.get(&readiness.fd) {
                self.cgi_stdin_event(stdout_fd);
            } else if self.connections.contains_key(&readiness.fd) {
                self.connection_event(readiness);
            }
            // Anything else is a stale event for an fd torn down earlier in
            // this same batch.
        }

        if self.now != self.last_sweep {
            self.sweep();
            self.last_sweep = self.now;
        }
        Ok(())
    }

    /// Kill in-flight CGI children, then drop every connection.
    pub fn shutdown(&mut self) {
        let stdout_fds: Vec<RawFd> = self.cgi_sessions.keys().copied().collect();
        for stdout_fd in stdout_fds {
            if let Some(mut session) = self.cgi_sessions.remove(&stdout_fd) {
                kill(session.pid, Signal::SIGKILL).ok();
                self.teardown_session_fds(&mut session);
                waitpid(session.pid, None).ok();
            }
        }
        let conn_fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in conn_fds {
            self.destroy_connection(fd);
        }
    }

    // ---- accept ----

    fn accept_ready(&mut self, listener_fd: RawFd) {
        let local_port = self.listener_ports[&listener_fd];
        loop {
            let client_fd = match socket::accept(listener_fd) {
                Ok(fd) => fd,
                Err(e) if e.as_errno() == Some(Errno::EAGAIN) => break,
                Err(e) => {
                    eprintln!("warning: accept() failed: {}", e);
                    break;
                }
            };

            let peer = match socket::getpeername(client_fd) {
                Ok(socket::SockAddr::Inet(addr)) => addr,
                _ => {
                    close(client_fd).ok();
                    continue;
                }
            };

            let stream = unsafe { TcpStream::from_raw_fd(client_fd) };
            if stream.set_nonblocking(true).is_err() {
                continue; // stream drop closes the fd
            }

            let mut conn = Connection::new(
                stream,
                peer.ip().to_std(),
                peer.port(),
                local_port,
                self.now,
            );
            self.next_generation += 1;
            conn.generation = self.next_generation;

            if self.poller.add(client_fd, Interest::Read).is_err() {
                continue;
            }
            self.connections.insert(client_fd, conn);
        }
    }

    // ---- connection events ----

    fn connection_event(&mut self, readiness: Readiness) {
        let state = match self.connections.get(&readiness.fd) {
            Some(conn) => conn.state,
            None => return,
        };

        if readiness.error() || readiness.hangup() || readiness.peer_closed() {
            self.destroy_connection(readiness.fd);
            return;
        }

        match state {
            ConnState::ReadingRequest if readiness.readable() => self.handle_read(readiness.fd),
            ConnState::WritingResponse if readiness.writable() => self.handle_write(readiness.fd),
            ConnState::Processing => {} // parked on a CGI session
            ConnState::Done | ConnState::Error => self.destroy_connection(readiness.fd),
            _ => {}
        }
    }

    fn handle_read(&mut self, fd: RawFd) {
        let mut buf = [0u8; READ_CHUNK];
        let received = match socket::recv(fd, &mut buf, socket::MsgFlags::empty()) {
            Ok(0) => {
                self.destroy_connection(fd);
                return;
            }
            Ok(received) => received,
            Err(e) if e.as_errno() == Some(Errno::EAGAIN) => return,
            Err(_) => {
                self.destroy_connection(fd);
                return;
            }
        };
        self.total_in += received as u64;

        let local_port = {
            let conn = match self.connections.get_mut(&fd) {
                Some(conn) => conn,
                None => return,
            };
            conn.touch(self.now);
            conn.read_buf.extend_from_slice(&buf[..received]);
            conn.local_port
        };

        // Feed the parser; once the headers are in, clamp the body ceiling to
        // the routed location's limit before any body byte is kept.
        let status = loop {
            let conn = self.connections.get_mut(&fd).unwrap();
            let (status, consumed) = conn.request.parse(&conn.read_buf);
            conn.read_buf.drain(..consumed);

            if status == ParseStatus::Incomplete
                && conn.request.headers_complete()
                && !conn.body_limit_applied
            {
                conn.body_limit_applied = true;
                let host = conn.request.host();
                let path = conn.request.path().to_string();
                if let Some(limit) =
                    router::body_limit_for(&self.config, local_port, &host, &path)
                {
                    conn.request.set_body_limit(limit);
                }
                continue;
            }
            break status;
        };

        match status {
            ParseStatus::Incomplete => {}
            ParseStatus::Success => self.process_request(fd),
            ParseStatus::Failed => {
                self.num_requests += 1;
                let (code, reason) = {
                    let conn = self.connections.get_mut(&fd).unwrap();
                    conn.log_method = conn.request.method().to_string();
                    conn.log_uri = conn.request.uri().to_string();
                    let code = if conn.request.body_too_large() { 413 } else { 400 };
                    (code, conn.request.error_message().to_string())
                };
                let server = self.default_server(local_port);
                let response = fileserv::error_response(server, code, &reason);
                self.finish_with(fd, response, false);
            }
        }
    }

    fn handle_write(&mut self, fd: RawFd) {
        enum Outcome {
            Pending,
            Recycle,
            Destroy,
        }

        let outcome = {
            let conn = match self.connections.get_mut(&fd) {
                Some(conn) => conn,
                None => return,
            };
            match socket::send(fd, conn.unsent(), socket::MsgFlags::empty()) {
                Ok(sent) if sent > 0 => {
                    conn.written += sent;
                    conn.touch(self.now);
                    self.total_out += sent as u64;
                    if conn.has_pending_output() {
                        Outcome::Pending
                    } else if conn.keep_alive && conn.request_count + 1 < MAX_REQUESTS {
                        Outcome::Recycle
                    } else {
                        Outcome::Destroy
                    }
                }
                Err(e) if e.as_errno() == Some(Errno::EAGAIN) => Outcome::Pending,
                _ => Outcome::Destroy,
            }
        };

        match outcome {
            Outcome::Pending => {}
            Outcome::Destroy => self.destroy_connection(fd),
            Outcome::Recycle => {
                self.log_exchange(fd);
                let conn = self.connections.get_mut(&fd).unwrap();
                conn.recycle(self.now);
                if self.poller.modify(fd, Interest::Read).is_err() {
                    self.destroy_connection(fd);
                }
            }
        }
    }

    // ---- request dispatch ----

    fn process_request(&mut self, fd: RawFd) {
        self.num_requests += 1;

        let (request, local_port) = {
            let conn = match self.connections.get_mut(&fd) {
                Some(conn) => conn,
                None => return,
            };
            conn.state = ConnState::Processing;
            let request = std::mem::take(&mut conn.request);
            conn.log_method = request.method().to_string();
            conn.log_uri = request.uri().to_string();
            conn.log_referer = request.header("referer").unwrap_or("").to_string();
            conn.log_user_agent = request.header("user-agent").unwrap_or("").to_string();
            (request, conn.local_port)
        };
        let keep_alive = request.is_keep_alive();

        let route = match router::route(&self.config, &request, local_port) {
            Ok(route) => route,
            Err(reject) => {
                let response = fileserv::error_response(
                    reject.server.map(|index| &self.config[index]),
                    reject.status,
                    &reject.reason,
                );
                self.finish_with(fd, response, keep_alive);
                return;
            }
        };

        if let Some((code, url)) = route.redirect.clone() {
            let response = if (300..=399).contains(&code) {
                Response::redirect(code, &url)
            } else if url.is_empty() {
                fileserv::error_response(
                    Some(&self.config[route.server]),
                    code,
                    "returned by configuration",
                )
            } else {
                let mut response = Response::new(code);
                response.content_type = "text/plain".to_string();
                response.body = url.into_bytes();
                response
            };
            self.finish_with(fd, response, keep_alive);
            return;
        }

        if route.is_cgi {
            self.start_cgi(fd, request, &route, keep_alive);
            return;
        }

        let response = {
            let server = &self.config[route.server];
            let location = &server.locations[route.location];
            let result = if upload::is_upload_request(&request) {
                let upload_dir = location.upload_store.clone().unwrap_or_else(|| {
                    format!("{}/uploads", location.root().trim_end_matches('/'))
                });
                upload::handle(&request, &upload_dir, location.body_limit()).map(|files| {
                    Response::created(upload::success_page(&files).into_bytes(), "text/html")
                })
            } else if request.method() == Method::Delete {
                fileserv::delete(&route.path, &route.fs_path)
            } else {
                fileserv::serve(&route.path, &route.fs_path, location)
            };
            match result {
                Ok(response) => response,
                Err((code, reason)) => fileserv::error_response(Some(server), code, &reason),
            }
        };
        self.finish_with(fd, response, keep_alive);
    }

    /// Queue a response on the owning connection and switch it to writing.
    fn finish_with(&mut self, fd: RawFd, mut response: Response, request_keep_alive: bool) {
        response.keep_alive = response.keep_alive && request_keep_alive;
        response.set_header("Server", SERVER_SOFTWARE);
        let status = response.status;
        let keep_alive = response.keep_alive;
        let wire = response.build();

        let conn = match self.connections.get_mut(&fd) {
            Some(conn) => conn,
            None => return,
        };
        conn.enqueue_response(status, keep_alive, wire);
        conn.touch(self.now);
        if self.poller.modify(fd, Interest::Write).is_err() {
            self.destroy_connection(fd);
        }
    }

    // ---- CGI ----

    fn start_cgi(&mut self, fd: RawFd, request: crate::request::Request, route: &router::Route, keep_alive: bool) {
        let prepared = {
            let server = &self.config[route.server];
            let location = &server.locations[route.location];
            match cgi::check_script(&route.fs_path, location) {
                Ok(interpreter) => {
                    let (_, path_info) =
                        cgi::split_path_info(&route.path, &location.cgi_extensions);
                    let conn = match self.connections.get(&fd) {
                        Some(conn) => conn,
                        None => return,
                    };
                    let env = cgi::build_env(
                        &request,
                        &route.fs_path,
                        location.root(),
                        path_info,
                        conn.peer_ip,
                        conn.peer_port,
                        conn.local_port,
                    );
                    Ok((interpreter, env))
                }
                Err(rejection) => Err(rejection),
            }
        };

        let (interpreter, env) = match prepared {
            Ok(prepared) => prepared,
            Err((code, reason)) => {
                let response =
                    fileserv::error_response(Some(&self.config[route.server]), code, &reason);
                self.finish_with(fd, response, keep_alive);
                return;
            }
        };

        let child = match cgi::spawn(&route.fs_path, interpreter.as_deref(), env) {
            Ok(child) => child,
            Err(e) => {
                let response = fileserv::error_response(
                    Some(&self.config[route.server]),
                    500,
                    &format!("cannot start CGI: {}", e),
                );
                self.finish_with(fd, response, keep_alive);
                return;
            }
        };

        if self.poller.add(child.stdout_fd, Interest::Read).is_err() {
            kill(child.pid, Signal::SIGKILL).ok();
            close(child.stdout_fd).ok();
            close(child.stdin_fd).ok();
            waitpid(child.pid, None).ok();
            let response = fileserv::error_response(
                Some(&self.config[route.server]),
                500,
                "cannot watch CGI output",
            );
            self.finish_with(fd, response, keep_alive);
            return;
        }

        let generation = self
            .connections
            .get(&fd)
            .map(|conn| conn.generation)
            .unwrap_or(0);
        let mut session = cgi::Session {
            conn_fd: fd,
            conn_generation: generation,
            pid: child.pid,
            stdout_fd: child.stdout_fd,
            stdin_fd: child.stdin_fd,
            started: self.now,
            input: request.body,
            input_sent: 0,
            output: Vec::new(),
            server: route.server,
            keep_alive,
        };

        if session.input.is_empty() {
            close(session.stdin_fd).ok();
            session.stdin_fd = -1;
        } else if self.poller.add(session.stdin_fd, Interest::Write).is_ok() {
            self.cgi_stdin.insert(session.stdin_fd, session.stdout_fd);
        } else {
            // Child still runs; it just gets an empty stdin.
            close(session.stdin_fd).ok();
            session.stdin_fd = -1;
        }

        self.cgi_sessions.insert(session.stdout_fd, session);

        // Park the connection until the session finishes, watching only for
        // the peer going away.
        self.poller.modify(fd, Interest::PeerClosed).ok();
    }

    fn cgi_stdin_event(&mut self, stdout_fd: RawFd) {
        let close_stdin = {
            let session = match self.cgi_sessions.get_mut(&stdout_fd) {
                Some(session) => session,
                None => return,
            };
            if session.stdin_fd < 0 {
                return;
            }
            match fd_write(session.stdin_fd, &session.input[session.input_sent..]) {
                Ok(written) => {
                    session.input_sent += written;
                    session.input_sent >= session.input.len()
                }
                Err(e) if e.as_errno() == Some(Errno::EAGAIN) => false,
                // Child closed its stdin early (EPIPE and friends); stop
                // feeding it and keep collecting stdout.
                Err(_) => true,
            }
        };

        if close_stdin {
            let session = self.cgi_sessions.get_mut(&stdout_fd).unwrap();
            let stdin_fd = session.stdin_fd;
            session.stdin_fd = -1;
            self.poller.remove(stdin_fd);
            close(stdin_fd).ok();
            self.cgi_stdin.remove(&stdin_fd);
        }
    }

    fn cgi_stdout_event(&mut self, stdout_fd: RawFd) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let session = match self.cgi_sessions.get_mut(&stdout_fd) {
                Some(session) => session,
                None => return,
            };
            match fd_read(stdout_fd, &mut buf) {
                Ok(0) => {
                    self.finalize_cgi(stdout_fd);
                    return;
                }
                Ok(received) => {
                    session.output.extend_from_slice(&buf[..received]);
                    if session.output.len() > cgi::MAX_OUTPUT_SIZE {
                        self.cancel_cgi(stdout_fd, 502, "CGI output too large");
                        return;
                    }
                }
                Err(e) if e.as_errno() == Some(Errno::EAGAIN) => return,
                Err(_) => {
                    self.finalize_cgi(stdout_fd);
                    return;
                }
            }
        }
    }

    /// EOF on stdout: reap the child, parse its output, hand the response to
    /// the owning connection (or discard it for orphans).
    fn finalize_cgi(&mut self, stdout_fd: RawFd) {
        let mut session = match self.cgi_sessions.remove(&stdout_fd) {
            Some(session) => session,
            None => return,
        };
        self.teardown_session_fds(&mut session);
        // Blocking reap is fine: the child has already closed stdout.
        let wait_status = waitpid(session.pid, None);

        // A child that died without writing anything (exec failure exits
        // with 127) must not turn into an empty 200.
        let exec_failed = session.output.is_empty()
            && matches!(wait_status, Ok(WaitStatus::Exited(_, code)) if code != 0);
        if exec_failed {
            let response = fileserv::error_response(
                Some(&self.config[session.server]),
                502,
                "CGI produced no output",
            );
            self.deliver_to_owner(&session, response);
            return;
        }

        let response = match cgi::parse_output(&session.output) {
            Ok(output) => {
                let mut response = Response::new(output.status);
                response.content_type = output.content_type;
                response.body = output.body;
                for (name, value) in output.headers {
                    response.set_header(&name, &value);
                }
                response
            }
            Err(reason) => {
                fileserv::error_response(Some(&self.config[session.server]), 502, &reason)
            }
        };
        self.deliver_to_owner(&session, response);
    }

    /// Timeout or oversized output: SIGKILL, reap, report to the owner.
    fn cancel_cgi(&mut self, stdout_fd: RawFd, code: u16, reason: &str) {
        let mut session = match self.cgi_sessions.remove(&stdout_fd) {
            Some(session) => session,
            None => return,
        };
        kill(session.pid, Signal::SIGKILL).ok();
        self.teardown_session_fds(&mut session);
        waitpid(session.pid, None).ok();

        let response =
            fileserv::error_response(Some(&self.config[session.server]), code, reason);
        self.deliver_to_owner(&session, response);
    }

    fn teardown_session_fds(&mut self, session: &mut cgi::Session) {
        self.poller.remove(session.stdout_fd);
        close(session.stdout_fd).ok();
        if session.stdin_fd >= 0 {
            self.poller.remove(session.stdin_fd);
            close(session.stdin_fd).ok();
            self.cgi_stdin.remove(&session.stdin_fd);
            session.stdin_fd = -1;
        }
    }

    fn deliver_to_owner(&mut self, session: &cgi::Session, response: Response) {
        let owner_alive = self
            .connections
            .get(&session.conn_fd)
            .map(|conn| {
                conn.generation == session.conn_generation && conn.state == ConnState::Processing
            })
            .unwrap_or(false);
        if owner_alive {
            self.finish_with(session.conn_fd, response, session.keep_alive);
        }
        // Otherwise the client is gone; the output is discarded.
    }

    // ---- timeouts, teardown, logging ----

    fn sweep(&mut self) {
        let idle: Vec<RawFd> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.idle_since(self.now) >= IDLE_TIMEOUT_SECS)
            .map(|(&fd, _)| fd)
            .collect();
        for fd in idle {
            self.destroy_connection(fd);
        }

        let expired: Vec<RawFd> = self
            .cgi_sessions
            .iter()
            .filter(|(_, session)| self.now - session.started >= cgi::TIMEOUT_SECS)
            .map(|(&fd, _)| fd)
            .collect();
        for stdout_fd in expired {
            self.cancel_cgi(stdout_fd, 504, "CGI script timed out");
        }
    }

    fn destroy_connection(&mut self, fd: RawFd) {
        self.log_exchange(fd);
        if self.connections.remove(&fd).is_some() {
            self.poller.remove(fd);
            // The TcpStream in the connection closes the fd on drop.
        }
    }

    fn log_exchange(&self, fd: RawFd) {
        if let Some(conn) = self.connections.get(&fd) {
            access_log::record(
                conn.peer_ip,
                self.now,
                &conn.log_method,
                &conn.log_uri,
                conn.status,
                conn.written,
                &conn.log_referer,
                &conn.log_user_agent,
            );
        }
    }

    fn default_server(&self, port: u16) -> Option<&ServerConfig> {
        self.config.iter().find(|server| server.listens_on(port))
    }
}
