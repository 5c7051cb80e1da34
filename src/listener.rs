//! Listening sockets: one bound, non-blocking passive socket per distinct
//! `(interface, port)` endpoint referenced by the configuration.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::str::FromStr;

use anyhow::{Context, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket;
use nix::unistd::close;

use crate::config::{ListenEndpoint, ServerConfig};

const BACKLOG: usize = 128;

#[derive(Debug)]
pub struct Listener {
    pub fd: RawFd,
    pub endpoint: ListenEndpoint,
}

impl Listener {
    pub fn port(&self) -> u16 {
        self.endpoint.port
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        close(self.fd).ok();
    }
}

/// Bind every distinct endpoint named by any server. Endpoints that appear in
/// several server blocks share one socket.
pub fn bind_all(servers: &[ServerConfig]) -> Result<Vec<Listener>> {
    let mut endpoints = BTreeSet::new();
    for server in servers {
        for endpoint in &server.listens {
            endpoints.insert(endpoint.clone());
        }
    }

    let mut listeners = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        listeners.push(bind_one(endpoint)?);
    }
    Ok(listeners)
}

fn bind_one(endpoint: ListenEndpoint) -> Result<Listener> {
    let fd = socket::socket(
        socket::AddressFamily::Inet,
        socket::SockType::Stream,
        socket::SockFlag::empty(),
        socket::SockProtocol::Tcp,
    )
    .with_context(|| format!("failed to create listening socket for {}", endpoint))?;

    let listener = Listener { fd, endpoint };

    socket::setsockopt(listener.fd, socket::sockopt::ReuseAddr, &true)
        .with_context(|| format!("failed to set SO_REUSEADDR on {}", listener.endpoint))?;

    fcntl(listener.fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .with_context(|| format!("failed to set O_NONBLOCK on {}", listener.endpoint))?;

    let addr = Ipv4Addr::from_str(listener.endpoint.effective_interface())
        .with_context(|| format!("malformed listen interface in {}", listener.endpoint))?;
    let socket_addr = SocketAddr::V4(SocketAddrV4::new(addr, listener.endpoint.port));

    socket::bind(
        listener.fd,
        &socket::SockAddr::Inet(socket::InetAddr::from_std(&socket_addr)),
    )
    .with_context(|| format!("failed to bind {}", listener.endpoint))?;

    socket::listen(listener.fd, BACKLOG)
        .with_context(|| format!("failed to listen on {}", listener.endpoint))?;

    Ok(listener)
}
