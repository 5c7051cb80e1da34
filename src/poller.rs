//! Readiness multiplexer over epoll: register interest per fd, wait for
//! events, tolerate signals and already-closed fds.

use std::os::unix::io::RawFd;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::unistd::close;

const MAX_EVENTS: usize = 256;

/// What a registered fd should be watched for. Peer shutdown, hangup and
/// error conditions are always delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    /// Watch only for the peer going away; used while a connection is parked
    /// waiting on a CGI child.
    PeerClosed,
}

impl Interest {
    fn flags(self) -> EpollFlags {
        match self {
            Interest::Read => EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP,
            Interest::Write => EpollFlags::EPOLLOUT | EpollFlags::EPOLLRDHUP,
            Interest::PeerClosed => EpollFlags::EPOLLRDHUP,
        }
    }
}

/// One delivered event.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub fd: RawFd,
    flags: EpollFlags,
}

impl Readiness {
    pub fn readable(&self) -> bool {
        self.flags.contains(EpollFlags::EPOLLIN)
    }

    pub fn writable(&self) -> bool {
        self.flags.contains(EpollFlags::EPOLLOUT)
    }

    pub fn peer_closed(&self) -> bool {
        self.flags.contains(EpollFlags::EPOLLRDHUP)
    }

    pub fn hangup(&self) -> bool {
        self.flags.contains(EpollFlags::EPOLLHUP)
    }

    pub fn error(&self) -> bool {
        self.flags.contains(EpollFlags::EPOLLERR)
    }
}

#[derive(Debug)]
pub struct Poller {
    epoll_fd: RawFd,
}

impl Poller {
    pub fn new() -> Result<Self> {
        let epoll_fd = epoll_create1(EpollCreateFlags::empty())
            .context("failed to create epoll instance")?;
        Ok(Poller { epoll_fd })
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let mut event = EpollEvent::new(interest.flags(), fd as u64);
        epoll_ctl(self.epoll_fd, EpollOp::EpollCtlAdd, fd, &mut event)
            .with_context(|| format!("failed to add fd {} to epoll", fd))?;
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let mut event = EpollEvent::new(interest.flags(), fd as u64);
        epoll_ctl(self.epoll_fd, EpollOp::EpollCtlMod, fd, &mut event)
            .with_context(|| format!("failed to modify fd {} in epoll", fd))?;
        Ok(())
    }

    /// Deregister an fd. A fd that was already closed (and therefore dropped
    /// from the epoll set by the kernel) is not an error.
    pub fn remove(&self, fd: RawFd) {
        if let Err(e) = epoll_ctl(
            self.epoll_fd,
            EpollOp::EpollCtlDel,
            fd,
            None as Option<&mut EpollEvent>,
        ) {
            if !matches!(e.as_errno(), Some(Errno::ENOENT) | Some(Errno::EBADF)) {
                eprintln!("warning: failed to remove fd {} from epoll: {}", fd, e);
            }
        }
    }

    /// Wait up to `timeout_ms` for events. Interruption by a signal yields an
    /// empty set so the caller can re-check its shutdown flag.
    pub fn wait(&self, timeout_ms: isize, out: &mut Vec<Readiness>) -> Result<()> {
        out.clear();
        let mut buffer = vec![EpollEvent::empty(); MAX_EVENTS];
        let count = match epoll_wait(self.epoll_fd, &mut buffer, timeout_ms) {
            Ok(count) => count,
            Err(e) if e.as_errno() == Some(Errno::EINTR) => 0,
            Err(e) => return Err(e).context("epoll_wait failed"),
        };
        for event in buffer.iter().take(count) {
            out.push(Readiness {
                fd: event.data() as RawFd,
                flags: event.events(),
            });
        }
        Ok(())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        close(self.epoll_fd).ok();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nix::unistd::{pipe, write};

    #[test]
    fn pipe_becomes_readable() {
        let poller = Poller::new().unwrap();
        let (read_fd, write_fd) = pipe().unwrap();
        poller.add(read_fd, Interest::Read).unwrap();

        let mut events = Vec::new();
        poller.wait(0, &mut events).unwrap();
        assert!(events.is_empty());

        write(write_fd, b"x").unwrap();
        poller.wait(1000, &mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, read_fd);
        assert!(events[0].readable());

        close(read_fd).ok();
        close(write_fd).ok();
    }

    #[test]
    fn hangup_is_reported_without_write_interest() {
        let poller = Poller::new().unwrap();
        let (read_fd, write_fd) = pipe().unwrap();
        poller.add(read_fd, Interest::Read).unwrap();
        close(write_fd).ok();

        let mut events = Vec::new();
        poller.wait(1000, &mut events).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].hangup());

        close(read_fd).ok();
    }

    #[test]
    fn remove_of_closed_fd_is_tolerated() {
        let poller = Poller::new().unwrap();
        let (read_fd, write_fd) = pipe().unwrap();
        poller.add(read_fd, Interest::Read).unwrap();
        close(read_fd).ok();
        close(write_fd).ok();
        poller.remove(read_fd); // must not panic or error
    }
}
