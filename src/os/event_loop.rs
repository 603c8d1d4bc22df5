// src/os/event_loop.rs

//! Readiness multiplexer for the control loop, wrapping `epoll` through
//! raw `libc` FFI. Event sources register with a token; a bounded wait
//! returns the tokens that became ready. An interrupted wait (EINTR) is
//! reported as an empty set, matching the loop's "just go around again"
//! policy; any other wait failure is unrecoverable for the caller.

use anyhow::{Context, Result};
use bitflags::bitflags;
use log::{debug, trace, warn};
use std::io;
use std::os::unix::io::RawFd;

const MAX_EVENTS_PER_WAIT: usize = 16;

bitflags! {
    /// Readiness conditions reported for a source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReadyFlags: u32 {
        const READABLE = libc::EPOLLIN as u32;
        const ERROR = libc::EPOLLERR as u32;
        const HANGUP = libc::EPOLLHUP as u32;
    }
}

/// One ready event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: u64,
    pub flags: ReadyFlags,
}

/// Level-triggered read-readiness multiplexer over a fixed set of sources.
pub struct Multiplexer {
    epoll_fd: RawFd,
    event_buffer: [libc::epoll_event; MAX_EVENTS_PER_WAIT],
    ready: Vec<Readiness>,
}

impl Multiplexer {
    pub fn new() -> Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(io::Error::last_os_error())
                .context("Failed to create epoll instance (epoll_create1)");
        }
        debug!("Multiplexer created with epoll_fd: {epoll_fd}");
        Ok(Self {
            epoll_fd,
            event_buffer: [unsafe { std::mem::zeroed() }; MAX_EVENTS_PER_WAIT],
            ready: Vec::with_capacity(MAX_EVENTS_PER_WAIT),
        })
    }

    /// Registers a source for read readiness under `token`.
    pub fn register(&self, fd: RawFd, token: u64) -> Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) } == -1 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("Failed to register fd {fd} (token: {token})"));
        }
        trace!("Registered fd {fd} with token {token} on epoll_fd {}", self.epoll_fd);
        Ok(())
    }

    pub fn unregister(&self, fd: RawFd) -> Result<()> {
        let mut event: libc::epoll_event = unsafe { std::mem::zeroed() };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, &mut event) } == -1 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("Failed to unregister fd {fd}"));
        }
        trace!("Unregistered fd {fd} from epoll_fd {}", self.epoll_fd);
        Ok(())
    }

    /// Waits up to `timeout_ms` for readiness. Returns the ready tokens;
    /// empty on timeout or interruption by a signal.
    pub fn wait(&mut self, timeout_ms: u64) -> Result<&[Readiness]> {
        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.event_buffer.as_mut_ptr(),
                MAX_EVENTS_PER_WAIT as libc::c_int,
                timeout_ms.min(i32::MAX as u64) as libc::c_int,
            )
        };

        if num_events == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("epoll_wait interrupted (EINTR), returning empty set");
                self.ready.clear();
                return Ok(&self.ready);
            }
            return Err(err).context("epoll_wait failed in Multiplexer");
        }

        self.ready.clear();
        for event in &self.event_buffer[..num_events as usize] {
            self.ready.push(Readiness {
                token: event.u64,
                flags: ReadyFlags::from_bits_truncate(event.events),
            });
        }
        trace!(
            "epoll_wait on fd {} returned {} events",
            self.epoll_fd,
            num_events
        );
        Ok(&self.ready)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        if unsafe { libc::close(self.epoll_fd) } == -1 {
            warn!(
                "Failed to close epoll_fd {} in Multiplexer::drop: {}",
                self.epoll_fd,
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_returns_empty_set() {
        let mut mux = Multiplexer::new().unwrap();
        assert!(mux.wait(0).unwrap().is_empty());
    }

    #[test]
    fn ready_pipe_reports_its_token() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = fds;

        let mut mux = Multiplexer::new().unwrap();
        mux.register(read_fd, 42).unwrap();

        // Nothing written yet.
        assert!(mux.wait(0).unwrap().is_empty());

        assert_eq!(
            unsafe { libc::write(write_fd, b"x".as_ptr().cast(), 1) },
            1
        );
        let ready = mux.wait(100).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].token, 42);
        assert!(ready[0].flags.contains(ReadyFlags::READABLE));

        mux.unregister(read_fd).unwrap();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
