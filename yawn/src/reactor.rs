//! Thin epoll wrapper.
//!
//! Control operations take `&self` — `epoll_ctl` is thread-safe — so the
//! handle can be shared behind an `Arc` and worker continuations can re-arm
//! their one-shot connections directly. The ready-event storage lives in a
//! separate [`EventList`] owned by whichever thread calls [`Epoller::wait`]
//! (in this server, only the reactor thread).

use std::io;
use std::os::fd::RawFd;

pub struct Epoller {
    epfd: RawFd,
}

/// Ready-event storage filled by [`Epoller::wait`].
pub struct EventList {
    events: Vec<libc::epoll_event>,
    ready: usize,
}

impl EventList {
    pub fn new(capacity: usize) -> Self {
        EventList {
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            ready: 0,
        }
    }

    /// Number of events delivered by the last wait.
    pub fn ready(&self) -> usize {
        self.ready
    }

    /// The fd of ready event `idx`.
    pub fn fd(&self, idx: usize) -> RawFd {
        let ev = self.events[idx];
        ev.u64 as RawFd
    }

    /// The event mask of ready event `idx`.
    pub fn mask(&self, idx: usize) -> u32 {
        let ev = self.events[idx];
        ev.events
    }
}

impl Epoller {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Epoller { epfd })
    }

    /// Register `fd` with the given interest mask.
    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    /// Replace the interest mask of a registered `fd` (also re-arms a
    /// one-shot registration).
    pub fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    /// Deregister `fd`.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Wait up to `timeout_ms` (−1 blocks indefinitely) and fill `list`.
    /// Returns the number of ready events; an interrupted wait reports 0.
    pub fn wait(&self, list: &mut EventList, timeout_ms: i32) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                list.events.as_mut_ptr(),
                list.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                list.ready = 0;
                return Ok(0);
            }
            return Err(err);
        }
        list.ready = n as usize;
        Ok(list.ready)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Epoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
