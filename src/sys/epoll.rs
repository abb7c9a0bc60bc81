//! Linux readiness backend over epoll.
//!
//! Every interest is registered edge-triggered: the runtime's contract to
//! callers is one-shot delivery with explicit re-arming, so there is no
//! level-triggered mode for anyone to ask for. [`Mode::Oneshot`] layers
//! `EPOLLONESHOT` on top for the interests the poller disarms after one
//! report; the wake-up fd is the lone [`Mode::Edge`] registration.

use std::cmp;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use libc::{self, c_int};

use crate::ready::Ready;

use super::{Event, Mode};

pub struct Selector {
    epfd: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Selector { epfd })
    }

    /// Waits for readiness. `None` blocks, `Some(0)` returns immediately.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.list.clear();

        let n = syscall!(epoll_wait(
            self.epfd,
            events.list.as_mut_ptr(),
            events.list.capacity() as c_int,
            wait_timeout(timeout)
        ))?;

        unsafe { events.list.set_len(n as usize) };

        Ok(())
    }

    pub fn add(&self, fd: RawFd, token: usize, interest: Ready, mode: Mode) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some((token, interest, mode)))
    }

    pub fn modify(&self, fd: RawFd, token: usize, interest: Ready, mode: Mode) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some((token, interest, mode)))
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    fn ctl(
        &self,
        op: c_int,
        fd: RawFd,
        registration: Option<(usize, Ready, Mode)>,
    ) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };

        if let Some((token, interest, mode)) = registration {
            ev.events = interest_flags(interest, mode);
            ev.u64 = token as u64;
        }

        syscall!(epoll_ctl(self.epfd, op, fd, &mut ev))?;
        Ok(())
    }
}

/// `-1` blocks; sub-millisecond deadlines round up so a short timed wait
/// does not degrade into an immediate return.
fn wait_timeout(timeout: Option<Duration>) -> c_int {
    let Some(to) = timeout else { return -1 };

    let mut ms = to.as_millis();
    if to.subsec_nanos() % 1_000_000 != 0 {
        ms += 1;
    }
    cmp::min(ms, c_int::MAX as u128) as c_int
}

fn interest_flags(interest: Ready, mode: Mode) -> u32 {
    let mut flags = libc::EPOLLET;

    if mode == Mode::Oneshot {
        flags |= libc::EPOLLONESHOT;
    }
    if interest.is_readable() {
        flags |= libc::EPOLLIN;
    }
    if interest.is_writable() {
        flags |= libc::EPOLLOUT;
    }

    flags as u32
}

fn readiness(flags: c_int) -> Ready {
    let mut ready = Ready::empty();

    if flags & (libc::EPOLLIN | libc::EPOLLPRI) != 0 {
        ready.insert(Ready::readable());
    }
    if flags & libc::EPOLLOUT != 0 {
        ready.insert(Ready::writable());
    }
    if flags & libc::EPOLLERR != 0 {
        ready.insert(Ready::error());
    }
    if flags & (libc::EPOLLHUP | libc::EPOLLRDHUP) != 0 {
        ready.insert(Ready::hup());
    }

    ready
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        let _ = syscall!(close(self.epfd));
    }
}

pub struct Events {
    list: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(cap: usize) -> Events {
        Events {
            list: Vec::with_capacity(cap),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<Event> {
        let raw = self.list.get(idx)?;

        Some(Event {
            ready: readiness(raw.events as c_int),
            token: raw.u64 as usize,
        })
    }
}
