use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::time::Duration;

use libc::{self, c_int};

use crate::ready::Ready;

use super::{Event, Mode};

/// BSD/macOS readiness backend over kqueue.
///
/// Read and write interest are separate kevent filters; the timer filter is
/// armed through [`Selector::set_timer`] with an ident that never collides
/// with a file descriptor.
pub struct Selector {
    kq: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;

        Ok(Selector { kq })
    }

    pub fn wait(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timespec = timeout.map(|to| libc::timespec {
            tv_sec: to.as_secs() as libc::time_t,
            tv_nsec: to.subsec_nanos() as _,
        });
        let timespec_ptr = timespec
            .as_ref()
            .map(|ts| ts as *const libc::timespec)
            .unwrap_or(ptr::null());

        let cnt = syscall!(kevent(
            self.kq,
            ptr::null(),
            0,
            evts.events.as_mut_ptr(),
            evts.events.capacity() as c_int,
            timespec_ptr
        ))?;

        unsafe { evts.events.set_len(cnt as usize) };

        Ok(())
    }

    pub fn add(&self, fd: RawFd, token: usize, interest: Ready, mode: Mode) -> io::Result<()> {
        let mut flags = libc::EV_ADD | libc::EV_ENABLE | libc::EV_RECEIPT;
        flags |= match mode {
            Mode::Edge => libc::EV_CLEAR,
            Mode::Oneshot => libc::EV_ONESHOT,
        };

        let mut changes = [kevent_new(0, 0, 0, 0, 0); 2];
        let mut n = 0;

        if interest.is_readable() {
            changes[n] = kevent_new(fd as usize, libc::EVFILT_READ, flags, 0, token);
            n += 1;
        }
        if interest.is_writable() {
            changes[n] = kevent_new(fd as usize, libc::EVFILT_WRITE, flags, 0, token);
            n += 1;
        }

        self.submit(&mut changes[..n])
    }

    pub fn modify(&self, fd: RawFd, token: usize, interest: Ready, mode: Mode) -> io::Result<()> {
        // EV_ADD on an existing (ident, filter) pair updates it in place.
        self.add(fd, token, interest, mode)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut changes = [
            kevent_new(fd as usize, libc::EVFILT_READ, libc::EV_DELETE | libc::EV_RECEIPT, 0, 0),
            kevent_new(fd as usize, libc::EVFILT_WRITE, libc::EV_DELETE | libc::EV_RECEIPT, 0, 0),
        ];

        self.submit(&mut changes)
    }

    /// Arms a one-shot timer. `ident` lives in the `EVFILT_TIMER` namespace
    /// and is drawn from a counter disjoint from real descriptors.
    pub fn set_timer(&self, ident: usize, token: usize, dur: Duration) -> io::Result<()> {
        let ms = dur.as_millis().min(isize::MAX as u128) as isize;
        let flags = libc::EV_ADD | libc::EV_ENABLE | libc::EV_ONESHOT | libc::EV_RECEIPT;
        let mut changes = [kevent_new(ident, libc::EVFILT_TIMER, flags, ms, token)];

        self.submit(&mut changes)
    }

    pub fn delete_timer(&self, ident: usize) -> io::Result<()> {
        let mut changes = [kevent_new(
            ident,
            libc::EVFILT_TIMER,
            libc::EV_DELETE | libc::EV_RECEIPT,
            0,
            0,
        )];

        self.submit(&mut changes)
    }

    /// Applies a changelist, surfacing per-change errors reported through
    /// `EV_RECEIPT`. Missing entries are tolerated so deletes stay no-ops.
    fn submit(&self, changes: &mut [libc::kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        syscall!(kevent(
            self.kq,
            changes.as_ptr(),
            changes.len() as c_int,
            changes.as_mut_ptr(),
            changes.len() as c_int,
            ptr::null()
        ))?;

        for change in changes.iter() {
            let data = change.data as i64;
            if (change.flags & libc::EV_ERROR) != 0
                && data != 0
                && data != libc::ENOENT as i64
                // https://github.com/tokio-rs/mio/issues/582
                && data != libc::EPIPE as i64
            {
                return Err(io::Error::from_raw_os_error(data as i32));
            }
        }

        Ok(())
    }
}

fn kevent_new(ident: usize, filter: i16, flags: u16, data: isize, udata: usize) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { mem::zeroed() };
    ev.ident = ident as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.data = data as _;
    ev.udata = udata as _;
    ev
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        let _ = syscall!(close(self.kq));
    }
}

pub struct Events {
    events: Vec<libc::kevent>,
}

impl Events {
    pub fn with_capacity(u: usize) -> Events {
        Events {
            events: Vec::with_capacity(u),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<Event> {
        self.events.get(idx).map(|event| {
            let mut kind = Ready::empty();

            match event.filter as i16 {
                libc::EVFILT_READ | libc::EVFILT_TIMER => kind.insert(Ready::readable()),
                libc::EVFILT_WRITE => kind.insert(Ready::writable()),
                _ => {}
            }

            if (event.flags as u16 & libc::EV_ERROR as u16) != 0 {
                kind.insert(Ready::error());
            }

            if (event.flags as u16 & libc::EV_EOF as u16) != 0 {
                kind.insert(Ready::hup());
            }

            Event {
                ready: kind,
                token: event.udata as usize,
            }
        })
    }
}
