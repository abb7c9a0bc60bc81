use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::ready::Ready;

pub mod socket;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) mod eventfd;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod timerfd;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use epoll::{Events, Selector};

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) mod pipe;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) use kqueue::{Events, Selector};

/// An owned descriptor, closed on drop.
///
/// I/O goes straight through the raw syscalls, so a non-blocking descriptor
/// reports `WouldBlock` like any other `io::Error` and nothing buffers in
/// userspace between the kernel and the reactor.
#[derive(Debug)]
pub(crate) struct FileDesc {
    fd: RawFd,
}

impl FileDesc {
    /// Takes ownership of `fd`; it is closed when the wrapper drops.
    pub fn new(fd: RawFd) -> FileDesc {
        FileDesc { fd }
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = syscall!(read(
            self.fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        ))?;
        Ok(n as usize)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = syscall!(write(
            self.fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len()
        ))?;
        Ok(n as usize)
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for FileDesc {
    fn drop(&mut self) {
        // Close errors have nowhere useful to go.
        let _ = syscall!(close(self.fd));
    }
}

/// A readiness report from the selector: what happened, and the token the
/// interest was registered under.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Event {
    pub ready: Ready,
    pub token: usize,
}

/// How an interest is armed.
///
/// `Oneshot` interests are disabled by the kernel after the first report and
/// must be re-armed; `Edge` interests keep reporting state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Edge,
    Oneshot,
}

pub(crate) fn cvt(res: libc::c_int) -> io::Result<libc::c_int> {
    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}
