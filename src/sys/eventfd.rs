use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use super::FileDesc;

/// The kernel counter used to kick the selector out of a blocked wait
/// (`eventfd(2)`).
///
/// Any thread may add to the counter; the fd polls readable while it is
/// non-zero. The reactor thread takes the whole counter in one read to go
/// quiet again. Exercised end-to-end by the post-queue tests in `poller`.
#[derive(Debug)]
pub struct EventFd {
    inner: FileDesc,
}

impl EventFd {
    pub fn new() -> io::Result<EventFd> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        Ok(EventFd {
            inner: FileDesc::new(fd),
        })
    }

    /// Adds `n` to the counter, making the fd poll readable.
    pub fn add(&self, n: u64) -> io::Result<()> {
        self.inner.write(&n.to_ne_bytes()).map(|_| ())
    }

    /// Takes the whole counter, resetting readability. `WouldBlock` when it
    /// is already zero.
    pub fn take(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.inner.read(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}
