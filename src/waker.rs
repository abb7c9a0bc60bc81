use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

/// Cross-thread wake-up for the selector: an eventfd on Linux, a pipe pair
/// elsewhere. `wake` is safe to call from any thread; `drain` runs on the
/// reactor thread only.
#[derive(Debug)]
pub(crate) struct Waker {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    inner: crate::sys::eventfd::EventFd,

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    reader: crate::sys::FileDesc,
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    writer: crate::sys::FileDesc,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Waker {
    pub fn new() -> io::Result<Waker> {
        Ok(Waker {
            inner: crate::sys::eventfd::EventFd::new()?,
        })
    }

    pub fn wake(&self) -> io::Result<()> {
        match self.inner.add(1) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn drain(&self) -> io::Result<()> {
        match self.inner.take() {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl Waker {
    pub fn new() -> io::Result<Waker> {
        let (reader, writer) = crate::sys::pipe::pipe()?;
        Ok(Waker { reader, writer })
    }

    pub fn wake(&self) -> io::Result<()> {
        match self.writer.write(&[1]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn drain(&self) -> io::Result<()> {
        let mut buf = [0; 128];

        loop {
            // Consume until the pipe is purged.
            match self.reader.read(&mut buf) {
                Ok(n) if n > 0 => {}
                _ => return Ok(()),
            }
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.raw()
    }
}
