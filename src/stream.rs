use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::reactor::{PollData, Reactor};

/// A non-blocking bytestream bound to a reactor, usually a TCP socket.
///
/// `read_some`/`write_some` transfer whatever the kernel will take right now
/// and return `WouldBlock` otherwise; a 0-byte read on a connection-oriented
/// stream means the peer closed. The async helpers arm one-shot interest and
/// complete on the reactor thread, inline when the kernel is already ready.
///
/// Implementations are cheap clonable handles so in-flight operations can
/// keep the stream alive from inside their callbacks.
pub trait Stream: Clone + 'static {
    fn reactor(&self) -> &Reactor;

    fn poll_data(&self) -> &Rc<PollData>;

    fn read_some(&self, buf: &mut [u8]) -> Result<usize>;

    fn write_some(&self, buf: &[u8]) -> Result<usize>;

    /// Cancels armed interest (callbacks run once with `Cancelled`) and
    /// closes the stream; later operations fail with `Closed`.
    fn close(&self) -> Result<()>;

    fn raw_fd(&self) -> RawFd {
        self.poll_data().fd()
    }

    /// Runs `cb` once the stream polls readable. Registration failures are
    /// delivered through the callback.
    fn async_wait_read(&self, cb: impl FnOnce(Result<()>) + 'static) {
        arm_or_deliver(self.reactor(), self.poll_data(), Dir::Read, Box::new(cb))
    }

    /// Runs `cb` once the stream polls writable.
    fn async_wait_write(&self, cb: impl FnOnce(Result<()>) + 'static) {
        arm_or_deliver(self.reactor(), self.poll_data(), Dir::Write, Box::new(cb))
    }

    /// Reads into `buf` when ready; the buffer travels through the callback
    /// so it outlives the in-flight operation.
    fn async_read_some(&self, mut buf: Vec<u8>, cb: impl FnOnce(Result<usize>, Vec<u8>) + 'static) {
        match self.read_some(&mut buf) {
            Err(Error::WouldBlock) => {
                let stream = self.clone();
                self.async_wait_read(move |res| match res {
                    Ok(()) => stream.async_read_some(buf, cb),
                    Err(err) => cb(Err(err), buf),
                });
            }
            res => cb(res, buf),
        }
    }

    /// Write-direction dual of [`Stream::async_read_some`].
    fn async_write_some(&self, buf: Vec<u8>, cb: impl FnOnce(Result<usize>, Vec<u8>) + 'static) {
        match self.write_some(&buf) {
            Err(Error::WouldBlock) => {
                let stream = self.clone();
                self.async_wait_write(move |res| match res {
                    Ok(()) => stream.async_write_some(buf, cb),
                    Err(err) => cb(Err(err), buf),
                });
            }
            res => cb(res, buf),
        }
    }
}

pub(crate) enum Dir {
    Read,
    Write,
}

/// Registers one-shot interest, routing a synchronous registration failure
/// into the callback so callers have a single completion path.
pub(crate) fn arm_or_deliver(
    reactor: &Reactor,
    pd: &Rc<PollData>,
    dir: Dir,
    cb: Box<dyn FnOnce(Result<()>)>,
) {
    let slot = Rc::new(RefCell::new(Some(cb)));
    let armed = Rc::clone(&slot);

    let deliver = move |res: Result<()>| {
        if let Some(cb) = armed.borrow_mut().take() {
            cb(res)
        }
    };

    let res = match dir {
        Dir::Read => reactor.register_read(pd, deliver),
        Dir::Write => reactor.register_write(pd, deliver),
    };

    if let Err(err) = res {
        if let Some(cb) = slot.borrow_mut().take() {
            cb(Err(err))
        }
    }
}
