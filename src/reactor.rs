use std::cell::Cell;
use std::cmp;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::error::{Error, Result};
use crate::poller::{Poller, PostQueue};

pub use crate::poller::PollData;

/// The I/O execution context: a single-threaded event loop multiplexing fd
/// readiness, timers and cross-thread posts.
///
/// Exactly one thread owns a `Reactor` and everything registered with it;
/// completion handlers run on that thread, to completion, without
/// preemption. The handle is cheap to clone and deliberately `!Send`; the
/// only foreign-thread entry point is [`Poster::post`].
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use pulse_io::{Reactor, Timer};
///
/// let reactor = Reactor::new().unwrap();
///
/// let timer = Timer::new(&reactor).unwrap();
/// timer.set(Duration::from_millis(50), || println!("fired")).unwrap();
///
/// reactor.run_pending().unwrap();
/// ```
pub struct Reactor {
    inner: Rc<Inner>,
}

struct Inner {
    poller: Poller,
    closed: Cell<bool>,
}

impl Reactor {
    pub fn new() -> Result<Reactor> {
        Ok(Reactor {
            inner: Rc::new(Inner {
                poller: Poller::new()?,
                closed: Cell::new(false),
            }),
        })
    }

    /// Runs the dispatch loop until an error other than `Timeout` occurs.
    pub fn run(&self) -> Result<()> {
        loop {
            match self.run_one() {
                Ok(()) => {}
                Err(Error::Timeout) => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Blocks until at least one handler has run.
    pub fn run_one(&self) -> Result<()> {
        self.poll(None)
    }

    /// Runs handlers until nothing is armed, scheduled or queued.
    pub fn run_pending(&self) -> Result<()> {
        while self.pending() > 0 {
            match self.run_one() {
                Ok(()) => {}
                Err(Error::Timeout) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Blocks for at most `dur` to run one handler. Durations under a
    /// millisecond are rounded up to one.
    pub fn run_one_for(&self, dur: Duration) -> Result<()> {
        self.poll(Some(cmp::max(dur, Duration::from_millis(1))))
    }

    /// Drains everything that is ready right now, never blocking.
    pub fn poll_all(&self) -> Result<()> {
        loop {
            match self.poll_one() {
                Ok(()) => {}
                Err(Error::Timeout) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs one ready handler, returning `Timeout` when none is.
    pub fn poll_one(&self) -> Result<()> {
        self.poll(Some(Duration::ZERO))
    }

    fn poll(&self, timeout: Option<Duration>) -> Result<()> {
        if self.inner.closed.get() {
            return Err(Error::Closed);
        }
        self.inner.poller.poll(timeout)
    }

    /// Schedules `handler` to run on the reactor thread. Callable from the
    /// reactor thread itself; foreign threads go through [`Reactor::poster`].
    pub fn post(&self, handler: impl FnOnce() + Send + 'static) -> Result<()> {
        self.inner.poller.posts().post(Box::new(handler))
    }

    /// A `Send + Sync` handle for posting handlers from foreign threads.
    pub fn poster(&self) -> Poster {
        Poster {
            posts: Arc::clone(self.inner.poller.posts()),
        }
    }

    /// Armed interests + live timers + unexecuted posts.
    pub fn pending(&self) -> usize {
        self.inner.poller.pending()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Cancels all armed interests (their callbacks run once with
    /// `Cancelled`), drops queued posts and refuses further work. The second
    /// call fails with `Closed`.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.replace(true) {
            return Err(Error::Closed);
        }

        trace!("reactor closing");
        self.inner.poller.close();
        Ok(())
    }

    /// Arms read interest on `pd`, one-shot: `cb` runs once on readiness, or
    /// once with `Cancelled` on [`Reactor::deregister`]. Fails if this
    /// direction is already armed.
    pub fn register_read(
        &self,
        pd: &Rc<PollData>,
        cb: impl FnOnce(Result<()>) + 'static,
    ) -> Result<()> {
        if self.inner.closed.get() {
            return Err(Error::Closed);
        }
        self.inner.poller.arm_read(pd, Box::new(cb))
    }

    /// Write-direction dual of [`Reactor::register_read`].
    pub fn register_write(
        &self,
        pd: &Rc<PollData>,
        cb: impl FnOnce(Result<()>) + 'static,
    ) -> Result<()> {
        if self.inner.closed.get() {
            return Err(Error::Closed);
        }
        self.inner.poller.arm_write(pd, Box::new(cb))
    }

    /// Removes everything armed on `pd`; safe to call when nothing is.
    pub fn deregister(&self, pd: &Rc<PollData>) {
        self.inner.poller.cancel(pd);
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub(crate) fn register_timer(
        &self,
        pd: &Rc<PollData>,
        dur: Duration,
        cb: impl FnOnce(Result<()>) + 'static,
    ) -> Result<()> {
        if self.inner.closed.get() {
            return Err(Error::Closed);
        }
        self.inner.poller.arm_timer(pd, dur, Box::new(cb))
    }
}

impl Clone for Reactor {
    fn clone(&self) -> Reactor {
        Reactor {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// Posts handlers onto a reactor from foreign threads.
///
/// Handlers are queued MPSC and run on the reactor thread after the I/O
/// callbacks of the wake-up cycle, in FIFO order per posting thread.
#[derive(Clone)]
pub struct Poster {
    posts: Arc<PostQueue>,
}

impl Poster {
    pub fn post(&self, handler: impl FnOnce() + Send + 'static) -> Result<()> {
        self.posts.post(Box::new(handler))
    }
}
