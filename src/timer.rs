use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::reactor::{PollData, Reactor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Armed,
    Closed,
}

/// A timer scheduled on the reactor.
///
/// One-shot via [`Timer::set`] (re-setting an armed timer unsets it first),
/// repeating via [`Timer::set_periodic`]. [`Timer::unset`] cancels without
/// running the user callback.
///
/// Backed by a timerfd on Linux and by `EVFILT_TIMER` on BSDs; the BSD ident
/// comes from a monotonically decreasing negative counter, so it can never
/// collide with a real descriptor registered on the same poller.
pub struct Timer {
    inner: Rc<TimerInner>,
}

struct TimerInner {
    reactor: Reactor,

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fd: crate::sys::timerfd::TimerFd,

    pd: Rc<PollData>,
    state: Cell<State>,
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
static NEXT_IDENT: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(-2);

impl Timer {
    pub fn new(reactor: &Reactor) -> Result<Timer> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let inner = {
            use std::os::unix::io::AsRawFd;

            let fd = crate::sys::timerfd::TimerFd::new()?;
            let pd = Rc::new(PollData::new(fd.as_raw_fd()));
            TimerInner {
                reactor: reactor.clone(),
                fd,
                pd,
                state: Cell::new(State::Idle),
            }
        };

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let inner = {
            use std::sync::atomic::Ordering;

            let ident = NEXT_IDENT.fetch_sub(1, Ordering::Relaxed);
            TimerInner {
                reactor: reactor.clone(),
                pd: Rc::new(PollData::new(ident)),
                state: Cell::new(State::Idle),
            }
        };

        Ok(Timer {
            inner: Rc::new(inner),
        })
    }

    /// Arms the timer to run `cb` exactly once after `dur`. An armed timer is
    /// unset first, so the previous interest never leaks.
    pub fn set(&self, dur: Duration, cb: impl FnOnce() + 'static) -> Result<()> {
        self.ensure_open()?;
        self.unset()?;

        let inner = Rc::clone(&self.inner);
        let fire = move |res: Result<()>| {
            // Cancelled by unset/close; the user callback must not run.
            if res.is_err() {
                return;
            }
            inner.consume_expiry();
            inner.state.set(State::Idle);
            cb();
        };

        self.inner.arm(dur, fire)?;
        self.inner.state.set(State::Armed);
        Ok(())
    }

    /// Arms the timer to run `cb` every `dur` until unset or closed.
    pub fn set_periodic(&self, dur: Duration, cb: impl FnMut() + 'static) -> Result<()> {
        self.ensure_open()?;
        self.unset()?;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        self.inner.fd.arm_periodic(dur)?;

        self.inner.state.set(State::Armed);

        let cb: Rc<RefCell<dyn FnMut()>> = Rc::new(RefCell::new(cb));
        let res = TimerInner::tick(Rc::clone(&self.inner), dur, cb);
        if res.is_err() {
            self.inner.disarm();
            self.inner.state.set(State::Idle);
        }
        res
    }

    /// Cancels a pending expiry. A no-op when idle; the user callback is
    /// dropped, not invoked.
    pub fn unset(&self) -> Result<()> {
        if self.inner.state.get() != State::Armed {
            return Ok(());
        }

        self.inner.disarm();
        self.inner.state.set(State::Idle);
        Ok(())
    }

    /// Unsets and renders the timer unusable; later calls fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        if self.inner.state.get() == State::Closed {
            return Err(Error::Closed);
        }

        self.unset()?;
        self.inner.state.set(State::Closed);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.state.get() == State::Closed {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl TimerInner {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn arm(&self, dur: Duration, cb: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        self.fd.arm_oneshot(dur)?;
        self.register(cb)
    }

    /// Interest for the next expiry of an already-ticking timer. The kernel
    /// interval keeps firing on Linux, so only the read interest needs
    /// re-expressing; BSDs chain one-shot kernel timers instead.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn arm_tick(&self, _dur: Duration, cb: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        self.register(cb)
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn register(&self, cb: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        if let Err(err) = self.reactor.register_read(&self.pd, cb) {
            let _ = self.fd.disarm();
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn arm(&self, dur: Duration, cb: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        self.reactor.register_timer(&self.pd, dur, cb)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn arm_tick(&self, dur: Duration, cb: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        self.reactor.register_timer(&self.pd, dur, cb)
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn disarm(&self) {
        let _ = self.fd.disarm();
        self.reactor.deregister(&self.pd);
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn disarm(&self) {
        self.reactor.deregister(&self.pd);
    }

    /// Reads the timerfd expiration counter so the fd stops polling ready.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn consume_expiry(&self) {
        let _ = self.fd.expirations();
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn consume_expiry(&self) {}

    /// One period of a periodic timer: run the callback, then re-express
    /// interest for the next expiry. Re-entry goes through the reactor, so
    /// the chain never grows the stack.
    fn tick(inner: Rc<TimerInner>, dur: Duration, cb: Rc<RefCell<dyn FnMut()>>) -> Result<()> {
        let this = Rc::clone(&inner);
        inner.arm_tick(dur, move |res: Result<()>| {
            if res.is_err() {
                return;
            }
            this.consume_expiry();
            (cb.borrow_mut())();

            if this.state.get() == State::Armed {
                let again = Rc::clone(&this);
                let _ = TimerInner::tick(again, dur, cb);
            }
        })
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        self.reactor.deregister(&self.pd);
    }
}
