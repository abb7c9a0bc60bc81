use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::time::Duration;

use super::FileDesc;

/// A kernel timer delivered through a pollable descriptor
/// (`timerfd_create(2)`), ticking on the monotonic clock.
///
/// The descriptor polls readable once the timer expires; reading it takes
/// the expiration count and quiets it until the next expiry.
#[derive(Debug)]
pub struct TimerFd {
    inner: FileDesc,
}

impl TimerFd {
    pub fn new() -> io::Result<TimerFd> {
        let fd = syscall!(timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_CLOEXEC | libc::TFD_NONBLOCK
        ))?;
        Ok(TimerFd {
            inner: FileDesc::new(fd),
        })
    }

    /// Arms a single expiry `dur` from now.
    pub fn arm_oneshot(&self, dur: Duration) -> io::Result<()> {
        // A zero it_value would disarm instead of expiring immediately.
        let value = if dur.is_zero() {
            Duration::from_nanos(1)
        } else {
            dur
        };
        self.settime(Duration::ZERO, value)
    }

    /// First expiry after `dur`, then every `dur`.
    pub fn arm_periodic(&self, dur: Duration) -> io::Result<()> {
        self.settime(dur, dur)
    }

    pub fn disarm(&self) -> io::Result<()> {
        self.settime(Duration::ZERO, Duration::ZERO)
    }

    fn settime(&self, interval: Duration, value: Duration) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: timespec(interval),
            it_value: timespec(value),
        };

        syscall!(timerfd_settime(self.inner.raw(), 0, &spec, ptr::null_mut()))?;
        Ok(())
    }

    /// Expiries since the last arm or read. `WouldBlock` when the timer has
    /// not fired yet.
    pub fn expirations(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.inner.read(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

fn timespec(dur: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: dur.as_secs() as libc::time_t,
        tv_nsec: dur.subsec_nanos() as _,
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}
