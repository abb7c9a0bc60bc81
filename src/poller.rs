use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::Arc;
use std::time::Duration;

use concurrent_queue::ConcurrentQueue;
use log::trace;
use slab::Slab;

use crate::error::{Error, Result};
use crate::ready::Ready;
use crate::sys::{self, Mode};
use crate::waker::Waker;

/// Completion callback for an armed interest. Receives `Ok(())` on readiness
/// and `Err(Cancelled)` if the owning object is closed first.
pub(crate) type IoHandler = Box<dyn FnOnce(Result<()>)>;

/// A handler posted from a foreign thread.
pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// Token reserved for the wake-up fd.
const WAKER: usize = usize::MAX;

/// Per-fd registration record.
///
/// Every pollable object owns one `PollData` in an `Rc`; while an interest is
/// armed the poller's table holds a clone, which keeps the record alive until
/// the callback has run or been cancelled.
#[derive(Debug)]
pub struct PollData {
    fd: RawFd,
    key: Cell<Option<usize>>,
}

impl PollData {
    pub fn new(fd: RawFd) -> PollData {
        PollData {
            fd,
            key: Cell::new(None),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

struct Entry {
    pd: Rc<PollData>,
    read: Option<IoHandler>,
    write: Option<IoHandler>,
}

impl Entry {
    fn interests(&self) -> Ready {
        let mut ready = Ready::empty();
        if self.read.is_some() {
            ready.insert(Ready::readable());
        }
        if self.write.is_some() {
            ready.insert(Ready::writable());
        }
        ready
    }
}

/// Multiplexes one-shot fd interests, kernel timers and cross-thread posts
/// over the platform selector. Single-threaded except for [`PostQueue`].
pub(crate) struct Poller {
    selector: sys::Selector,
    entries: RefCell<Slab<Entry>>,
    events: RefCell<sys::Events>,
    posts: Arc<PostQueue>,
    armed: Cell<usize>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let selector = sys::Selector::new()?;
        let posts = Arc::new(PostQueue::new()?);

        // The wake-up fd stays registered for the poller's whole life; it is
        // the one interest that is not one-shot.
        selector.add(
            posts.waker.as_raw_fd(),
            WAKER,
            Ready::readable(),
            Mode::Edge,
        )?;

        trace!("new poller, selector fd={}", selector.as_raw_fd());

        Ok(Poller {
            selector,
            entries: RefCell::new(Slab::new()),
            events: RefCell::new(sys::Events::with_capacity(1024)),
            posts,
            armed: Cell::new(0),
        })
    }

    pub fn posts(&self) -> &Arc<PostQueue> {
        &self.posts
    }

    /// Armed interests + timers + unexecuted posts.
    pub fn pending(&self) -> usize {
        self.armed.get() + self.posts.pending()
    }

    pub fn arm_read(&self, pd: &Rc<PollData>, cb: IoHandler) -> Result<()> {
        self.arm(pd, Ready::readable(), cb)
    }

    pub fn arm_write(&self, pd: &Rc<PollData>, cb: IoHandler) -> Result<()> {
        self.arm(pd, Ready::writable(), cb)
    }

    fn arm(&self, pd: &Rc<PollData>, dir: Ready, cb: IoHandler) -> Result<()> {
        let mut entries = self.entries.borrow_mut();

        match pd.key.get() {
            None => {
                let key = entries.insert(Entry {
                    pd: pd.clone(),
                    read: None,
                    write: None,
                });

                if let Err(err) = self.selector.add(pd.fd, key, dir, Mode::Oneshot) {
                    entries.remove(key);
                    return Err(err.into());
                }

                let entry = &mut entries[key];
                if dir.is_readable() {
                    entry.read = Some(cb);
                } else {
                    entry.write = Some(cb);
                }
                pd.key.set(Some(key));

                trace!("armed fd={} dir={:?} token={}", pd.fd, dir, key);
            }
            Some(key) => {
                let Some(entry) = entries.get_mut(key) else {
                    return Err(stale_token());
                };

                let slot = if dir.is_readable() {
                    &mut entry.read
                } else {
                    &mut entry.write
                };
                if slot.is_some() {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "interest already armed for this direction",
                    )));
                }
                *slot = Some(cb);

                let interests = entry.interests();
                if let Err(err) = self.selector.modify(pd.fd, key, interests, Mode::Oneshot) {
                    // Roll the slot back so the failed direction stays unarmed.
                    let entry = &mut entries[key];
                    if dir.is_readable() {
                        entry.read = None;
                    } else {
                        entry.write = None;
                    }
                    return Err(err.into());
                }

                trace!("re-armed fd={} dir={:?} token={}", pd.fd, dir, key);
            }
        }

        self.armed.set(self.armed.get() + 1);
        Ok(())
    }

    /// Arms a one-shot kernel timer on the synthetic ident stored in `pd`.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub fn arm_timer(&self, pd: &Rc<PollData>, dur: Duration, cb: IoHandler) -> Result<()> {
        let mut entries = self.entries.borrow_mut();

        if pd.key.get().is_some() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "timer already armed",
            )));
        }

        let key = entries.insert(Entry {
            pd: pd.clone(),
            read: None,
            write: None,
        });

        if let Err(err) = self.selector.set_timer(pd.fd as usize, key, dur) {
            entries.remove(key);
            return Err(err.into());
        }

        entries[key].read = Some(cb);
        pd.key.set(Some(key));
        self.armed.set(self.armed.get() + 1);

        Ok(())
    }

    /// Removes every interest armed on `pd`, invoking each pending callback
    /// once with `Cancelled`. A no-op when nothing is registered.
    pub fn cancel(&self, pd: &Rc<PollData>) {
        let Some(key) = pd.key.get() else { return };

        let entry = {
            let mut entries = self.entries.borrow_mut();
            match entries.try_remove(key) {
                Some(entry) => entry,
                None => {
                    pd.key.set(None);
                    return;
                }
            }
        };

        pd.key.set(None);
        self.os_delete(pd);

        trace!("cancelled fd={} token={}", pd.fd, key);

        // Run the callbacks after the table borrow is released.
        for cb in [entry.read, entry.write].into_iter().flatten() {
            self.armed.set(self.armed.get() - 1);
            cb(Err(Error::Cancelled));
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn os_delete(&self, pd: &PollData) {
        let _ = self.selector.delete(pd.fd);
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn os_delete(&self, pd: &PollData) {
        if pd.fd < 0 {
            let _ = self.selector.delete_timer(pd.fd as usize);
        } else {
            let _ = self.selector.delete(pd.fd);
        }
    }

    /// One pass of the loop: wait, run readiness callbacks in kernel report
    /// order, then drain posted handlers FIFO. `Err(Timeout)` means nothing
    /// ran before the deadline.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<()> {
        let mut events = match self.events.try_borrow_mut() {
            Ok(events) => events,
            Err(_) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "poll re-entered from a completion handler",
                )))
            }
        };

        match self.selector.wait(&mut events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                // A signal cut the wait short. With a deadline the caller
                // sees an ordinary timeout; a blocking wait reports success
                // with nothing run.
                if timeout.is_some() {
                    return Err(Error::Timeout);
                }

                std::thread::yield_now();
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        let n = events.len();
        if n == 0 {
            return Err(Error::Timeout);
        }

        let mut fired: Vec<IoHandler> = Vec::new();
        let mut woke = false;

        {
            let mut entries = self.entries.borrow_mut();

            for i in 0..n {
                let Some(event) = events.get(i) else { continue };

                if event.token == WAKER {
                    woke = true;
                    continue;
                }

                let (rest, fd) = {
                    // Skip tokens whose interest was cancelled mid-batch.
                    let Some(entry) = entries.get_mut(event.token) else {
                        continue;
                    };

                    let err_like = event.ready.is_error() || event.ready.is_hup();

                    if event.ready.is_readable() || err_like {
                        if let Some(cb) = entry.read.take() {
                            fired.push(cb);
                        }
                    }
                    if event.ready.is_writable() || err_like {
                        if let Some(cb) = entry.write.take() {
                            fired.push(cb);
                        }
                    }

                    (entry.interests(), entry.pd.fd)
                };

                if rest.is_empty() {
                    let entry = entries.remove(event.token);
                    entry.pd.key.set(None);
                    self.os_delete(&entry.pd);
                } else {
                    // The kernel disabled the one-shot registration when it
                    // reported; re-express the direction still armed.
                    let _ = self.selector.modify(fd, event.token, rest, Mode::Oneshot);
                }
            }
        }

        drop(events);

        let mut ran = fired.len();
        self.armed.set(self.armed.get() - ran);

        for cb in fired {
            cb(Ok(()));
        }

        if woke {
            while let Some(task) = self.posts.pop() {
                ran += 1;
                task();
            }
        }

        if ran == 0 {
            return Err(Error::Timeout);
        }

        Ok(())
    }

    /// Cancels everything armed and refuses further posts. The OS handles are
    /// released when the poller is dropped.
    pub fn close(&self) {
        let entries: Vec<Entry> = {
            let mut entries = self.entries.borrow_mut();
            entries.drain().collect()
        };

        for entry in entries {
            entry.pd.key.set(None);
            self.os_delete(&entry.pd);

            for cb in [entry.read, entry.write].into_iter().flatten() {
                self.armed.set(self.armed.get() - 1);
                cb(Err(Error::Cancelled));
            }
        }

        self.posts.close();

        trace!("poller closed, selector fd={}", self.selector.as_raw_fd());
    }
}

fn stale_token() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::NotFound,
        "registration token is stale",
    ))
}

/// The cross-thread half of the poller: an MPSC queue of posted handlers
/// paired with the wake-up fd. The counter/waker dance keeps exactly one
/// wake-up in flight per batch of posts.
pub(crate) struct PostQueue {
    queue: ConcurrentQueue<Task>,
    pending: AtomicUsize,
    waker: Waker,
}

impl PostQueue {
    fn new() -> io::Result<PostQueue> {
        Ok(PostQueue {
            queue: ConcurrentQueue::unbounded(),
            pending: AtomicUsize::new(0),
            waker: Waker::new()?,
        })
    }

    pub fn post(&self, task: Task) -> Result<()> {
        self.queue.push(task).map_err(|_| Error::Closed)?;
        let _ = self.inc();
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Relaxed)
    }

    fn pop(&self) -> Option<Task> {
        match self.queue.pop() {
            Ok(task) => {
                let _ = self.dec();
                Some(task)
            }
            Err(_) => None,
        }
    }

    fn inc(&self) -> io::Result<()> {
        let cnt = self.pending.fetch_add(1, Acquire);

        if 0 == cnt {
            self.waker.wake()?;
        }
        Ok(())
    }

    fn dec(&self) -> io::Result<()> {
        let first = self.pending.load(Acquire);

        if first == 1 {
            self.waker.drain()?;
        }

        let second = self.pending.fetch_sub(1, AcqRel);

        if first == 1 && second > 1 {
            self.waker.wake()?;
        }

        Ok(())
    }

    fn close(&self) {
        self.queue.close();

        while let Ok(_task) = self.queue.pop() {
            let _ = self.dec();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;
    use std::thread;

    // These drive the wake-up fd the way the runtime does: a post adds to
    // the counter, the selector reports the waker token, and the drain
    // resets it.

    #[test]
    fn posted_tasks_wake_the_poller_and_run_fifo() {
        let poller = Poller::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            poller
                .posts()
                .post(Box::new(move || order.lock().unwrap().push(i)))
                .unwrap();
        }
        assert_eq!(poller.pending(), 3);

        poller.poll(Some(Duration::from_secs(1))).unwrap();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(poller.pending(), 0);

        // The queue is empty again, so the wake-up fd must be quiet.
        assert!(matches!(
            poller.poll(Some(Duration::ZERO)),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn cross_thread_post_unblocks_a_waiting_poll() {
        let poller = Poller::new().unwrap();
        let posts = Arc::clone(poller.posts());

        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            posts
                .post(Box::new(move || *flag.lock().unwrap() = true))
                .unwrap();
        });

        poller.poll(None).unwrap();
        handle.join().unwrap();

        assert!(*ran.lock().unwrap());
        assert_eq!(poller.pending(), 0);
    }
}
