use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pulse_io::{Error, Reactor, Stream, TcpConn, TcpListener, Timer};

fn tcp_pair(reactor: &Reactor) -> (TcpConn, TcpConn) {
    let listener = TcpListener::bind(reactor, "127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpConn::connect(reactor, addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

fn spin(reactor: &Reactor, dur: Duration) {
    let deadline = Instant::now() + dur;
    while Instant::now() < deadline {
        match reactor.run_one_for(Duration::from_millis(10)) {
            Ok(()) | Err(Error::Timeout) => {}
            Err(err) => panic!("reactor error: {}", err),
        }
    }
}

#[test]
fn fresh_reactor_has_nothing_pending() {
    let reactor = Reactor::new().unwrap();
    assert_eq!(reactor.pending(), 0);
}

#[test]
fn posts_run_in_fifo_order() {
    let reactor = Reactor::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..3 {
        let order = Arc::clone(&order);
        reactor.post(move || order.lock().unwrap().push(i)).unwrap();
    }

    assert_eq!(reactor.pending(), 3);
    reactor.run_pending().unwrap();

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(reactor.pending(), 0);
}

#[test]
fn cross_thread_posts_keep_per_thread_order() {
    let reactor = Reactor::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for tag in 0..2 {
        let poster = reactor.poster();
        let order = Arc::clone(&order);

        handles.push(thread::spawn(move || {
            for i in 0..50 {
                let order = Arc::clone(&order);
                poster.post(move || order.lock().unwrap().push((tag, i))).unwrap();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    reactor.run_pending().unwrap();

    let observed = order.lock().unwrap();
    assert_eq!(observed.len(), 100);

    // FIFO per posting thread; no guarantee across posters.
    for tag in 0..2 {
        let seq: Vec<i32> = observed
            .iter()
            .filter(|(t, _)| *t == tag)
            .map(|(_, i)| *i)
            .collect();
        assert_eq!(seq, (0..50).collect::<Vec<_>>());
    }

    assert_eq!(reactor.pending(), 0);
}

#[test]
fn one_shot_interest_does_not_redeliver() {
    let reactor = Reactor::new().unwrap();
    let (client, server) = tcp_pair(&reactor);

    client.write_some(b"x").unwrap();

    let fired = Rc::new(Cell::new(0));
    let counter = Rc::clone(&fired);
    server.async_wait_read(move |res| {
        res.unwrap();
        counter.set(counter.get() + 1);
    });

    while fired.get() == 0 {
        reactor.run_one().unwrap();
    }

    // The byte is still unread, but the interest was one-shot: polling again
    // must not re-invoke the callback.
    assert!(matches!(reactor.poll_one(), Err(Error::Timeout)));
    assert_eq!(fired.get(), 1);
    assert_eq!(reactor.pending(), 0);
}

#[test]
fn closing_a_stream_cancels_armed_interest() {
    let reactor = Reactor::new().unwrap();
    let (_client, server) = tcp_pair(&reactor);

    let got = Rc::new(RefCell::new(None));
    let tx = Rc::clone(&got);
    server.async_wait_read(move |res| {
        *tx.borrow_mut() = Some(res);
    });

    assert_eq!(reactor.pending(), 1);

    server.close().unwrap();

    assert!(matches!(got.borrow_mut().take(), Some(Err(Error::Cancelled))));
    assert_eq!(reactor.pending(), 0);

    // Operations after close report Closed.
    assert!(matches!(server.read_some(&mut [0; 8]), Err(Error::Closed)));
    assert!(matches!(server.close(), Err(Error::Closed)));
}

#[test]
fn timer_fires_exactly_once() {
    let reactor = Reactor::new().unwrap();
    let timer = Timer::new(&reactor).unwrap();

    let fired = Rc::new(Cell::new(0));
    let counter = Rc::clone(&fired);
    timer
        .set(Duration::from_millis(50), move || {
            counter.set(counter.get() + 1);
        })
        .unwrap();

    assert_eq!(reactor.pending(), 1);

    spin(&reactor, Duration::from_millis(200));

    assert_eq!(fired.get(), 1);
    assert_eq!(reactor.pending(), 0);
}

#[test]
fn rearming_a_timer_does_not_leak_interest() {
    let reactor = Reactor::new().unwrap();
    let timer = Timer::new(&reactor).unwrap();

    let fired = Rc::new(Cell::new(0));

    for _ in 0..3 {
        let counter = Rc::clone(&fired);
        timer
            .set(Duration::from_secs(60), move || {
                counter.set(counter.get() + 1);
            })
            .unwrap();
        assert_eq!(reactor.pending(), 1);
    }

    timer.unset().unwrap();
    assert_eq!(reactor.pending(), 0);
    assert_eq!(fired.get(), 0);
}

#[test]
fn unset_timer_never_runs_the_callback() {
    let reactor = Reactor::new().unwrap();
    let timer = Timer::new(&reactor).unwrap();

    let fired = Rc::new(Cell::new(false));
    let flag = Rc::clone(&fired);
    timer
        .set(Duration::from_millis(20), move || flag.set(true))
        .unwrap();

    timer.unset().unwrap();
    spin(&reactor, Duration::from_millis(60));

    assert!(!fired.get());
    assert_eq!(reactor.pending(), 0);
}

#[test]
fn periodic_timer_repeats_until_unset() {
    let reactor = Reactor::new().unwrap();
    let timer = Timer::new(&reactor).unwrap();

    let ticks = Rc::new(Cell::new(0));
    let counter = Rc::clone(&ticks);
    timer
        .set_periodic(Duration::from_millis(10), move || {
            counter.set(counter.get() + 1);
        })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while ticks.get() < 3 {
        assert!(Instant::now() < deadline, "periodic timer too slow");
        let _ = reactor.run_one_for(Duration::from_millis(50));
    }

    timer.unset().unwrap();
    assert_eq!(reactor.pending(), 0);

    let after = ticks.get();
    spin(&reactor, Duration::from_millis(50));
    assert_eq!(ticks.get(), after);
}

#[test]
fn closed_timer_refuses_work() {
    let reactor = Reactor::new().unwrap();
    let timer = Timer::new(&reactor).unwrap();

    timer.close().unwrap();
    assert!(matches!(timer.close(), Err(Error::Closed)));
    assert!(matches!(
        timer.set(Duration::from_millis(1), || {}),
        Err(Error::Closed)
    ));
}

#[test]
fn run_one_for_returns_timeout_when_idle() {
    let reactor = Reactor::new().unwrap();

    let start = Instant::now();
    let res = reactor.run_one_for(Duration::from_millis(30));

    assert!(matches!(res, Err(Error::Timeout)));
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[test]
fn poll_one_is_nonblocking() {
    let reactor = Reactor::new().unwrap();

    let start = Instant::now();
    assert!(matches!(reactor.poll_one(), Err(Error::Timeout)));
    assert!(start.elapsed() < Duration::from_millis(20));
}

#[test]
fn close_is_idempotent_with_error() {
    let reactor = Reactor::new().unwrap();

    reactor.close().unwrap();
    assert!(matches!(reactor.close(), Err(Error::Closed)));
    assert!(matches!(reactor.poll_one(), Err(Error::Closed)));
    assert!(matches!(reactor.post(|| {}), Err(Error::Closed)));
}

#[test]
fn close_cancels_armed_interest_and_drops_posts() {
    let reactor = Reactor::new().unwrap();
    let (_client, server) = tcp_pair(&reactor);

    let got = Rc::new(RefCell::new(None));
    let tx = Rc::clone(&got);
    server.async_wait_read(move |res| {
        *tx.borrow_mut() = Some(res);
    });

    let ran = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&ran);
    reactor.post(move || *flag.lock().unwrap() = true).unwrap();

    assert_eq!(reactor.pending(), 2);

    reactor.close().unwrap();

    assert!(matches!(got.borrow_mut().take(), Some(Err(Error::Cancelled))));
    assert!(!*ran.lock().unwrap());
    assert_eq!(reactor.pending(), 0);
}

#[test]
fn foreign_thread_requests_shutdown() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let reactor = Reactor::new().unwrap();
    let poster = reactor.poster();

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);

    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        flag.store(true, Ordering::Release);
        poster.post(|| {}).unwrap();
    });

    // The empty post is the wake-up; the owning thread observes the flag and
    // closes from its own side.
    while !stop.load(Ordering::Acquire) {
        match reactor.run_one() {
            Ok(()) | Err(Error::Timeout) => {}
            Err(err) => panic!("reactor error: {}", err),
        }
    }

    handle.join().unwrap();

    reactor.close().unwrap();
    assert!(matches!(reactor.run(), Err(Error::Closed)));
}
