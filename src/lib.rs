//! A single-threaded reactor I/O runtime for latency-sensitive networking:
//! market data, multicast feeds, custom wire protocols.
//!
//! One thread owns a [`Reactor`] and everything registered with it: sockets,
//! timers, buffers. Readiness is delivered through the platform selector
//! (epoll on Linux, kqueue on the BSDs) as one-shot interests: a callback
//! fires at most once and re-arms if it wants more. Foreign threads enter
//! only through [`Poster::post`].
//!
//! The codec layer streams decoded frames out of a [`ByteBuffer`] fed by a
//! non-blocking [`Stream`]; [`net::multicast::UdpPeer`] adds UDP multicast
//! with explicit membership, outbound-interface, TTL and loopback control.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use pulse_io::{Reactor, Timer};
//!
//! let reactor = Reactor::new().unwrap();
//!
//! let timer = Timer::new(&reactor).unwrap();
//! timer.set(Duration::from_millis(100), || {
//!     println!("tick");
//! }).unwrap();
//!
//! // Runs until every armed interest, timer and post has completed.
//! reactor.run_pending().unwrap();
//! ```

#[macro_use]
mod macros;

mod buffer;
mod codec;
mod error;
mod poller;
mod reactor;
mod ready;
mod stream;
mod timer;
mod waker;

pub mod net;
pub mod sys;

pub use buffer::ByteBuffer;
pub use codec::{Codec, CodecConn};
pub use error::{Error, Result};
pub use reactor::{PollData, Poster, Reactor};
pub use ready::Ready;
pub use stream::Stream;
pub use timer::Timer;

pub use net::multicast::{Membership, UdpPeer};
pub use net::tcp::{TcpConn, TcpListener};
