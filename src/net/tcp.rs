use std::cell::Cell;
use std::io::{Read, Write};
use std::net::{self, Shutdown, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::reactor::{PollData, Reactor};
use crate::stream::Stream;

/// A non-blocking TCP connection bound to a reactor.
///
/// A cheap clonable handle; clones share the socket and its registration.
#[derive(Clone)]
pub struct TcpConn {
    inner: Rc<TcpInner>,
}

struct TcpInner {
    stream: net::TcpStream,
    pd: Rc<PollData>,
    reactor: Reactor,
    closed: Cell<bool>,
}

impl TcpConn {
    /// Connects (blocking) and switches the socket to non-blocking mode.
    pub fn connect<A: ToSocketAddrs>(reactor: &Reactor, addr: A) -> Result<TcpConn> {
        let stream = net::TcpStream::connect(addr).map_err(Error::Io)?;
        TcpConn::from_std(reactor, stream)
    }

    pub fn from_std(reactor: &Reactor, stream: net::TcpStream) -> Result<TcpConn> {
        stream.set_nonblocking(true).map_err(Error::Io)?;

        let pd = Rc::new(PollData::new(stream.as_raw_fd()));

        Ok(TcpConn {
            inner: Rc::new(TcpInner {
                stream,
                pd,
                reactor: reactor.clone(),
                closed: Cell::new(false),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.stream.local_addr().map_err(Error::Io)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner.stream.peer_addr().map_err(Error::Io)
    }

    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        self.inner.stream.set_nodelay(nodelay).map_err(Error::Io)
    }

    pub fn nodelay(&self) -> Result<bool> {
        self.inner.stream.nodelay().map_err(Error::Io)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.get() {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl Stream for TcpConn {
    fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    fn poll_data(&self) -> &Rc<PollData> {
        &self.inner.pd
    }

    fn read_some(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        (&self.inner.stream).read(buf).map_err(Error::from_io)
    }

    fn write_some(&self, buf: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        (&self.inner.stream).write(buf).map_err(Error::from_io)
    }

    fn close(&self) -> Result<()> {
        if self.inner.closed.replace(true) {
            return Err(Error::Closed);
        }

        self.inner.reactor.deregister(&self.inner.pd);
        let _ = self.inner.stream.shutdown(Shutdown::Both);
        Ok(())
    }
}

impl AsRawFd for TcpConn {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.stream.as_raw_fd()
    }
}

impl Drop for TcpInner {
    fn drop(&mut self) {
        if !self.closed.get() {
            self.reactor.deregister(&self.pd);
        }
    }
}

/// Accepts peers as reactor-bound [`TcpConn`]s.
///
/// `accept` blocks the calling thread; suitable for tests and simple
/// servers that accept before entering the loop.
pub struct TcpListener {
    inner: net::TcpListener,
    reactor: Reactor,
}

impl TcpListener {
    pub fn bind<A: ToSocketAddrs>(reactor: &Reactor, addr: A) -> Result<TcpListener> {
        let listener = net::TcpListener::bind(addr).map_err(Error::Io)?;

        Ok(TcpListener {
            inner: listener,
            reactor: reactor.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr().map_err(Error::Io)
    }

    pub fn accept(&self) -> Result<(TcpConn, SocketAddr)> {
        let (stream, addr) = self.inner.accept().map_err(Error::Io)?;
        Ok((TcpConn::from_std(&self.reactor, stream)?, addr))
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
