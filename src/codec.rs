use std::cell::RefCell;
use std::rc::Rc;

use crate::buffer::ByteBuffer;
use crate::error::{Error, Result};
use crate::stream::Stream;

/// A frame encoder/decoder over a [`ByteBuffer`].
///
/// `encode` appends the wire form of an item to `dst` and must leave `dst`
/// untouched when it fails. `decode` consumes bytes from `src` and returns a
/// frame, or `NeedMore` when the buffered bytes do not yet hold a complete
/// one. On an unrecoverable format error it returns `Decode` and must consume
/// enough bytes to re-synchronize; implementations document their resync
/// policy.
///
/// Implementations may keep state, which makes both stateless and stateful
/// parsers expressible.
pub trait Codec {
    type Encode;
    type Decode;

    fn encode(&mut self, item: Self::Encode, dst: &mut ByteBuffer) -> Result<()>;

    fn decode(&mut self, src: &mut ByteBuffer) -> Result<Self::Decode>;
}

/// Funnels decoded frames through a non-blocking stream.
///
/// Owns the stream, the codec and a pair of buffers: partial reads accumulate
/// in `src` until the codec can produce a frame, outbound frames stage in
/// `dst` until the kernel drains them.
///
/// Non-reentrant: at most one read and one write operation may be in flight
/// at any time.
pub struct CodecConn<S: Stream, C: Codec> {
    inner: Rc<RefCell<Inner<S, C>>>,
}

struct Inner<S, C> {
    stream: S,
    codec: C,
    src: ByteBuffer,
    dst: ByteBuffer,
    reading: bool,
    writing: bool,
}

enum Step<T> {
    Done(Result<T>),
    Again,
    Wait,
}

impl<S: Stream, C: Codec + 'static> CodecConn<S, C> {
    pub fn new(stream: S, codec: C, src: ByteBuffer, dst: ByteBuffer) -> CodecConn<S, C> {
        CodecConn {
            inner: Rc::new(RefCell::new(Inner {
                stream,
                codec,
                src,
                dst,
                reading: false,
                writing: false,
            })),
        }
    }

    /// Decodes the next frame, reading from the stream whenever the codec
    /// reports `NeedMore`. Transient `WouldBlock` from the stream surfaces
    /// to the caller; use [`CodecConn::async_read_next`] to wait instead.
    pub fn read_next(&self) -> Result<C::Decode> {
        let mut inner = self.inner.borrow_mut();

        loop {
            let Inner {
                stream, codec, src, ..
            } = &mut *inner;

            match codec.decode(src) {
                Err(Error::NeedMore) => {
                    src.read_from(stream)?;
                }
                res => return res,
            }
        }
    }

    /// Encodes `item` and flushes the whole staging buffer, returning the
    /// bytes written to the stream.
    pub fn write_next(&self, item: C::Encode) -> Result<usize> {
        let mut inner = self.inner.borrow_mut();

        {
            let Inner { codec, dst, .. } = &mut *inner;
            codec.encode(item, dst)?;
        }

        let mut total = 0;
        loop {
            let Inner { stream, dst, .. } = &mut *inner;

            if dst.is_empty() {
                return Ok(total);
            }
            total += dst.write_to(stream)?;
        }
    }

    /// Asynchronous [`CodecConn::read_next`]. Progress is made inline while
    /// the kernel has bytes; on `WouldBlock` the connection arms read
    /// interest and continues from the readiness callback, so a slow peer
    /// re-enters through the reactor instead of growing the stack.
    pub fn async_read_next(&self, cb: impl FnOnce(Result<C::Decode>) + 'static) {
        {
            let mut inner = self.inner.borrow_mut();
            debug_assert!(!inner.reading, "read already in flight");
            inner.reading = true;
        }

        Self::read_step(self.clone(), Box::new(cb));
    }

    fn read_step(conn: CodecConn<S, C>, cb: Box<dyn FnOnce(Result<C::Decode>)>) {
        loop {
            let step = {
                let mut inner = conn.inner.borrow_mut();
                let Inner {
                    stream, codec, src, ..
                } = &mut *inner;

                match codec.decode(src) {
                    Err(Error::NeedMore) => match src.read_from(stream) {
                        Ok(_) => Step::Again,
                        Err(Error::WouldBlock) => Step::Wait,
                        Err(err) => Step::Done(Err(err)),
                    },
                    res => Step::Done(res),
                }
            };

            match step {
                Step::Again => {}
                Step::Done(res) => {
                    conn.inner.borrow_mut().reading = false;
                    return cb(res);
                }
                Step::Wait => {
                    let stream = conn.inner.borrow().stream.clone();
                    return stream.async_wait_read(move |res| match res {
                        Ok(()) => Self::read_step(conn, cb),
                        Err(err) => {
                            conn.inner.borrow_mut().reading = false;
                            cb(Err(err))
                        }
                    });
                }
            }
        }
    }

    /// Asynchronous [`CodecConn::write_next`]: encode, then flush the
    /// staging buffer as the kernel accepts bytes.
    pub fn async_write_next(&self, item: C::Encode, cb: impl FnOnce(Result<usize>) + 'static) {
        {
            let mut inner = self.inner.borrow_mut();
            debug_assert!(!inner.writing, "write already in flight");

            let Inner { codec, dst, .. } = &mut *inner;
            if let Err(err) = codec.encode(item, dst) {
                drop(inner);
                return cb(Err(err));
            }
            inner.writing = true;
        }

        Self::write_step(self.clone(), 0, Box::new(cb));
    }

    fn write_step(conn: CodecConn<S, C>, mut total: usize, cb: Box<dyn FnOnce(Result<usize>)>) {
        loop {
            let step = {
                let mut inner = conn.inner.borrow_mut();
                let Inner { stream, dst, .. } = &mut *inner;

                if dst.is_empty() {
                    Step::Done(Ok(total))
                } else {
                    match dst.write_to(stream) {
                        Ok(n) => {
                            total += n;
                            Step::Again
                        }
                        Err(Error::WouldBlock) => Step::Wait,
                        Err(err) => Step::Done(Err(err)),
                    }
                }
            };

            match step {
                Step::Again => {}
                Step::Done(res) => {
                    conn.inner.borrow_mut().writing = false;
                    return cb(res);
                }
                Step::Wait => {
                    let stream = conn.inner.borrow().stream.clone();
                    return stream.async_wait_write(move |res| match res {
                        Ok(()) => Self::write_step(conn, total, cb),
                        Err(err) => {
                            conn.inner.borrow_mut().writing = false;
                            cb(Err(err))
                        }
                    });
                }
            }
        }
    }

    /// The underlying stream handle.
    pub fn next_layer(&self) -> S {
        self.inner.borrow().stream.clone()
    }
}

impl<S: Stream, C: Codec> Clone for CodecConn<S, C> {
    fn clone(&self) -> CodecConn<S, C> {
        CodecConn {
            inner: Rc::clone(&self.inner),
        }
    }
}
