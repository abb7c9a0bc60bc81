use std::cell::RefCell;
use std::cmp;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::stream::Stream;

const MIN_GROW: usize = 512;

/// A split read/write byte buffer for streaming I/O.
///
/// Three regions over one backing allocation: committed-and-consumed bytes in
/// `[0, r)`, the readable area in `[r, w)` and the writable area in
/// `[w, cap)`. Incoming bytes land in the write area and become readable via
/// [`ByteBuffer::commit`]; decoded bytes leave the read area via
/// [`ByteBuffer::consume`]. When the read area empties, both indices reset to
/// zero so the allocation is reused instead of crawling forward.
///
/// `0 <= r <= w <= cap` holds after every operation. Capacity only grows,
/// and only between transfers, so no slice handed to the kernel is ever
/// invalidated mid-operation.
pub struct ByteBuffer {
    data: Vec<u8>,
    r: usize,
    w: usize,
}

impl ByteBuffer {
    pub fn new(cap: usize) -> ByteBuffer {
        ByteBuffer {
            data: vec![0; cap],
            r: 0,
            w: 0,
        }
    }

    /// Bytes currently readable.
    pub fn len(&self) -> usize {
        self.w - self.r
    }

    pub fn is_empty(&self) -> bool {
        self.r == self.w
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Ensures the write area holds at least `n` bytes, growing if needed.
    pub fn prepare(&mut self, n: usize) {
        if self.data.len() - self.w < n {
            self.data.resize(self.w + n, 0);
        }
    }

    /// Moves `n` bytes written into the write area into the read area.
    pub fn commit(&mut self, n: usize) {
        self.w = cmp::min(self.w + n, self.data.len());
    }

    /// Drops `n` bytes from the front of the read area.
    pub fn consume(&mut self, n: usize) {
        self.r = cmp::min(self.r + n, self.w);

        if self.r == self.w {
            self.r = 0;
            self.w = 0;
        }
    }

    /// The readable bytes.
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.r..self.w]
    }

    /// The first `n` bytes of the write area, growing the buffer if needed.
    /// Pair with [`ByteBuffer::commit`] once filled.
    pub fn write_slice(&mut self, n: usize) -> &mut [u8] {
        self.prepare(n);
        &mut self.data[self.w..self.w + n]
    }

    pub fn clear(&mut self) {
        self.r = 0;
        self.w = 0;
    }

    /// Reads once from `stream` into the write area and commits whatever
    /// arrived. Partial reads are normal; a 0-byte read means the peer
    /// closed and surfaces as `Closed`.
    pub fn read_from<S: Stream>(&mut self, stream: &S) -> Result<usize> {
        if self.w == self.data.len() {
            self.prepare(cmp::max(self.data.len(), MIN_GROW));
        }

        let n = stream.read_some(&mut self.data[self.w..])?;
        if n == 0 {
            return Err(Error::Closed);
        }

        self.commit(n);
        Ok(n)
    }

    /// Writes once from the read area to `stream` and consumes what was
    /// taken. Returns the byte count; 0 when there was nothing to write.
    pub fn write_to<S: Stream>(&mut self, stream: &S) -> Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }

        let n = stream.write_some(&self.data[self.r..self.w])?;
        self.consume(n);
        Ok(n)
    }

    /// Asynchronous [`ByteBuffer::read_from`]: tries immediately, otherwise
    /// arms read interest and retries on readiness. `cb` runs on the reactor
    /// thread, inline when the kernel already has bytes.
    pub fn async_read_from<S: Stream>(
        this: &Rc<RefCell<ByteBuffer>>,
        stream: &S,
        cb: impl FnOnce(Result<usize>) + 'static,
    ) {
        let res = this.borrow_mut().read_from(stream);
        match res {
            Err(Error::WouldBlock) => {
                Self::wait_readable(Rc::clone(this), stream.clone(), Box::new(cb))
            }
            res => cb(res),
        }
    }

    fn wait_readable<S: Stream>(
        this: Rc<RefCell<ByteBuffer>>,
        stream: S,
        cb: Box<dyn FnOnce(Result<usize>)>,
    ) {
        let retry = stream.clone();
        stream.async_wait_read(move |res| match res {
            Err(err) => cb(Err(err)),
            Ok(()) => {
                let read = this.borrow_mut().read_from(&retry);
                match read {
                    Err(Error::WouldBlock) => Self::wait_readable(this, retry, cb),
                    read => cb(read),
                }
            }
        });
    }

    /// Asynchronously flushes the whole read area to `stream`, consuming as
    /// the kernel accepts bytes; `cb` receives the total written.
    pub fn async_write_to<S: Stream>(
        this: &Rc<RefCell<ByteBuffer>>,
        stream: &S,
        cb: impl FnOnce(Result<usize>) + 'static,
    ) {
        Self::flush(Rc::clone(this), stream.clone(), 0, Box::new(cb))
    }

    fn flush<S: Stream>(
        this: Rc<RefCell<ByteBuffer>>,
        stream: S,
        mut total: usize,
        cb: Box<dyn FnOnce(Result<usize>)>,
    ) {
        loop {
            let res = this.borrow_mut().write_to(&stream);
            match res {
                Ok(0) => return cb(Ok(total)),
                Ok(n) => {
                    total += n;
                    if this.borrow().is_empty() {
                        return cb(Ok(total));
                    }
                }
                Err(Error::WouldBlock) => {
                    let retry = stream.clone();
                    return stream.async_wait_write(move |res| match res {
                        Ok(()) => Self::flush(this, retry, total, cb),
                        Err(err) => cb(Err(err)),
                    });
                }
                Err(err) => return cb(Err(err)),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::ByteBuffer;

    fn invariant(b: &ByteBuffer) {
        assert!(b.r <= b.w);
        assert!(b.w <= b.data.len());
    }

    #[test]
    fn prepare_commit_consume() {
        let mut b = ByteBuffer::new(8);
        assert_eq!(b.capacity(), 8);
        assert!(b.is_empty());

        b.write_slice(3).copy_from_slice(b"abc");
        b.commit(3);
        invariant(&b);
        assert_eq!(b.read_slice(), b"abc");

        b.consume(2);
        invariant(&b);
        assert_eq!(b.read_slice(), b"c");

        // Consuming the rest resets both indices.
        b.consume(1);
        invariant(&b);
        assert!(b.is_empty());
        assert_eq!(b.r, 0);
        assert_eq!(b.w, 0);
    }

    #[test]
    fn grows_but_never_shrinks() {
        let mut b = ByteBuffer::new(4);

        b.write_slice(2).copy_from_slice(b"hi");
        b.commit(2);

        b.prepare(64);
        invariant(&b);
        assert!(b.capacity() >= 66);
        assert_eq!(b.read_slice(), b"hi");

        b.prepare(1);
        assert!(b.capacity() >= 66);
    }

    #[test]
    fn over_commit_and_over_consume_clamp() {
        let mut b = ByteBuffer::new(4);

        b.commit(100);
        invariant(&b);
        assert_eq!(b.len(), 4);

        b.consume(100);
        invariant(&b);
        assert!(b.is_empty());
    }
}
