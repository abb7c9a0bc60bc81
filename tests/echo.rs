use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use pulse_io::{ByteBuffer, Codec, CodecConn, Error, Reactor, Result, Stream, TcpConn, TcpListener};

const MAX_FRAME: usize = 32 * 1024;

/// 2-byte big-endian length prefix + payload.
///
/// Resync policy: an oversized length consumes the 2-byte header, so decoding
/// resumes at the next prefix boundary.
struct FrameCodec;

impl Codec for FrameCodec {
    type Encode = Vec<u8>;
    type Decode = Vec<u8>;

    fn encode(&mut self, item: Vec<u8>, dst: &mut ByteBuffer) -> Result<()> {
        if item.len() > MAX_FRAME {
            return Err(Error::Encode(format!("frame of {} bytes", item.len())));
        }

        let total = 2 + item.len();
        let slice = dst.write_slice(total);
        slice[..2].copy_from_slice(&(item.len() as u16).to_be_bytes());
        slice[2..].copy_from_slice(&item);
        dst.commit(total);
        Ok(())
    }

    fn decode(&mut self, src: &mut ByteBuffer) -> Result<Vec<u8>> {
        let data = src.read_slice();
        if data.len() < 2 {
            return Err(Error::NeedMore);
        }

        let len = u16::from_be_bytes([data[0], data[1]]) as usize;
        if len > MAX_FRAME {
            src.consume(2);
            return Err(Error::Decode(format!("frame length {}", len)));
        }

        if data.len() < 2 + len {
            return Err(Error::NeedMore);
        }

        let frame = data[2..2 + len].to_vec();
        src.consume(2 + len);
        Ok(frame)
    }
}

fn conn(stream: TcpConn) -> CodecConn<TcpConn, FrameCodec> {
    CodecConn::new(
        stream,
        FrameCodec,
        ByteBuffer::new(128),
        ByteBuffer::new(128),
    )
}

fn tcp_pair(reactor: &Reactor) -> (TcpConn, TcpConn) {
    let listener = TcpListener::bind(reactor, "127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpConn::connect(reactor, addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

/// Spins the reactor until `slot` is filled by a completion handler.
fn wait_for<T>(reactor: &Reactor, slot: &Rc<RefCell<Option<T>>>) -> T {
    let deadline = Instant::now() + Duration::from_secs(5);

    while slot.borrow().is_none() {
        assert!(Instant::now() < deadline, "no completion within 5s");
        match reactor.run_one_for(Duration::from_millis(100)) {
            Ok(()) | Err(Error::Timeout) => {}
            Err(err) => panic!("reactor error: {}", err),
        }
    }

    slot.borrow_mut().take().unwrap()
}

fn read_frame(reactor: &Reactor, conn: &CodecConn<TcpConn, FrameCodec>) -> Result<Vec<u8>> {
    let slot = Rc::new(RefCell::new(None));
    let tx = Rc::clone(&slot);
    conn.async_read_next(move |res| {
        *tx.borrow_mut() = Some(res);
    });
    wait_for(reactor, &slot)
}

#[test]
fn round_trip() {
    let mut codec = FrameCodec;
    let mut buf = ByteBuffer::new(64);

    codec.encode(b"foo".to_vec(), &mut buf).unwrap();
    assert_eq!(buf.read_slice(), &[0x00, 0x03, b'f', b'o', b'o']);

    let frame = codec.decode(&mut buf).unwrap();
    assert_eq!(frame, b"foo");
    assert!(buf.is_empty());
}

#[test]
fn decode_needs_more_on_partial_frame() {
    let mut codec = FrameCodec;
    let mut buf = ByteBuffer::new(64);

    assert!(matches!(codec.decode(&mut buf), Err(Error::NeedMore)));

    buf.write_slice(3).copy_from_slice(&[0x00, 0x05, b'h']);
    buf.commit(3);
    assert!(matches!(codec.decode(&mut buf), Err(Error::NeedMore)));

    // The partial frame stays buffered.
    assert_eq!(buf.len(), 3);
}

#[test]
fn decode_error_resynchronizes() {
    let mut codec = FrameCodec;
    let mut buf = ByteBuffer::new(64);

    // Length 0xffff is over the cap; the header is consumed, the next frame
    // decodes cleanly.
    buf.write_slice(2).copy_from_slice(&[0xff, 0xff]);
    buf.commit(2);
    codec.encode(b"ok".to_vec(), &mut buf).unwrap();

    assert!(matches!(codec.decode(&mut buf), Err(Error::Decode(_))));
    assert_eq!(codec.decode(&mut buf).unwrap(), b"ok");
}

#[test]
fn encode_failure_leaves_dst_unchanged() {
    let mut codec = FrameCodec;
    let mut buf = ByteBuffer::new(64);

    let res = codec.encode(vec![0u8; MAX_FRAME + 1], &mut buf);
    assert!(matches!(res, Err(Error::Encode(_))));
    assert!(buf.is_empty());
}

#[test]
fn framed_echo() {
    let reactor = Reactor::new().unwrap();
    let (client, server) = tcp_pair(&reactor);

    let client = conn(client);
    let server = conn(server);

    let n = client.write_next(b"foo".to_vec()).unwrap();
    assert_eq!(n, 5);

    let frame = read_frame(&reactor, &server).unwrap();
    assert_eq!(frame, b"foo");

    // Echo it back over the same wire.
    let n = server.write_next(frame).unwrap();
    assert_eq!(n, 5);

    let frame = read_frame(&reactor, &client).unwrap();
    assert_eq!(frame, b"foo");

    assert_eq!(reactor.pending(), 0);
}

#[test]
fn framed_echo_back_to_back() {
    let reactor = Reactor::new().unwrap();
    let (client, server) = tcp_pair(&reactor);

    let client = conn(client);
    let server = conn(server);

    for i in 0..10_000u32 {
        let payload = i.to_be_bytes().to_vec();

        client.write_next(payload.clone()).unwrap();

        let frame = read_frame(&reactor, &server).unwrap();
        assert_eq!(frame, payload);

        server.write_next(frame).unwrap();

        let frame = read_frame(&reactor, &client).unwrap();
        assert_eq!(frame, payload);
    }

    assert_eq!(reactor.pending(), 0);
}

#[test]
fn partial_reads_aggregate_into_one_frame() {
    let reactor = Reactor::new().unwrap();
    let (client, server) = tcp_pair(&reactor);

    let server = conn(server);

    let slot = Rc::new(RefCell::new(None));
    let tx = Rc::clone(&slot);
    server.async_read_next(move |res| {
        *tx.borrow_mut() = Some(res);
    });

    // Half a frame now...
    client.write_some(&[0x00, 0x05, b'h', b'e']).unwrap();

    // ...let the server observe it and go back to waiting...
    for _ in 0..3 {
        let _ = reactor.run_one_for(Duration::from_millis(10));
    }
    assert!(slot.borrow().is_none());

    // ...and the rest after a pause.
    thread::sleep(Duration::from_millis(50));
    client.write_some(&[b'l', b'l', b'o']).unwrap();

    let frame = wait_for(&reactor, &slot).unwrap();
    assert_eq!(frame, b"hello");
    assert_eq!(reactor.pending(), 0);
}

#[test]
fn read_next_reports_peer_close() {
    let reactor = Reactor::new().unwrap();
    let (client, server) = tcp_pair(&reactor);

    let server = conn(server);

    client.close().unwrap();

    let res = read_frame(&reactor, &server);
    assert!(matches!(res, Err(Error::Closed)));
}
