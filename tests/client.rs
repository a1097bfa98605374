//! The client multiplexer against scripted servers that misbehave.

mod common;

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ninep::message::{
    Body, Rclunk, Rerror, Rflush, Rread, Rstat, Rversion, Rwalk, Tclunk, Tflush, Tread, Tstat,
    Tversion,
};
use ninep::protocol::MessageType;
use ninep::{ClientConfig, Conn, Context, Error, Message, Stat};

const MSIZE: u32 = 8192;

/// Run `script` as the server end of a fresh socket pair.
fn scripted<F>(script: F) -> (UnixStream, JoinHandle<()>)
where
    F: FnOnce(&mut UnixStream) + Send + 'static,
{
    common::init_logging();
    let (client, mut server) = UnixStream::pair().unwrap();
    let handle = thread::spawn(move || script(&mut server));
    (client, handle)
}

fn recv(s: &mut UnixStream) -> Message {
    Message::read_from(s, MSIZE).unwrap()
}

fn reply(s: &mut UnixStream, tag: u16, body: impl Into<Body>) {
    Message::new(tag, body).write_to(s, MSIZE).unwrap();
}

/// Answer the Tversion with `version` and `msize`.
fn handshake(s: &mut UnixStream, version: &str, msize: u32) {
    let msg = recv(s);
    assert!(matches!(msg.body, Body::Tversion(Tversion { .. })));
    reply(
        s,
        msg.tag,
        Rversion {
            msize,
            version: version.into(),
        },
    );
}

fn connect(stream: UnixStream) -> Conn {
    Conn::new(stream, &ClientConfig::default()).unwrap()
}

#[test]
fn negotiates_version_and_msize() {
    let (stream, server) = scripted(|s| handshake(s, "9P2000", 4096));
    let conn = connect(stream);
    assert_eq!(conn.version(), "9P2000");
    assert_eq!(conn.msize(), 4096);
    assert_eq!(conn.max_io(), 4096 - 24);
    drop(conn);
    server.join().unwrap();
}

#[test]
fn rejected_version_fails_the_connection() {
    let (stream, _server) = scripted(|s| handshake(s, "unknown", 8192));
    let err = Conn::new(stream, &ClientConfig::default()).err().unwrap();
    assert!(matches!(err, Error::VersionRejected { ref got, .. } if got == "unknown"));
}

#[test]
fn other_dialect_is_rejected() {
    let (stream, _server) = scripted(|s| handshake(s, "9P2000.u", 8192));
    let err = Conn::new(stream, &ClientConfig::default()).err().unwrap();
    assert!(matches!(err, Error::VersionRejected { ref got, .. } if got == "9P2000.u"));
}

#[test]
fn raised_msize_is_refused() {
    let (stream, _server) = scripted(|s| handshake(s, "9P2000", 65536));
    let err = Conn::new(stream, &ClientConfig::default()).err().unwrap();
    assert!(matches!(err, Error::MsizeRaised { proposed: 8192, got: 65536 }));
}

#[test]
fn oversized_read_reply_is_clipped_and_drained() {
    let (stream, server) = scripted(|s| {
        handshake(s, "9P2000", MSIZE);

        let msg = recv(s);
        let Body::Tread(Tread { count, .. }) = msg.body else {
            panic!("expected Tread, got {:?}", msg.body);
        };
        assert_eq!(count, 10);
        // Claim far more than was asked for.
        let data: Vec<u8> = (0..100).collect();
        reply(s, msg.tag, Rread { data: data.into() });

        let msg = recv(s);
        assert!(matches!(msg.body, Body::Tclunk(Tclunk { fid: 7 })));
        reply(s, msg.tag, Rclunk {});
    });

    let conn = connect(stream);
    let ctx = Context::background();
    let mut buf = [0xffu8; 10];
    let n = conn.read(&ctx, 7, 0, &mut buf).unwrap();
    assert_eq!(n, 10);
    assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);

    // The surplus was drained; the next reply decodes cleanly.
    conn.clunk(&ctx, 7).unwrap();
    assert!(!conn.is_closed());
    drop(conn);
    server.join().unwrap();
}

#[test]
fn reply_for_unknown_tag_is_skipped() {
    let (stream, server) = scripted(|s| {
        handshake(s, "9P2000", MSIZE);
        let msg = recv(s);
        reply(
            s,
            msg.tag.wrapping_add(1000),
            Rwalk {
                wqids: Vec::new(),
            },
        );
        reply(s, msg.tag, Rclunk {});
    });

    let conn = connect(stream);
    conn.clunk(&Context::background(), 3).unwrap();
    assert!(!conn.is_closed());
    drop(conn);
    server.join().unwrap();
}

#[test]
fn rerror_becomes_a_local_failure() {
    let (stream, server) = scripted(|s| {
        handshake(s, "9P2000", MSIZE);
        let msg = recv(s);
        reply(
            s,
            msg.tag,
            Rerror {
                ename: "file not found".into(),
            },
        );
        let msg = recv(s);
        assert!(matches!(msg.body, Body::Tstat(Tstat { fid: 2 })));
        reply(
            s,
            msg.tag,
            Rstat {
                stat: Stat {
                    name: "x".into(),
                    ..Stat::default()
                },
            },
        );
    });

    let conn = connect(stream);
    let ctx = Context::background();
    let err = conn.clunk(&ctx, 1).unwrap_err();
    assert!(matches!(err, Error::Remote(ref e) if e == "file not found"));
    assert!(!err.is_fatal());
    assert_eq!(conn.stat(&ctx, 2).unwrap().name, "x");
    drop(conn);
    server.join().unwrap();
}

#[test]
fn wrong_reply_type_closes_the_connection() {
    let (stream, server) = scripted(|s| {
        handshake(s, "9P2000", MSIZE);
        let msg = recv(s);
        reply(s, msg.tag, Rclunk {});
    });

    let conn = connect(stream);
    let ctx = Context::background();
    let err = conn.stat(&ctx, 1).unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed(_)), "{err}");
    assert!(err.to_string().contains(&MessageType::Rclunk.to_string()));
    assert!(conn.is_closed());
    assert!(matches!(conn.clunk(&ctx, 1), Err(Error::ConnectionClosed(_))));
    server.join().unwrap();
}

#[test]
fn hangup_fails_every_waiter() {
    let (stream, server) = scripted(|s| {
        handshake(s, "9P2000", MSIZE);
        // Take two requests, answer neither.
        recv(s);
        recv(s);
    });

    let conn = Arc::new(connect(stream));
    let waiters: Vec<_> = (0..2)
        .map(|fid| {
            let conn = conn.clone();
            thread::spawn(move || conn.clunk(&Context::background(), fid))
        })
        .collect();
    server.join().unwrap();

    for waiter in waiters {
        assert!(matches!(waiter.join().unwrap(), Err(Error::ConnectionClosed(_))));
    }
    assert!(conn.is_closed());
    assert_eq!(conn.tags().in_use(), 0);
}

#[test]
fn size_field_longer_than_payload_closes_the_connection() {
    let (stream, server) = scripted(|s| {
        handshake(s, "9P2000", MSIZE);
        let msg = recv(s);
        let mut bytes = Message::new(msg.tag, Rclunk {}).to_bytes().unwrap();
        bytes[0] += 3;
        bytes.extend_from_slice(&[0xde, 0xad, 0xbe]);
        s.write_all(&bytes).unwrap();
    });

    let conn = connect(stream);
    let err = conn.clunk(&Context::background(), 1).unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed(ref cause) if cause.contains("size mismatch")), "{err}");
    assert!(conn.is_closed());
    server.join().unwrap();
}

#[test]
fn reply_after_rflush_is_discarded() {
    let (seen_tx, seen_rx) = crossbeam_channel::bounded(1);
    let (stream, server) = scripted(move |s| {
        handshake(s, "9P2000", MSIZE);
        let read = recv(s);
        assert!(matches!(read.body, Body::Tread(_)));
        seen_tx.send(()).unwrap();

        let flush = recv(s);
        let Body::Tflush(Tflush { oldtag }) = flush.body else {
            panic!("expected Tflush, got {:?}", flush.body);
        };
        assert_eq!(oldtag, read.tag);
        // The original reply trails the Rflush in the same segment.
        let mut bytes = Message::new(flush.tag, Rflush {}).to_bytes().unwrap();
        let stale = Rread {
            data: b"stale".to_vec().into(),
        };
        bytes.extend(Message::new(read.tag, stale).to_bytes().unwrap());
        s.write_all(&bytes).unwrap();

        let next = recv(s);
        assert_eq!(next.tag, read.tag);
        assert!(matches!(next.body, Body::Tstat(Tstat { fid: 1 })));
        reply(
            s,
            next.tag,
            Rstat {
                stat: Stat {
                    name: "fresh".into(),
                    ..Stat::default()
                },
            },
        );
    });

    // One tag, so the next call must reuse the flushed one.
    let conn = Arc::new(Conn::new(stream, &ClientConfig::new().concurrency(1)).unwrap());
    let (ctx, cancel) = Context::cancellable();
    let reader = {
        let conn = conn.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            conn.read(&ctx, 1, 0, &mut buf)
        })
    };
    seen_rx.recv().unwrap();
    cancel.cancel();
    assert!(matches!(reader.join().unwrap(), Err(Error::Cancelled)));
    assert_eq!(conn.tags().in_use(), 0);

    // A reply after Rflush is only recognisable as stale until the tag is
    // registered again; give the reader time to skip it.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(conn.stat(&Context::background(), 1).unwrap().name, "fresh");
    assert!(!conn.is_closed());
    drop(conn);
    server.join().unwrap();
}
