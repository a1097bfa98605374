//! Cancellation: Tflush on the wire, and abandoned client calls.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};

use common::{Raw, spawn_server};
use ninep::message::{Body, Tattach, Tflush, Topen, Tread, Tstat, Tversion, Twalk};
use ninep::protocol::{NO_FID, NO_TAG, OREAD};
use ninep::qid::{Qid, QidType};
use ninep::server::{Filesystem, Request};
use ninep::{ClientConfig, Conn, Context, Error, FsError, FsResult, Session, Stat};

const WAIT: Duration = Duration::from_secs(5);

/// A backend whose reads stall until the request is cancelled, and whose
/// walks to "slow" stall until the test lets them go, cancelled or not.
#[derive(Clone)]
struct Stall {
    started: Sender<u16>,
    cancelled: Sender<u16>,
    release: Receiver<()>,
    clunked: Sender<()>,
    closed: Arc<AtomicBool>,
}

/// The test's side of a [`Stall`].
struct Watch {
    started: Receiver<u16>,
    cancelled: Receiver<u16>,
    release: Sender<()>,
    clunked: Receiver<()>,
    closed: Arc<AtomicBool>,
}

fn stall() -> (Stall, Watch) {
    let (started_tx, started_rx) = unbounded();
    let (cancelled_tx, cancelled_rx) = unbounded();
    let (release_tx, release_rx) = unbounded();
    let (clunked_tx, clunked_rx) = unbounded();
    let closed = Arc::new(AtomicBool::new(false));
    (
        Stall {
            started: started_tx,
            cancelled: cancelled_tx,
            release: release_rx,
            clunked: clunked_tx,
            closed: closed.clone(),
        },
        Watch {
            started: started_rx,
            cancelled: cancelled_rx,
            release: release_tx,
            clunked: clunked_rx,
            closed,
        },
    )
}

impl Filesystem for Stall {
    type Fid = ();

    fn attach(&self, _req: &Request, _afid: Option<&()>, _uname: &str, _aname: &str) -> FsResult<(Qid, ())> {
        Ok((Qid::new(QidType::DIR, 0, 1), ()))
    }

    fn walk(&self, req: &Request, _fid: &(), names: &[String]) -> FsResult<(Vec<Qid>, Option<()>)> {
        if names.iter().any(|n| n == "slow") {
            let _ = self.started.send(req.tag);
            let _ = self.release.recv();
        }
        let qids = names.iter().map(|_| Qid::new(QidType::FILE, 0, 2)).collect();
        Ok((qids, Some(())))
    }

    fn open(&self, _req: &Request, _fid: &(), _mode: u8) -> FsResult<(Qid, u32)> {
        Ok((Qid::new(QidType::FILE, 0, 2), 0))
    }

    fn read(&self, req: &Request, _fid: &(), _offset: u64, _count: u32) -> FsResult<Vec<u8>> {
        let _ = self.started.send(req.tag);
        match req.ctx.sleep(Duration::from_secs(30)) {
            Ok(()) => Ok(b"too late".to_vec()),
            Err(_) => {
                let _ = self.cancelled.send(req.tag);
                Err(FsError::Cancelled)
            }
        }
    }

    fn clunk(&self, _req: &Request, _fid: &()) -> FsResult<()> {
        let _ = self.clunked.send(());
        Ok(())
    }

    fn stat(&self, _req: &Request, _fid: &()) -> FsResult<Stat> {
        Ok(Stat {
            name: "stalled".into(),
            ..Stat::default()
        })
    }

    fn close(&self) -> FsResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn open_raw(c: &mut Raw) {
    c.rpc(NO_TAG, Tversion { msize: 8192, version: "9P2000".into() });
    c.rpc(
        1,
        Tattach {
            fid: 0,
            afid: NO_FID,
            uname: "u".into(),
            aname: String::new(),
        },
    );
    c.rpc(
        2,
        Twalk {
            fid: 0,
            newfid: 1,
            wnames: vec!["f".into()],
        },
    );
    c.rpc(3, Topen { fid: 1, mode: OREAD });
}

fn read(fid: u32) -> Tread {
    Tread {
        fid,
        offset: 0,
        count: 64,
    }
}

#[test]
fn flushed_read_is_never_answered() {
    let (fs, watch) = stall();
    let (stream, server) = spawn_server(fs);
    let mut c = Raw::new(stream);
    open_raw(&mut c);

    c.send(1, read(1));
    assert_eq!(watch.started.recv_timeout(WAIT).unwrap(), 1);

    // The next message on the wire is the Rflush, not a reply for tag 1.
    assert!(matches!(c.rpc(2, Tflush { oldtag: 1 }), Body::Rflush(_)));
    assert_eq!(watch.cancelled.recv_timeout(WAIT).unwrap(), 1);

    // Tag 1 is free again and the stream is still framed.
    match c.rpc(1, Tstat { fid: 1 }) {
        Body::Rstat(r) => assert_eq!(r.stat.name, "stalled"),
        other => panic!("unexpected {:?}", other),
    }

    drop(c);
    server.join().unwrap().unwrap();
    assert!(watch.closed.load(Ordering::SeqCst));
}

#[test]
fn flush_of_an_idle_tag_is_acknowledged() {
    let (fs, _watch) = stall();
    let (stream, _server) = spawn_server(fs);
    let mut c = Raw::new(stream);
    open_raw(&mut c);
    assert!(matches!(c.rpc(9, Tflush { oldtag: 77 }), Body::Rflush(_)));
}

#[test]
fn tag_in_flight_cannot_be_reused() {
    let (fs, watch) = stall();
    let (stream, _server) = spawn_server(fs);
    let mut c = Raw::new(stream);
    open_raw(&mut c);

    c.send(5, read(1));
    assert_eq!(watch.started.recv_timeout(WAIT).unwrap(), 5);

    match c.rpc(5, read(1)) {
        Body::Rerror(r) => assert_eq!(r.ename, "duplicate tag"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(c.rpc(6, Tflush { oldtag: 5 }), Body::Rflush(_)));
}

#[test]
fn disconnect_cancels_outstanding_work() {
    let (fs, watch) = stall();
    let (stream, server) = spawn_server(fs);
    let mut c = Raw::new(stream);
    open_raw(&mut c);

    c.send(4, read(1));
    assert_eq!(watch.started.recv_timeout(WAIT).unwrap(), 4);
    drop(c);

    assert_eq!(watch.cancelled.recv_timeout(WAIT).unwrap(), 4);
    server.join().unwrap().unwrap();
    assert!(watch.closed.load(Ordering::SeqCst));
}

fn walk(fid: u32, newfid: u32, name: &str) -> Twalk {
    Twalk {
        fid,
        newfid,
        wnames: vec![name.into()],
    }
}

#[test]
fn flushed_walk_leaves_newfid_free() {
    let (fs, watch) = stall();
    let (stream, _server) = spawn_server(fs);
    let mut c = Raw::new(stream);
    open_raw(&mut c);

    c.send(4, walk(0, 2, "slow"));
    assert_eq!(watch.started.recv_timeout(WAIT).unwrap(), 4);
    assert!(matches!(c.rpc(5, Tflush { oldtag: 4 }), Body::Rflush(_)));

    // The walk completes after the flush; its fid state goes straight back.
    watch.release.send(()).unwrap();
    watch.clunked.recv_timeout(WAIT).unwrap();

    match c.rpc(4, walk(0, 2, "f")) {
        Body::Rwalk(r) => assert_eq!(r.wqids.len(), 1),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(c.rpc(6, Tstat { fid: 2 }), Body::Rstat(_)));
}

#[test]
fn walk_finishing_after_version_is_not_bound() {
    let (fs, watch) = stall();
    let (stream, _server) = spawn_server(fs);
    let mut c = Raw::new(stream);
    open_raw(&mut c);

    c.send(4, walk(0, 2, "slow"));
    assert_eq!(watch.started.recv_timeout(WAIT).unwrap(), 4);
    assert!(matches!(
        c.rpc(NO_TAG, Tversion { msize: 8192, version: "9P2000".into() }),
        Body::Rversion(_)
    ));
    // Fids 0 and 1 are clunked by the reset.
    watch.clunked.recv_timeout(WAIT).unwrap();
    watch.clunked.recv_timeout(WAIT).unwrap();

    watch.release.send(()).unwrap();
    watch.clunked.recv_timeout(WAIT).unwrap();

    c.rpc(
        1,
        Tattach {
            fid: 0,
            afid: NO_FID,
            uname: "u".into(),
            aname: String::new(),
        },
    );
    assert!(matches!(c.rpc(2, walk(0, 2, "f")), Body::Rwalk(_)));
}

fn open_conn(config: &ClientConfig) -> (Conn, Watch) {
    let (fs, watch) = stall();
    let (stream, _server) = spawn_server(fs);
    let conn = Conn::new(stream, config).unwrap();
    let ctx = Context::background();
    conn.attach(&ctx, 0, NO_FID, "u", "").unwrap();
    conn.walk(&ctx, 0, 1, &["f"]).unwrap();
    conn.open(&ctx, 1, OREAD).unwrap();
    (conn, watch)
}

#[test]
fn cancelled_call_flushes_and_frees_its_tag() {
    let (conn, watch) = open_conn(&ClientConfig::default());
    let (ctx, cancel) = Context::cancellable();

    let started = watch.started.clone();
    let canceller = thread::spawn(move || {
        started.recv_timeout(WAIT).unwrap();
        cancel.cancel();
    });

    let mut buf = [0u8; 64];
    let err = conn.read(&ctx, 1, 0, &mut buf).unwrap_err();
    assert!(matches!(err, Error::Cancelled), "{err}");
    canceller.join().unwrap();

    assert!(watch.cancelled.recv_timeout(WAIT).is_ok());
    assert_eq!(conn.tags().in_use(), 0);
    assert!(!conn.is_closed());
    assert_eq!(conn.stat(&Context::background(), 1).unwrap().name, "stalled");
}

#[test]
fn timed_out_call_reports_timeout() {
    let (conn, watch) = open_conn(&ClientConfig::default());
    let ctx = Context::background().with_timeout(Duration::from_millis(50));
    let mut buf = [0u8; 64];
    let err = conn.read(&ctx, 1, 0, &mut buf).unwrap_err();
    assert!(matches!(err, Error::TimedOut), "{err}");
    assert!(watch.cancelled.recv_timeout(WAIT).is_ok());
    assert_eq!(conn.stat(&Context::background(), 1).unwrap().name, "stalled");
}

#[test]
fn timed_out_walk_does_not_poison_the_session() {
    let (fs, watch) = stall();
    let (stream, _server) = spawn_server(fs);
    let config = ClientConfig::new().timeout(Duration::from_millis(50));
    let s = Session::new(stream, config).unwrap();

    assert!(matches!(s.stat("/slow"), Err(Error::TimedOut)));
    watch.release.send(()).unwrap();
    watch.clunked.recv_timeout(WAIT).unwrap();

    // The fid the abandoned walk used is handed out again and must be free.
    for _ in 0..3 {
        watch.release.send(()).unwrap();
        assert_eq!(s.stat("/slow").unwrap().name, "stalled");
    }
}

#[test]
fn exhausted_tag_pool_blocks_callers() {
    let (conn, watch) = open_conn(&ClientConfig::new().concurrency(1));
    let conn = Arc::new(conn);
    let (ctx, cancel) = Context::cancellable();

    let reader = {
        let conn = conn.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 64];
            conn.read(&ctx, 1, 0, &mut buf)
        })
    };
    watch.started.recv_timeout(WAIT).unwrap();
    assert_eq!(conn.tags().in_use(), 1);

    // No tag is free, so this call cannot even be sent.
    let short = Context::background().with_timeout(Duration::from_millis(50));
    assert!(matches!(conn.stat(&short, 1), Err(Error::TimedOut)));

    cancel.cancel();
    assert!(matches!(reader.join().unwrap(), Err(Error::Cancelled)));
    assert_eq!(conn.stat(&Context::background(), 1).unwrap().name, "stalled");
}
