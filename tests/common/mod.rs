//! Shared fixtures: an in-memory tree, a server on one end of a socket
//! pair, and a raw message channel on the other.

// Each test binary uses a different subset.
#![allow(dead_code)]

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ninep::fs::{Dir, Entry, File, Tree};
use ninep::message::Body;
use ninep::qid::{Qid, QidType};
use ninep::server::Filesystem;
use ninep::{Message, Server, ServerConfig, Stat};

/// Message limit used for raw exchanges in tests.
pub const MSIZE: u32 = 8192;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn stat(name: &str, path: u64) -> Stat {
    Stat {
        qid: Qid::new(QidType::FILE, 0, path),
        mode: 0o644,
        name: name.into(),
        uid: "glenda".into(),
        gid: "glenda".into(),
        muid: "glenda".into(),
        ..Stat::default()
    }
}

/// `/a/b` holds 6000 bytes of a repeating pattern; `/a/c` is empty;
/// `/readme` holds a short text.
pub fn sample_tree() -> Tree {
    let b: Arc<dyn Entry> = File::new(stat("b", 3), pattern(6000));
    let c: Arc<dyn Entry> = File::new(stat("c", 4), Vec::<u8>::new());
    let a: Arc<dyn Entry> = Dir::new(stat("a", 2), vec![b, c]);
    let readme: Arc<dyn Entry> = File::new(stat("readme", 5), "served from memory\n");
    Tree::new(Dir::new(stat("/", 1), vec![a, readme]))
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Run `fs` on one end of a socket pair; returns the other end.
pub fn spawn_server<F: Filesystem>(fs: F) -> (UnixStream, JoinHandle<ninep::Result<()>>) {
    spawn_server_with(fs, ServerConfig::default())
}

pub fn spawn_server_with<F: Filesystem>(
    fs: F,
    config: ServerConfig,
) -> (UnixStream, JoinHandle<ninep::Result<()>>) {
    init_logging();
    let (client, server) = UnixStream::pair().unwrap();
    let srv = Server::new(fs, config);
    let handle = thread::spawn(move || srv.serve(server));
    (client, handle)
}

/// A client speaking raw messages, for checking the wire exchange itself.
pub struct Raw {
    pub stream: UnixStream,
}

impl Raw {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    pub fn send(&mut self, tag: u16, body: impl Into<Body>) {
        Message::new(tag, body)
            .write_to(&mut self.stream, MSIZE)
            .unwrap();
    }

    pub fn recv(&mut self) -> Message {
        Message::read_from(&mut self.stream, MSIZE).unwrap()
    }

    /// Send one request and read the next message, asserting its tag.
    pub fn rpc(&mut self, tag: u16, body: impl Into<Body>) -> Body {
        self.send(tag, body);
        let reply = self.recv();
        assert_eq!(reply.tag, tag, "reply tag for {:?}", reply.body);
        reply.body
    }
}
