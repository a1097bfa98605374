//! A 9P2000 protocol engine: wire codec, message catalog, a multiplexing
//! client and a concurrent server.
//!
//! The client side starts from [`Session::connect`] (or [`Conn::new`] for
//! raw protocol access). The server side is a [`Server`] dispatching into
//! any [`server::Filesystem`]; [`fs::Tree`] serves a tree of [`fs::Entry`]
//! values, either built in memory or exported from a host directory.

pub mod client;
pub mod context;
pub mod error;
pub mod fs;
pub mod message;
mod parse;
pub mod protocol;
pub mod qid;
pub mod server;
pub mod stat;
pub mod transport;
pub mod wire;

pub use client::{ClientConfig, Conn, File, Session};
pub use context::{CancelHandle, Context};
pub use error::{Error, FsError, FsResult, Result};
pub use message::{Body, Header, Message};
pub use protocol::MessageType;
pub use qid::{Qid, QidType};
pub use server::{Filesystem, Request, Server, ServerConfig};
pub use stat::Stat;
pub use transport::{Addr, Listener, Stream, Transport};
