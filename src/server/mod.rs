//! 9P server: per-connection sessions dispatching into a [`Filesystem`].

mod config;
mod fids;
mod session;

pub use config::ServerConfig;
pub use fids::FidTable;
pub use session::Server;

use crate::context::Context;
use crate::error::{FsError, FsResult};
use crate::qid::Qid;
use crate::stat::Stat;

/// What a backend learns about the request it is serving.
#[derive(Debug, Clone)]
pub struct Request {
    pub tag: u16,
    /// Cancelled when the client flushes this request or the session ends.
    pub ctx: Context,
}

impl Request {
    /// Fail with [`FsError::Cancelled`] once the request has been flushed.
    pub fn check(&self) -> FsResult<()> {
        if self.ctx.is_cancelled() {
            Err(FsError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The backend contract a [`Server`] dispatches into.
///
/// The session owns the fid table: it resolves fid numbers, rejects
/// duplicate and unknown fids, and hands the backend the per-fid state it
/// produced earlier. Backends keep any mutable per-fid state behind their
/// own locks, since requests on different fids run concurrently.
///
/// Every operation has a default that fails the way a read-only server
/// would, so a backend only implements what it supports.
pub trait Filesystem: Clone + Send + Sync + 'static {
    /// State bound to one fid.
    type Fid: Send + Sync + 'static;

    /// Establish an authentication fid. No authentication is required by default.
    fn auth(&self, _req: &Request, _uname: &str, _aname: &str) -> FsResult<(Qid, Self::Fid)> {
        Err(FsError::NoAuth)
    }

    /// Bind a fresh fid to the root of the tree named by `aname`.
    fn attach(
        &self,
        req: &Request,
        afid: Option<&Self::Fid>,
        uname: &str,
        aname: &str,
    ) -> FsResult<(Qid, Self::Fid)>;

    /// Resolve `names` starting at `fid`.
    ///
    /// Returns one qid per element resolved. State for the new fid is
    /// returned only when every element resolved; an empty `names` clones
    /// `fid`. Failing on the first element is an error, failing later is a
    /// short qid list.
    fn walk(
        &self,
        req: &Request,
        fid: &Self::Fid,
        names: &[String],
    ) -> FsResult<(Vec<Qid>, Option<Self::Fid>)>;

    /// Prepare `fid` for I/O. Returns the qid and iounit (0 lets the client choose).
    fn open(&self, req: &Request, fid: &Self::Fid, mode: u8) -> FsResult<(Qid, u32)>;

    /// Create `name` in the directory `fid` and open it; `fid` now names the new file.
    fn create(
        &self,
        _req: &Request,
        _fid: &Self::Fid,
        _name: &str,
        _perm: u32,
        _mode: u8,
    ) -> FsResult<(Qid, u32)> {
        Err(FsError::CreateProhibited)
    }

    /// Read at most `count` bytes at `offset`.
    fn read(&self, req: &Request, fid: &Self::Fid, offset: u64, count: u32) -> FsResult<Vec<u8>>;

    fn write(&self, _req: &Request, _fid: &Self::Fid, _offset: u64, _data: &[u8]) -> FsResult<u32> {
        Err(FsError::WriteProhibited)
    }

    /// The fid has been dropped from the table.
    fn clunk(&self, _req: &Request, _fid: &Self::Fid) -> FsResult<()> {
        Ok(())
    }

    /// Remove the file; the fid is dropped from the table whatever the outcome.
    fn remove(&self, _req: &Request, _fid: &Self::Fid) -> FsResult<()> {
        Err(FsError::RemoveProhibited)
    }

    fn stat(&self, req: &Request, fid: &Self::Fid) -> FsResult<Stat>;

    fn wstat(&self, _req: &Request, _fid: &Self::Fid, _stat: &Stat) -> FsResult<()> {
        Err(FsError::WstatProhibited)
    }

    /// The session that owned this instance has ended.
    fn close(&self) -> FsResult<()> {
        Ok(())
    }
}
