//! Path-based client operations over one attached connection.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::file::File;
use super::{ClientConfig, Conn};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::parse::{path_parts, split_parent_name};
use crate::protocol::{DMDIR, NO_FID, OREAD, ORDWR};
use crate::qid::Qid;
use crate::stat::Stat;
use crate::transport::{Addr, Stream, Transport};

/// Hands out fid values and takes them back after clunk.
#[derive(Debug, Default)]
pub struct FidPool {
    inner: Mutex<FidState>,
}

#[derive(Debug, Default)]
struct FidState {
    next: u32,
    free: Vec<u32>,
}

impl FidPool {
    /// A pool whose first fresh value is `first`.
    pub fn starting_at(first: u32) -> Self {
        Self {
            inner: Mutex::new(FidState {
                next: first,
                free: Vec::new(),
            }),
        }
    }

    pub fn alloc(&self) -> Result<u32> {
        let mut state = self.inner.lock();
        if let Some(fid) = state.free.pop() {
            return Ok(fid);
        }
        if state.next == NO_FID {
            return Err(Error::FidExhausted);
        }
        let fid = state.next;
        state.next += 1;
        Ok(fid)
    }

    pub fn release(&self, fid: u32) {
        self.inner.lock().free.push(fid);
    }
}

/// A 9P session: a negotiated connection with its root attached.
pub struct Session {
    conn: Arc<Conn>,
    fids: Arc<FidPool>,
    root_fid: u32,
    root: Qid,
    config: ClientConfig,
}

impl Session {
    /// Dial `addr`, negotiate and attach.
    pub fn connect(addr: &str, config: ClientConfig) -> Result<Self> {
        let addr: Addr = addr.parse()?;
        Self::new(Stream::dial(&addr)?, config)
    }

    /// Negotiate and attach over an already established stream.
    pub fn new<T: Transport>(transport: T, config: ClientConfig) -> Result<Self> {
        let conn = Arc::new(Conn::new(transport, &config)?);
        let fids = Arc::new(FidPool::starting_at(1));
        let root_fid = fids.alloc()?;
        let ctx = context(&config);
        let root = conn.attach(&ctx, root_fid, NO_FID, &config.uname, &config.aname)?;
        log::debug!("attached {:?} as {} (root qid {:?})", config.aname, config.uname, root);
        Ok(Self {
            conn,
            fids,
            root_fid,
            root,
            config,
        })
    }

    pub fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    pub fn root_qid(&self) -> Qid {
        self.root
    }

    /// A context carrying the configured per-operation timeout.
    pub fn context(&self) -> Context {
        context(&self.config)
    }

    /// Metadata of the file at `path`.
    pub fn stat(&self, path: &str) -> Result<Stat> {
        let ctx = self.context();
        let (fid, _) = self.walk_path(&ctx, path)?;
        let res = self.conn.stat(&ctx, fid);
        self.clunk(&ctx, fid);
        res
    }

    /// Open the file at `path` with `mode` (see [`crate::protocol::OREAD`] and friends).
    pub fn open(&self, path: &str, mode: u8) -> Result<File> {
        let ctx = self.context();
        let (fid, _) = self.walk_path(&ctx, path)?;
        match self.conn.open(&ctx, fid, mode) {
            Ok((qid, iounit)) => Ok(self.file(fid, qid, iounit)),
            Err(err) => {
                self.clunk(&ctx, fid);
                Err(err)
            }
        }
    }

    /// Stat every entry of the directory at `path`.
    pub fn list_dir(&self, path: &str) -> Result<Vec<Stat>> {
        let ctx = self.context();
        let (fid, qid) = self.walk_path(&ctx, path)?;
        if !qid.is_dir() {
            self.clunk(&ctx, fid);
            return Err(Error::NotADirectory(path.to_string()));
        }
        let (qid, iounit) = match self.conn.open(&ctx, fid, OREAD) {
            Ok(opened) => opened,
            Err(err) => {
                self.clunk(&ctx, fid);
                return Err(err);
            }
        };
        let mut dir = self.file(fid, qid, iounit);
        let entries = dir.read_dir()?;
        dir.close()?;
        Ok(entries
            .into_iter()
            .filter(|s| s.name != "." && s.name != "..")
            .collect())
    }

    /// Succeeds when `path` names a directory.
    pub fn ensure_dir(&self, path: &str) -> Result<()> {
        let ctx = self.context();
        let (fid, qid) = self.walk_path(&ctx, path)?;
        self.clunk(&ctx, fid);
        if qid.is_dir() {
            Ok(())
        } else {
            Err(Error::NotADirectory(path.to_string()))
        }
    }

    /// Create a directory at `path`.
    pub fn create_dir(&self, path: &str, perm: u32) -> Result<()> {
        let file = self.create(path, DMDIR | (perm & 0o777), OREAD)?;
        file.close()
    }

    /// Create a file at `path` and open it for reading and writing.
    pub fn create_file(&self, path: &str, perm: u32) -> Result<File> {
        self.create(path, perm & 0o777, ORDWR)
    }

    fn create(&self, path: &str, perm: u32, mode: u8) -> Result<File> {
        let ctx = self.context();
        let (parent, name) = split_parent_name(path)?;
        let (fid, qid) = self.walk_path(&ctx, parent)?;
        if !qid.is_dir() {
            self.clunk(&ctx, fid);
            return Err(Error::NotADirectory(parent.to_string()));
        }
        // On success the fid now names the new file.
        match self.conn.create(&ctx, fid, name, perm, mode) {
            Ok((qid, iounit)) => Ok(self.file(fid, qid, iounit)),
            Err(err) => {
                self.clunk(&ctx, fid);
                Err(err)
            }
        }
    }

    /// Remove the file at `path`.
    pub fn remove(&self, path: &str) -> Result<()> {
        let ctx = self.context();
        let (fid, _) = self.walk_path(&ctx, path)?;
        // Tremove clunks the fid whether or not the removal succeeds.
        let res = self.conn.remove(&ctx, fid);
        self.fids.release(fid);
        res
    }

    /// Walk from the root to `path`, returning a fresh fid and the final qid.
    fn walk_path(&self, ctx: &Context, path: &str) -> Result<(u32, Qid)> {
        let names = path_parts(path);
        let fid = self.fids.alloc()?;
        let qids = match self.conn.walk(ctx, self.root_fid, fid, &names) {
            Ok(qids) => qids,
            Err(err) => {
                self.fids.release(fid);
                return Err(err);
            }
        };
        if qids.len() < names.len() {
            // A partial walk leaves newfid unbound.
            self.fids.release(fid);
            return Err(Error::WalkFailed(names[qids.len()].to_string()));
        }
        Ok((fid, qids.last().copied().unwrap_or(self.root)))
    }

    fn file(&self, fid: u32, qid: Qid, iounit: u32) -> File {
        File::new(
            self.conn.clone(),
            self.fids.clone(),
            self.config.timeout,
            fid,
            qid,
            iounit,
        )
    }

    fn clunk(&self, ctx: &Context, fid: u32) {
        if let Err(err) = self.conn.clunk(ctx, fid) {
            log::warn!("clunk fid {}: {}", fid, err);
        }
        self.fids.release(fid);
    }

    /// Clunk the root and shut the connection down.
    pub fn close(self) -> Result<()> {
        let ctx = self.context();
        let res = self.conn.clunk(&ctx, self.root_fid);
        self.conn.close();
        res
    }
}

fn context(config: &ClientConfig) -> Context {
    op_context(config.timeout)
}

pub(super) fn op_context(timeout: Option<Duration>) -> Context {
    match timeout {
        Some(timeout) => Context::background().with_timeout(timeout),
        None => Context::background(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fid_pool_reuses_released_values() {
        let pool = FidPool::starting_at(1);
        assert_eq!(pool.alloc().unwrap(), 1);
        assert_eq!(pool.alloc().unwrap(), 2);
        pool.release(1);
        assert_eq!(pool.alloc().unwrap(), 1);
        assert_eq!(pool.alloc().unwrap(), 3);
    }

    #[test]
    fn fid_pool_never_hands_out_nofid() {
        let pool = FidPool::starting_at(NO_FID - 1);
        assert_eq!(pool.alloc().unwrap(), NO_FID - 1);
        assert!(matches!(pool.alloc(), Err(Error::FidExhausted)));
    }
}
