//! A read-only [`Filesystem`] over a tree of [`Entry`] values.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{Entry, Handle};
use crate::error::{FsError, FsResult};
use crate::protocol::{OEXEC, ORCLOSE, OREAD, OTRUNC};
use crate::qid::Qid;
use crate::server::{Filesystem, Request};
use crate::stat::Stat;

/// Serves the tree below `root`.
#[derive(Clone)]
pub struct Tree {
    root: Arc<dyn Entry>,
}

impl Tree {
    pub fn new(root: Arc<dyn Entry>) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Arc<dyn Entry> {
        &self.root
    }
}

/// Per-fid state: the entry the fid names, and its handle once opened.
pub struct TreeFid {
    entry: Arc<dyn Entry>,
    handle: Mutex<Option<Box<dyn Handle>>>,
}

impl TreeFid {
    fn new(entry: Arc<dyn Entry>) -> Self {
        Self {
            entry,
            handle: Mutex::new(None),
        }
    }

    pub fn entry(&self) -> &Arc<dyn Entry> {
        &self.entry
    }

    pub fn is_open(&self) -> bool {
        self.handle.lock().is_some()
    }
}

impl Filesystem for Tree {
    type Fid = TreeFid;

    fn attach(
        &self,
        _req: &Request,
        _afid: Option<&TreeFid>,
        uname: &str,
        aname: &str,
    ) -> FsResult<(Qid, TreeFid)> {
        log::debug!("attach uname={:?} aname={:?}", uname, aname);
        Ok((self.root.qid(), TreeFid::new(self.root.clone())))
    }

    fn walk(
        &self,
        req: &Request,
        fid: &TreeFid,
        names: &[String],
    ) -> FsResult<(Vec<Qid>, Option<TreeFid>)> {
        if fid.is_open() {
            return Err(FsError::WalkOpen);
        }
        let mut cur = fid.entry.clone();
        let mut qids = Vec::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            req.check()?;
            match cur.clone().walk(name) {
                Ok(next) => {
                    qids.push(next.qid());
                    cur = next;
                }
                Err(err) if i == 0 => return Err(err),
                Err(_) => return Ok((qids, None)),
            }
        }
        Ok((qids, Some(TreeFid::new(cur))))
    }

    fn open(&self, _req: &Request, fid: &TreeFid, mode: u8) -> FsResult<(Qid, u32)> {
        let access = mode & 3;
        if (access != OREAD && access != OEXEC) || mode & (OTRUNC | ORCLOSE) != 0 {
            return Err(FsError::PermissionDenied);
        }
        let mut handle = fid.handle.lock();
        if handle.is_some() {
            return Err(FsError::AlreadyOpen);
        }
        *handle = Some(fid.entry.open()?);
        Ok((fid.entry.qid(), 0))
    }

    fn read(&self, req: &Request, fid: &TreeFid, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        req.check()?;
        let mut handle = fid.handle.lock();
        match handle.as_mut() {
            Some(handle) => handle.read_at(offset, count),
            None => Err(FsError::NotOpen),
        }
    }

    fn stat(&self, _req: &Request, fid: &TreeFid) -> FsResult<Stat> {
        Ok(fid.entry.stat())
    }
}
