//! A static tree held in memory.

use std::sync::{Arc, OnceLock, Weak};

use super::{BytesHandle, Entry, Handle, walk_file};
use crate::error::{FsError, FsResult};
use crate::protocol::DMDIR;
use crate::qid::{Qid, QidType};
use crate::stat::{Stat, StatReader};

/// A directory with a fixed set of children.
pub struct Dir {
    parent: OnceLock<Weak<dyn Entry>>,
    stat: Stat,
    children: Vec<Arc<dyn Entry>>,
}

impl Dir {
    /// Build a directory and adopt `children`.
    ///
    /// The qid kind and mode are forced to mark a directory, and the
    /// length to 0.
    pub fn new(mut stat: Stat, children: Vec<Arc<dyn Entry>>) -> Arc<Self> {
        stat.qid.kind |= QidType::DIR;
        stat.mode |= DMDIR;
        stat.length = 0;
        Arc::new_cyclic(|me: &Weak<Dir>| {
            let parent: Weak<dyn Entry> = me.clone();
            for child in &children {
                child.set_parent(parent.clone());
            }
            Dir {
                parent: OnceLock::new(),
                stat,
                children,
            }
        })
    }

    pub fn children(&self) -> &[Arc<dyn Entry>] {
        &self.children
    }
}

impl Entry for Dir {
    fn parent(&self) -> Option<Arc<dyn Entry>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    fn qid(&self) -> Qid {
        self.stat.qid
    }

    fn stat(&self) -> Stat {
        self.stat.clone()
    }

    /// Snapshots the children's stats into a fresh directory stream.
    fn open(&self) -> FsResult<Box<dyn Handle>> {
        let stats: Vec<Stat> = self.children.iter().map(|c| c.stat()).collect();
        let reader = StatReader::new(&stats).map_err(|err| FsError::Other(err.to_string()))?;
        Ok(Box::new(reader))
    }

    fn walk(self: Arc<Self>, name: &str) -> FsResult<Arc<dyn Entry>> {
        match name {
            "" => Ok(self),
            ".." => Ok(self.parent().unwrap_or(self)),
            _ => self
                .children
                .iter()
                .find(|c| c.stat().name == name)
                .cloned()
                .ok_or(FsError::NotFound),
        }
    }

    fn set_parent(&self, parent: Weak<dyn Entry>) {
        let _ = self.parent.set(parent);
    }
}

/// A regular file with fixed contents.
pub struct File {
    parent: OnceLock<Weak<dyn Entry>>,
    stat: Stat,
    data: Arc<[u8]>,
}

impl File {
    /// The stat's length is set from `data`.
    pub fn new(mut stat: Stat, data: impl Into<Vec<u8>>) -> Arc<Self> {
        let data: Vec<u8> = data.into();
        stat.length = data.len() as u64;
        Arc::new(File {
            parent: OnceLock::new(),
            stat,
            data: data.into(),
        })
    }
}

impl Entry for File {
    fn parent(&self) -> Option<Arc<dyn Entry>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    fn qid(&self) -> Qid {
        self.stat.qid
    }

    fn stat(&self) -> Stat {
        self.stat.clone()
    }

    fn open(&self) -> FsResult<Box<dyn Handle>> {
        Ok(Box::new(BytesHandle(self.data.clone())))
    }

    fn walk(self: Arc<Self>, name: &str) -> FsResult<Arc<dyn Entry>> {
        walk_file(self, name)
    }

    fn set_parent(&self, parent: Weak<dyn Entry>) {
        let _ = self.parent.set(parent);
    }
}
