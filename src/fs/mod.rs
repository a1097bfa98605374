//! Building blocks for file trees served over 9P.
//!
//! An [`Entry`] is one node of a tree: it knows its parent, its identity and
//! metadata, how to resolve one path element, and how to open itself for
//! reading. [`Tree`] turns any root entry into a [`crate::server::Filesystem`].

mod memory;
mod os;
mod tree;

use std::sync::{Arc, Weak};

use crate::error::{FsError, FsResult};
use crate::qid::Qid;
use crate::stat::{Stat, StatReader};

pub use memory::{Dir, File};
pub use os::OsDir;
pub use tree::{Tree, TreeFid};

/// One node of a served tree.
pub trait Entry: Send + Sync {
    /// The containing directory; `None` at the root.
    fn parent(&self) -> Option<Arc<dyn Entry>>;

    fn qid(&self) -> Qid {
        self.stat().qid
    }

    fn stat(&self) -> Stat;

    /// Prepare for I/O, returning a handle private to the opening fid.
    fn open(&self) -> FsResult<Box<dyn Handle>>;

    /// Resolve one path element: a child by name, `..` for the parent (the
    /// root is its own parent) or `""` for the entry itself.
    fn walk(self: Arc<Self>, name: &str) -> FsResult<Arc<dyn Entry>>;

    /// Record the containing directory. Called once when the tree is built.
    fn set_parent(&self, _parent: Weak<dyn Entry>) {}
}

/// Byte-range access to an opened entry.
pub trait Handle: Send {
    fn read_at(&mut self, offset: u64, count: u32) -> FsResult<Vec<u8>>;
}

/// Directories read as whole Stat records.
impl Handle for StatReader {
    fn read_at(&mut self, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        StatReader::read_at(self, offset, count)
    }
}

/// A handle over bytes held in memory.
pub struct BytesHandle(pub Arc<[u8]>);

impl Handle for BytesHandle {
    fn read_at(&mut self, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let len = self.0.len() as u64;
        if offset >= len {
            return Ok(Vec::new());
        }
        let end = len.min(offset + count as u64);
        Ok(self.0[offset as usize..end as usize].to_vec())
    }
}

/// Shared walk rule for leaves: only the empty name resolves, to the entry itself.
pub fn walk_file(entry: Arc<dyn Entry>, name: &str) -> FsResult<Arc<dyn Entry>> {
    if name.is_empty() {
        Ok(entry)
    } else {
        Err(FsError::NotADirectory)
    }
}
