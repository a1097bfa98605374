//! Read-only export of a host directory.

use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::unistd::{Gid, Group, Uid, User};
use parking_lot::Mutex;

use super::{Entry, Handle, walk_file};
use crate::error::{FsError, FsResult};
use crate::protocol::DMDIR;
use crate::qid::{Qid, QidType, fnv32, fnv64};
use crate::stat::{Stat, StatReader};

fn fs_error(err: io::Error) -> FsError {
    match err.kind() {
        io::ErrorKind::NotFound => FsError::NotFound,
        io::ErrorKind::PermissionDenied => FsError::PermissionDenied,
        _ => FsError::Io(err),
    }
}

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string())
}

/// Login name for `uid`, or the number when the lookup fails.
fn user_name(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

fn group_name(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}

/// Translate host metadata into a Stat record.
///
/// The qid path folds (dev, inode) and the version folds the mtime, so a
/// file keeps its path across renames and gets a new version on every
/// modification.
fn host_stat(name: String, meta: &Metadata) -> Stat {
    let path = fnv64(&[&meta.dev().to_le_bytes(), &meta.ino().to_le_bytes()]);
    let version = fnv32(&[&meta.mtime().to_le_bytes(), &meta.mtime_nsec().to_le_bytes()]);
    let perm = meta.mode() & 0o777;
    let (kind, mode, length) = if meta.is_dir() {
        (QidType::DIR, DMDIR | perm, 0)
    } else {
        (QidType::FILE, perm, meta.len())
    };
    let uid = user_name(meta.uid());
    Stat {
        typ: 0,
        dev: 0,
        qid: Qid::new(kind, version, path),
        mode,
        atime: meta.atime() as u32,
        mtime: meta.mtime() as u32,
        length,
        name,
        gid: group_name(meta.gid()),
        muid: uid.clone(),
        uid,
    }
}

/// Common part of host entries: where it lives and what it looked like
/// when last seen.
struct Node {
    path: PathBuf,
    parent: Option<Arc<dyn Entry>>,
    seen: Mutex<Stat>,
}

impl Node {
    fn new(path: PathBuf, parent: Option<Arc<dyn Entry>>, meta: &Metadata) -> Self {
        let stat = host_stat(name_of(&path), meta);
        Self {
            path,
            parent,
            seen: Mutex::new(stat),
        }
    }

    /// Re-read the metadata; fall back to the last snapshot if the file is gone.
    fn stat(&self) -> Stat {
        let mut seen = self.seen.lock();
        match fs::metadata(&self.path) {
            Ok(meta) => *seen = host_stat(seen.name.clone(), &meta),
            Err(err) => log::debug!("stat {}: {}", self.path.display(), err),
        }
        seen.clone()
    }
}

/// A directory on the host.
pub struct OsDir {
    node: Node,
}

impl OsDir {
    /// Export the directory at `path` as a tree root.
    pub fn new(path: impl Into<PathBuf>) -> FsResult<Arc<Self>> {
        let path = path.into();
        let meta = fs::metadata(&path).map_err(fs_error)?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(Arc::new(Self {
            node: Node::new(path, None, &meta),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.node.path
    }

    fn children(&self) -> FsResult<Vec<Stat>> {
        let mut stats = Vec::new();
        for dirent in fs::read_dir(&self.node.path).map_err(fs_error)? {
            let dirent = dirent.map_err(fs_error)?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            match fs::metadata(dirent.path()) {
                Ok(meta) => stats.push(host_stat(name, &meta)),
                Err(err) => log::debug!("skipping {}: {}", dirent.path().display(), err),
            }
        }
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stats)
    }
}

impl Entry for OsDir {
    fn parent(&self) -> Option<Arc<dyn Entry>> {
        self.node.parent.clone()
    }

    fn stat(&self) -> Stat {
        self.node.stat()
    }

    fn open(&self) -> FsResult<Box<dyn Handle>> {
        let reader = StatReader::new(&self.children()?).map_err(|err| FsError::Other(err.to_string()))?;
        Ok(Box::new(reader))
    }

    fn walk(self: Arc<Self>, name: &str) -> FsResult<Arc<dyn Entry>> {
        match name {
            "" => return Ok(self),
            ".." => return Ok(self.parent().unwrap_or(self)),
            "." => return Err(FsError::NotFound),
            _ if name.contains('/') => return Err(FsError::NotFound),
            _ => {}
        }
        let path = self.node.path.join(name);
        let meta = fs::metadata(&path).map_err(fs_error)?;
        let parent: Arc<dyn Entry> = self;
        let node = Node::new(path, Some(parent), &meta);
        if meta.is_dir() {
            Ok(Arc::new(OsDir { node }))
        } else {
            Ok(Arc::new(OsFile { node }))
        }
    }
}

/// Anything on the host that is not a directory.
struct OsFile {
    node: Node,
}

impl Entry for OsFile {
    fn parent(&self) -> Option<Arc<dyn Entry>> {
        self.node.parent.clone()
    }

    fn stat(&self) -> Stat {
        self.node.stat()
    }

    fn open(&self) -> FsResult<Box<dyn Handle>> {
        let file = fs::File::open(&self.node.path).map_err(fs_error)?;
        Ok(Box::new(FileHandle(file)))
    }

    fn walk(self: Arc<Self>, name: &str) -> FsResult<Arc<dyn Entry>> {
        walk_file(self, name)
    }
}

struct FileHandle(fs::File);

impl Handle for FileHandle {
    fn read_at(&mut self, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let mut buf = vec![0u8; count as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match self.0.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(FsError::Io(err)),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }
}
