//! An open fid on the client side.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

use super::session::{FidPool, op_context};
use super::Conn;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::qid::Qid;
use crate::stat::{Stat, parse_dir};

/// An open file or directory.
///
/// Reads and writes are clipped to one message; the `Read`/`Write`
/// impls track an offset the way a local file does. The fid is clunked
/// on [`File::close`] or when the value is dropped.
pub struct File {
    conn: Arc<Conn>,
    fids: Arc<FidPool>,
    timeout: Option<Duration>,
    fid: u32,
    qid: Qid,
    iounit: u32,
    offset: u64,
    clunked: bool,
}

impl File {
    pub(super) fn new(
        conn: Arc<Conn>,
        fids: Arc<FidPool>,
        timeout: Option<Duration>,
        fid: u32,
        qid: Qid,
        iounit: u32,
    ) -> Self {
        Self {
            conn,
            fids,
            timeout,
            fid,
            qid,
            iounit,
            offset: 0,
            clunked: false,
        }
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }

    pub fn qid(&self) -> Qid {
        self.qid
    }

    /// Largest single read or write; the server's iounit, else what fits in msize.
    pub fn io_size(&self) -> usize {
        let max = self.conn.max_io();
        if self.iounit == 0 {
            max as usize
        } else {
            self.iounit.min(max) as usize
        }
    }

    fn ctx(&self) -> Context {
        op_context(self.timeout)
    }

    /// Read at `offset` without moving the file position.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let n = buf.len().min(self.io_size());
        self.conn.read(&self.ctx(), self.fid, offset, &mut buf[..n])
    }

    /// Write at `offset` without moving the file position.
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        let n = data.len().min(self.io_size());
        self.conn.write(&self.ctx(), self.fid, offset, &data[..n])
    }

    pub fn stat(&self) -> Result<Stat> {
        self.conn.stat(&self.ctx(), self.fid)
    }

    pub fn wstat(&self, stat: &Stat) -> Result<()> {
        self.conn.wstat(&self.ctx(), self.fid, stat)
    }

    /// Read a whole directory from the start.
    pub fn read_dir(&mut self) -> Result<Vec<Stat>> {
        if !self.qid.is_dir() {
            return Err(Error::NotADirectory(format!("fid {}", self.fid)));
        }
        let mut buf = vec![0u8; self.io_size()];
        let mut offset = 0u64;
        let mut entries = Vec::new();
        loop {
            let n = self.read_at(&mut buf, offset)?;
            if n == 0 {
                break;
            }
            offset += n as u64;
            entries.extend(parse_dir(&buf[..n])?);
        }
        self.offset = offset;
        Ok(entries)
    }

    /// Read until EOF from the current position.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; self.io_size()];
        loop {
            let n = self.read_at(&mut buf, self.offset)?;
            if n == 0 {
                return Ok(out);
            }
            self.offset += n as u64;
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Clunk the fid, reporting any error.
    pub fn close(mut self) -> Result<()> {
        self.clunk()
    }

    fn clunk(&mut self) -> Result<()> {
        if self.clunked {
            return Ok(());
        }
        self.clunked = true;
        let res = self.conn.clunk(&self.ctx(), self.fid);
        self.fids.release(self.fid);
        res
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if let Err(err) = self.clunk() {
            log::warn!("clunk fid {} on drop: {}", self.fid, err);
        }
    }
}

fn to_io(err: Error) -> io::Error {
    match err {
        Error::Io(err) => err,
        Error::TimedOut => io::Error::new(io::ErrorKind::TimedOut, err),
        Error::ConnectionClosed(_) => io::Error::new(io::ErrorKind::BrokenPipe, err),
        other => io::Error::other(other),
    }
}

impl Read for File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.offset).map_err(to_io)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl Write for File {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.write_at(buf, self.offset).map_err(to_io)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for File {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.offset.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let len = self.stat().map_err(to_io)?.length;
                len.checked_add_signed(delta)
            }
        };
        match target {
            Some(offset) => {
                self.offset = offset;
                Ok(offset)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            )),
        }
    }
}
