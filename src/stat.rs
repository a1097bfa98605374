//! File metadata records and directory streams.

use std::io::{Read, Write};

use crate::error::{Error, FsError, FsResult, Result};
use crate::protocol::{DMAPPEND, DMAUTH, DMDIR, DMEXCL, DMMOUNT, DMTMP};
use crate::qid::Qid;
use crate::wire::{self, Decode, Discard, Encode};

/// type[2] dev[4] qid[13] mode[4] atime[4] mtime[4] length[8]
const FIXED_SIZE: usize = 2 + 4 + Qid::SIZE + 4 + 4 + 4 + 8;

/// A machine-independent directory entry.
///
/// `typ` and `dev` are for kernel use and passed through untouched.
/// Directories report a length of 0.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub typ: u16,
    pub dev: u32,
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
}

impl Stat {
    /// Size of the record without its leading size field.
    pub fn size(&self) -> usize {
        FIXED_SIZE
            + wire::str_len(&self.name)
            + wire::str_len(&self.uid)
            + wire::str_len(&self.gid)
            + wire::str_len(&self.muid)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & DMDIR != 0
    }

    pub fn is_append(&self) -> bool {
        self.mode & DMAPPEND != 0
    }

    pub fn is_excl(&self) -> bool {
        self.mode & DMEXCL != 0
    }

    pub fn is_mount(&self) -> bool {
        self.mode & DMMOUNT != 0
    }

    pub fn is_auth(&self) -> bool {
        self.mode & DMAUTH != 0
    }

    pub fn is_tmp(&self) -> bool {
        self.mode & DMTMP != 0
    }

    /// Encode this record into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

impl Encode for Stat {
    fn encoded_len(&self) -> usize {
        2 + self.size()
    }

    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        let size = u16::try_from(self.size()).map_err(|_| Error::StringTooLong {
            what: "stat",
            len: self.size(),
        })?;
        wire::write_u16(w, size)?;
        wire::write_u16(w, self.typ)?;
        wire::write_u32(w, self.dev)?;
        self.qid.encode(w)?;
        wire::write_u32(w, self.mode)?;
        wire::write_u32(w, self.atime)?;
        wire::write_u32(w, self.mtime)?;
        wire::write_u64(w, self.length)?;
        wire::write_str(w, &self.name)?;
        wire::write_str(w, &self.uid)?;
        wire::write_str(w, &self.gid)?;
        wire::write_str(w, &self.muid)
    }
}

impl Decode for Stat {
    /// Reads one record, bounded by its own size field.
    ///
    /// Bytes past the last known field (extension fields some servers
    /// append) are discarded so the stream stays aligned.
    fn decode<R: Discard + ?Sized>(r: &mut R) -> Result<Self> {
        let size = wire::read_u16(r)? as u64;
        let mut body = Read::take(&mut *r, size);
        let stat = decode_fields(&mut body).map_err(|err| match err {
            Error::ShortRead(_) => Error::ShortRead("stat"),
            other => other,
        })?;
        let rest = body.limit();
        if rest > 0 {
            body.discard(rest).map_err(|e| Error::short(e, "stat"))?;
        }
        Ok(stat)
    }
}

fn decode_fields<R: Discard + ?Sized>(r: &mut R) -> Result<Stat> {
    Ok(Stat {
        typ: wire::read_u16(r)?,
        dev: wire::read_u32(r)?,
        qid: Qid::decode(r)?,
        mode: wire::read_u32(r)?,
        atime: wire::read_u32(r)?,
        mtime: wire::read_u32(r)?,
        length: wire::read_u64(r)?,
        name: wire::read_str(r)?,
        uid: wire::read_str(r)?,
        gid: wire::read_str(r)?,
        muid: wire::read_str(r)?,
    })
}

/// Parse a directory read: a back-to-back run of Stat records.
pub fn parse_dir(mut data: &[u8]) -> Result<Vec<Stat>> {
    let mut entries = Vec::new();
    while !data.is_empty() {
        entries.push(Stat::decode(&mut data)?);
    }
    Ok(entries)
}

/// Render an `ls`-style mode string, e.g. `drwxr-xr-x`.
pub fn mode_string(mode: u32) -> String {
    let mut out = String::with_capacity(10);
    out.push(if mode & DMDIR != 0 { 'd' } else { '-' });
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// The byte stream of an open directory.
///
/// Records are encoded once when the directory is opened. A read returns
/// as many whole records as fit in the requested count and never splits
/// one. Offsets must be 0 (rewind) or exactly where the previous read
/// stopped.
#[derive(Debug, Default)]
pub struct StatReader {
    records: Vec<Vec<u8>>,
    next: usize,
    offset: u64,
}

impl StatReader {
    pub fn new(stats: &[Stat]) -> Result<Self> {
        let records = stats.iter().map(Stat::to_bytes).collect::<Result<_>>()?;
        Ok(Self {
            records,
            next: 0,
            offset: 0,
        })
    }

    /// Total size of the stream in bytes.
    pub fn len(&self) -> u64 {
        self.records.iter().map(|r| r.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn read_at(&mut self, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        if offset == 0 {
            self.next = 0;
            self.offset = 0;
        } else if offset != self.offset {
            return Err(FsError::BadOffset);
        }

        let mut out = Vec::new();
        while let Some(record) = self.records.get(self.next) {
            if out.len() + record.len() > count as usize {
                break;
            }
            out.extend_from_slice(record);
            self.next += 1;
        }

        if out.is_empty() && self.next < self.records.len() {
            return Err(FsError::BadCount);
        }
        self.offset += out.len() as u64;
        Ok(out)
    }
}
