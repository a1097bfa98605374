//! The server's durable identity for a file.

use std::io::Write;

use bitflags::bitflags;

use crate::error::Result;
use crate::protocol::DMDIR;
use crate::wire::{self, Decode, Discard, Encode};

bitflags! {
    /// The high byte of a file's mode, as carried in a [`Qid`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct QidType: u8 {
        const DIR = 0x80;
        const APPEND = 0x40;
        const EXCL = 0x20;
        const MOUNT = 0x10;
        const AUTH = 0x08;
        const TMP = 0x04;
        const SYMLINK = 0x02;
        const FILE = 0x00;
    }
}

impl QidType {
    /// The kind bits for a Stat mode word.
    pub fn from_mode(mode: u32) -> Self {
        QidType::from_bits_retain((mode >> 24) as u8)
    }
}

/// Qid identifies a file within a 9P server.
///
/// Two fids naming the same file report the same qid; `path` is unique in
/// the tree and `version` changes whenever the content does.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Qid {
    pub kind: QidType,
    pub version: u32,
    pub path: u64,
}

impl Qid {
    /// kind[1] version[4] path[8]
    pub const SIZE: usize = 13;

    pub fn new(kind: QidType, version: u32, path: u64) -> Self {
        Self {
            kind,
            version,
            path,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind.contains(QidType::DIR)
    }

    /// Mode bits implied by the kind, to seed a Stat mode word.
    pub fn mode_bits(&self) -> u32 {
        if self.is_dir() {
            DMDIR
        } else {
            (self.kind.bits() as u32) << 24
        }
    }
}

impl Encode for Qid {
    fn encoded_len(&self) -> usize {
        Self::SIZE
    }

    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        wire::write_u8(w, self.kind.bits())?;
        wire::write_u32(w, self.version)?;
        wire::write_u64(w, self.path)
    }
}

impl Decode for Qid {
    fn decode<R: Discard + ?Sized>(r: &mut R) -> Result<Self> {
        let kind = wire::read_u8(r)?;
        let version = wire::read_u32(r)?;
        let path = wire::read_u64(r)?;
        Ok(Qid {
            kind: QidType::from_bits_retain(kind),
            version,
            path,
        })
    }
}

/// 64-bit FNV-1a, used to fold host identifiers into a qid path.
pub fn fnv64(parts: &[&[u8]]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for byte in *part {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

/// 32-bit FNV-1a, used to fold modification times into a qid version.
pub fn fnv32(parts: &[&[u8]]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for part in parts {
        for byte in *part {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_is_13_bytes() {
        let qid = Qid::new(QidType::DIR, 7, 0x1122_3344_5566_7788);
        let mut buf = Vec::new();
        qid.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), Qid::SIZE);
        assert_eq!(buf[0], 0x80);
        assert_eq!(&buf[1..5], &7u32.to_le_bytes());
        assert_eq!(Qid::decode(&mut buf.as_slice()).unwrap(), qid);
    }

    #[test]
    fn unknown_kind_bits_survive() {
        let buf = [0x81u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let qid = Qid::decode(&mut &buf[..]).unwrap();
        assert_eq!(qid.kind.bits(), 0x81);
        assert!(qid.is_dir());
    }

    #[test]
    fn kind_from_mode() {
        assert_eq!(QidType::from_mode(DMDIR | 0o755), QidType::DIR);
        assert_eq!(QidType::from_mode(0o644), QidType::FILE);
    }

    #[test]
    fn fnv_reference_values() {
        assert_eq!(fnv64(&[b""]), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv64(&[b"a"]), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv32(&[b"a"]), 0xe40c_292c);
        assert_eq!(fnv64(&[b"ab"]), fnv64(&[b"a", b"b"]));
    }
}
