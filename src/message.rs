//! The 9P2000 message catalog and the envelope that frames it.
//!
//! Every message on the wire is `size[4] type[1] tag[2] payload`, where
//! `size` counts the whole message including itself. Each payload struct
//! below maps to exactly one type byte.

use std::io::{self, Read, Write};
use std::ops::{Deref, DerefMut};

use crate::error::{Error, Result};
use crate::protocol::{HEADER_SIZE, MessageType};
use crate::qid::Qid;
use crate::stat::Stat;
use crate::wire::{self, Decode, Discard, Encode};

/// A payload that travels under a fixed message type.
pub trait Payload: Encode + Decode + Into<Body> {
    const TYPE: MessageType;
}

/// The raw bytes of a read or write, carried as `count[4] data[count]`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Data(pub Vec<u8>);

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Data({} bytes)", self.0.len())
    }
}

impl Deref for Data {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.0
    }
}

impl DerefMut for Data {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.0
    }
}

impl From<Vec<u8>> for Data {
    fn from(bytes: Vec<u8>) -> Self {
        Data(bytes)
    }
}

impl Encode for Data {
    fn encoded_len(&self) -> usize {
        4 + self.0.len()
    }

    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        wire::write_blob(w, &self.0)
    }
}

impl Decode for Data {
    /// The surrounding envelope bounds how much a lying count can pull in.
    fn decode<R: Discard + ?Sized>(r: &mut R) -> Result<Self> {
        let count = wire::read_u32(r)? as usize;
        wire::read_exact_vec(r, count, "data").map(Data)
    }
}

macro_rules! payload {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $field:ident: $fty:ty),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, PartialEq, Eq)]
        pub struct $name {
            $($(#[$fmeta])* pub $field: $fty,)*
        }

        impl Payload for $name {
            const TYPE: MessageType = MessageType::$name;
        }

        impl Encode for $name {
            fn encoded_len(&self) -> usize {
                0 $(+ self.$field.encoded_len())*
            }

            #[allow(unused_variables)]
            fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
                $(self.$field.encode(w)?;)*
                Ok(())
            }
        }

        impl Decode for $name {
            #[allow(unused_variables)]
            fn decode<R: Discard + ?Sized>(r: &mut R) -> Result<Self> {
                Ok($name { $($field: Decode::decode(r)?,)* })
            }
        }
    };
}

payload! {
    /// Start a session: propose a maximum message size and a protocol version.
    Tversion { msize: u32, version: String }
}
payload! {
    /// The agreed msize (never above the proposal) and version, or "unknown".
    Rversion { msize: u32, version: String }
}
payload! {
    /// Ask for an authentication fid.
    Tauth { afid: u32, uname: String, aname: String }
}
payload! {
    Rauth { aqid: Qid }
}
payload! {
    /// Bind `fid` to the root of the tree named by `aname`.
    Tattach { fid: u32, afid: u32, uname: String, aname: String }
}
payload! {
    Rattach { qid: Qid }
}
payload! {
    /// The reply to any failed request.
    Rerror { ename: String }
}
payload! {
    /// Abort the request carrying `oldtag`.
    Tflush { oldtag: u16 }
}
payload! {
    Rflush {}
}
payload! {
    /// Resolve `wnames` from `fid`, binding the result to `newfid`.
    Twalk { fid: u32, newfid: u32, wnames: Vec<String> }
}
payload! {
    /// One qid per element walked; fewer than asked means the walk stopped early.
    Rwalk { wqids: Vec<Qid> }
}
payload! {
    Topen { fid: u32, mode: u8 }
}
payload! {
    Ropen { qid: Qid, iounit: u32 }
}
payload! {
    Tcreate { fid: u32, name: String, perm: u32, mode: u8 }
}
payload! {
    Rcreate { qid: Qid, iounit: u32 }
}
payload! {
    Tread { fid: u32, offset: u64, count: u32 }
}
payload! {
    Rread { data: Data }
}
payload! {
    Twrite { fid: u32, offset: u64, data: Data }
}
payload! {
    Rwrite { count: u32 }
}
payload! {
    Tclunk { fid: u32 }
}
payload! {
    Rclunk {}
}
payload! {
    Tremove { fid: u32 }
}
payload! {
    Rremove {}
}
payload! {
    Tstat { fid: u32 }
}
payload! {
    Rwstat {}
}

/// Rstat and Twstat wrap their Stat in a second size field, so the size
/// appears twice on the wire. The outer copy only bounds the inner record.
fn stat_field_len(stat: &Stat) -> usize {
    2 + stat.encoded_len()
}

fn write_stat_field<W: Write + ?Sized>(w: &mut W, stat: &Stat) -> Result<()> {
    let len = u16::try_from(stat.encoded_len()).map_err(|_| Error::StringTooLong {
        what: "stat",
        len: stat.encoded_len(),
    })?;
    wire::write_u16(w, len)?;
    stat.encode(w)
}

fn read_stat_field<R: Discard + ?Sized>(r: &mut R) -> Result<Stat> {
    let outer = wire::read_u16(r)? as u64;
    let mut body = Read::take(&mut *r, outer);
    let stat = Stat::decode(&mut body)?;
    let rest = body.limit();
    if rest > 0 {
        body.discard(rest).map_err(|e| Error::short(e, "stat"))?;
    }
    Ok(stat)
}

/// The metadata of the file behind a fid.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rstat {
    pub stat: Stat,
}

impl Payload for Rstat {
    const TYPE: MessageType = MessageType::Rstat;
}

impl Encode for Rstat {
    fn encoded_len(&self) -> usize {
        stat_field_len(&self.stat)
    }

    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        write_stat_field(w, &self.stat)
    }
}

impl Decode for Rstat {
    fn decode<R: Discard + ?Sized>(r: &mut R) -> Result<Self> {
        Ok(Rstat {
            stat: read_stat_field(r)?,
        })
    }
}

/// Change the metadata of the file behind `fid`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Twstat {
    pub fid: u32,
    pub stat: Stat,
}

impl Payload for Twstat {
    const TYPE: MessageType = MessageType::Twstat;
}

impl Encode for Twstat {
    fn encoded_len(&self) -> usize {
        4 + stat_field_len(&self.stat)
    }

    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        wire::write_u32(w, self.fid)?;
        write_stat_field(w, &self.stat)
    }
}

impl Decode for Twstat {
    fn decode<R: Discard + ?Sized>(r: &mut R) -> Result<Self> {
        Ok(Twstat {
            fid: wire::read_u32(r)?,
            stat: read_stat_field(r)?,
        })
    }
}

impl Rread {
    /// Decode an Rread into a caller-sized buffer.
    ///
    /// At most `buf.len()` bytes are copied; whatever the server sent beyond
    /// that is drained from `r` and dropped so the stream stays framed.
    pub fn decode_into<R: Discard + ?Sized>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
        let count = wire::read_u32(r)? as u64;
        let n = count.min(buf.len() as u64) as usize;
        r.read_exact(&mut buf[..n])
            .map_err(|e| Error::short(e, "read data"))?;
        let excess = count - n as u64;
        if excess > 0 {
            log::warn!("Rread carries {} bytes beyond the requested buffer", excess);
            r.discard(excess).map_err(|e| Error::short(e, "read data"))?;
        }
        Ok(n)
    }

    /// Like [`Rread::decode_into`], allocating at most `cap` bytes.
    pub fn decode_bounded<R: Discard + ?Sized>(r: &mut R, cap: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; cap];
        let n = Self::decode_into(r, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

macro_rules! catalog {
    ($($name:ident),* $(,)?) => {
        /// Any payload in the catalog.
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub enum Body {
            $($name($name),)*
        }

        $(impl From<$name> for Body {
            fn from(payload: $name) -> Self {
                Body::$name(payload)
            }
        })*

        impl Body {
            /// The type byte this payload travels under.
            pub fn message_type(&self) -> MessageType {
                match self {
                    $(Body::$name(_) => MessageType::$name,)*
                }
            }

            pub fn encoded_len(&self) -> usize {
                match self {
                    $(Body::$name(p) => p.encoded_len(),)*
                }
            }

            pub fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
                match self {
                    $(Body::$name(p) => p.encode(w),)*
                }
            }

            /// Decode the payload that `ty` announces.
            pub fn decode<R: Discard + ?Sized>(ty: MessageType, r: &mut R) -> Result<Self> {
                match ty {
                    $(MessageType::$name => Ok(Body::$name($name::decode(r)?)),)*
                }
            }
        }
    };
}

catalog! {
    Tversion, Rversion, Tauth, Rauth, Tattach, Rattach, Rerror, Tflush, Rflush,
    Twalk, Rwalk, Topen, Ropen, Tcreate, Rcreate, Tread, Rread, Twrite, Rwrite,
    Tclunk, Rclunk, Tremove, Rremove, Tstat, Rstat, Twstat, Rwstat,
}

/// The fixed part of every message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub size: u32,
    pub ty: MessageType,
    pub tag: u16,
}

impl Header {
    /// Read size, type and tag.
    ///
    /// An unknown type byte is fatal: without it the payload layout, and so
    /// the framing, is unknown. End of stream before the first byte is
    /// [`Error::Hangup`]; anywhere later it is a short read.
    pub fn read<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        loop {
            match r.read(&mut buf[..1]) {
                Ok(0) => return Err(Error::Hangup),
                Ok(_) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        r.read_exact(&mut buf[1..])
            .map_err(|e| Error::short(e, "header"))?;
        let size = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if size < HEADER_SIZE {
            return Err(Error::SizeMismatch {
                declared: size,
                actual: HEADER_SIZE as u64,
            });
        }
        Ok(Header {
            size,
            ty: MessageType::try_from(buf[4])?,
            tag: u16::from_le_bytes([buf[5], buf[6]]),
        })
    }

    /// Bytes that follow the header.
    pub fn body_len(&self) -> u64 {
        (self.size - HEADER_SIZE) as u64
    }
}

/// Decode the reply to a request that expects `P`.
///
/// An Rerror in place of `P` becomes [`Error::Remote`] with the server's
/// text; any other mismatch is [`Error::UnexpectedReply`].
pub fn decode_reply<P: Payload, R: Discard + ?Sized>(ty: MessageType, r: &mut R) -> Result<P> {
    if ty == MessageType::Rerror {
        let err = Rerror::decode(r)?;
        return Err(Error::Remote(err.ename));
    }
    if ty != P::TYPE {
        return Err(Error::UnexpectedReply {
            expected: P::TYPE,
            got: ty,
        });
    }
    P::decode(r)
}

/// A framed message: tag plus payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub tag: u16,
    pub body: Body,
}

impl Message {
    pub fn new(tag: u16, body: impl Into<Body>) -> Self {
        Self {
            tag,
            body: body.into(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// The value of the size field: every byte of the message.
    pub fn size(&self) -> u64 {
        HEADER_SIZE as u64 + self.body.encoded_len() as u64
    }

    /// Encode into one contiguous buffer, ready for a single write.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let size = self.size();
        let size32 = u32::try_from(size).map_err(|_| Error::TooLarge {
            size,
            msize: u32::MAX,
        })?;
        let mut buf = Vec::with_capacity(size as usize);
        wire::write_u32(&mut buf, size32)?;
        wire::write_u8(&mut buf, self.message_type() as u8)?;
        wire::write_u16(&mut buf, self.tag)?;
        self.body.encode(&mut buf)?;
        debug_assert_eq!(buf.len() as u64, size);
        Ok(buf)
    }

    /// Encode and write with a single `write_all`, refusing messages over `msize`.
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W, msize: u32) -> Result<()> {
        let size = self.size();
        if size > msize as u64 {
            return Err(Error::TooLarge { size, msize });
        }
        let buf = self.to_bytes()?;
        w.write_all(&buf)?;
        w.flush()?;
        Ok(())
    }

    /// Read one message, refusing anything over `msize`.
    pub fn read_from<R: Discard + ?Sized>(r: &mut R, msize: u32) -> Result<Self> {
        let header = Header::read(r)?;
        if header.size > msize {
            return Err(Error::TooLarge {
                size: header.size as u64,
                msize,
            });
        }
        Self::read_body(header, r)
    }

    /// Decode the payload announced by `header`.
    ///
    /// The payload must use exactly the bytes the size field declares.
    pub fn read_body<R: Discard + ?Sized>(header: Header, r: &mut R) -> Result<Self> {
        let declared = header.body_len();
        let mut body = Read::take(&mut *r, declared);
        let payload = Body::decode(header.ty, &mut body)?;
        let rest = body.limit();
        if rest > 0 {
            body.discard(rest).map_err(|e| Error::short(e, "message"))?;
            return Err(Error::SizeMismatch {
                declared: header.size,
                actual: HEADER_SIZE as u64 + declared - rest,
            });
        }
        Ok(Message {
            tag: header.tag,
            body: payload,
        })
    }
}
