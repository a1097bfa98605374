//! Little-endian encoding of the 9P primitive types.
//!
//! Decoding works on byte streams rather than whole buffers: every reader
//! the crate decodes from is a [`Discard`], so that a decoder which stops
//! short of a record's declared size can throw the rest away and keep the
//! stream framed for the next message.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Take, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;

use crate::error::{Error, Result};

/// Chunk size used when skipping bytes on a stream that cannot seek.
const SKIP_CHUNK: usize = 1024;

/// Upper bound on the up-front allocation for a length-prefixed blob.
///
/// A peer may declare a large count; we grow the buffer as bytes actually
/// arrive instead of trusting the declaration.
const ALLOC_GUARD: usize = 64 * 1024;

/// A reader that can throw away a number of bytes.
///
/// The default reads and discards in bounded chunks; seekable readers
/// override it with a relative seek.
pub trait Discard: Read {
    fn discard(&mut self, n: u64) -> io::Result<()> {
        skip(self, n)
    }
}

/// Read and drop `n` bytes, [`SKIP_CHUNK`] at a time.
pub fn skip<R: Read + ?Sized>(r: &mut R, mut n: u64) -> io::Result<()> {
    let mut buf = [0u8; SKIP_CHUNK];
    while n > 0 {
        let want = n.min(SKIP_CHUNK as u64) as usize;
        let got = r.read(&mut buf[..want])?;
        if got == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        n -= got as u64;
    }
    Ok(())
}

fn seek_forward<S: Seek + ?Sized>(s: &mut S, n: u64, len: Option<u64>) -> io::Result<()> {
    let pos = s.stream_position()?;
    let target = pos
        .checked_add(n)
        .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
    if let Some(len) = len {
        if target > len {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }
    s.seek(SeekFrom::Start(target))?;
    Ok(())
}

impl Discard for &[u8] {
    fn discard(&mut self, n: u64) -> io::Result<()> {
        if n > self.len() as u64 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        *self = &self[n as usize..];
        Ok(())
    }
}

impl<T: AsRef<[u8]>> Discard for Cursor<T> {
    fn discard(&mut self, n: u64) -> io::Result<()> {
        let len = self.get_ref().as_ref().len() as u64;
        seek_forward(self, n, Some(len))
    }
}

impl Discard for File {
    fn discard(&mut self, n: u64) -> io::Result<()> {
        let len = self.metadata()?.len();
        seek_forward(self, n, Some(len))
    }
}

impl<R: Read> Discard for Take<R> {}
impl<R: Read> Discard for BufReader<R> {}
impl Discard for TcpStream {}
impl Discard for UnixStream {}

impl<R: Discard + ?Sized> Discard for &mut R {
    fn discard(&mut self, n: u64) -> io::Result<()> {
        (**self).discard(n)
    }
}

impl<R: Discard + ?Sized> Discard for Box<R> {
    fn discard(&mut self, n: u64) -> io::Result<()> {
        (**self).discard(n)
    }
}

/// A value with a fixed 9P wire representation.
pub trait Encode {
    /// Number of bytes [`Encode::encode`] writes.
    fn encoded_len(&self) -> usize;

    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()>;
}

/// A value that can be read back from its 9P wire representation.
pub trait Decode: Sized {
    fn decode<R: Discard + ?Sized>(r: &mut R) -> Result<Self>;
}

fn read_array<const N: usize, R: Read + ?Sized>(r: &mut R, what: &'static str) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf).map_err(|e| Error::short(e, what))?;
    Ok(buf)
}

pub fn read_u8<R: Read + ?Sized>(r: &mut R) -> Result<u8> {
    Ok(read_array::<1, _>(r, "u8")?[0])
}

pub fn read_u16<R: Read + ?Sized>(r: &mut R) -> Result<u16> {
    Ok(u16::from_le_bytes(read_array(r, "u16")?))
}

pub fn read_u32<R: Read + ?Sized>(r: &mut R) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(r, "u32")?))
}

pub fn read_u64<R: Read + ?Sized>(r: &mut R) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array(r, "u64")?))
}

pub fn write_u8<W: Write + ?Sized>(w: &mut W, value: u8) -> Result<()> {
    w.write_all(&[value])?;
    Ok(())
}

pub fn write_u16<W: Write + ?Sized>(w: &mut W, value: u16) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn write_u32<W: Write + ?Sized>(w: &mut W, value: u32) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn write_u64<W: Write + ?Sized>(w: &mut W, value: u64) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

/// Wire size of a string: len[2] plus its bytes.
pub fn str_len(value: &str) -> usize {
    2 + value.len()
}

/// Write `len[2] bytes[len]`.
pub fn write_str<W: Write + ?Sized>(w: &mut W, value: &str) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| Error::StringTooLong {
        what: "string",
        len: value.len(),
    })?;
    write_u16(w, len)?;
    w.write_all(value.as_bytes())?;
    Ok(())
}

/// Read `len[2] bytes[len]`.
///
/// 9P strings are byte strings; invalid UTF-8 is replaced rather than
/// rejected so that odd names on the server never break framing.
pub fn read_str<R: Read + ?Sized>(r: &mut R) -> Result<String> {
    let len = read_u16(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .map_err(|e| Error::short(e, "string"))?;
    Ok(match String::from_utf8(buf) {
        Ok(s) => s,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    })
}

/// Write `count[4] bytes[count]`.
pub fn write_blob<W: Write + ?Sized>(w: &mut W, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| Error::StringTooLong {
        what: "blob",
        len: data.len(),
    })?;
    write_u32(w, len)?;
    w.write_all(data)?;
    Ok(())
}

/// Read `count[4] bytes[count]`, refusing counts above `limit`.
pub fn read_blob<R: Read + ?Sized>(r: &mut R, limit: u32) -> Result<Vec<u8>> {
    let count = read_u32(r)?;
    if count > limit {
        return Err(Error::TooLarge {
            size: count as u64,
            msize: limit,
        });
    }
    read_exact_vec(r, count as usize, "blob")
}

/// Read exactly `len` bytes without allocating more than [`ALLOC_GUARD`] up front.
pub(crate) fn read_exact_vec<R: Read + ?Sized>(
    r: &mut R,
    len: usize,
    what: &'static str,
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len.min(ALLOC_GUARD));
    let got = r.take(len as u64).read_to_end(&mut buf)?;
    if got < len {
        return Err(Error::ShortRead(what));
    }
    Ok(buf)
}

/// Wire size of a slice of fixed-size records: n[2] followed by each record.
pub fn slice_len<T: Encode>(values: &[T]) -> usize {
    2 + values.iter().map(Encode::encoded_len).sum::<usize>()
}

pub fn write_slice<T: Encode, W: Write + ?Sized>(w: &mut W, values: &[T]) -> Result<()> {
    write_u16(w, slice_count(values.len(), "slice")?)?;
    for value in values {
        value.encode(w)?;
    }
    Ok(())
}

pub fn read_slice<T: Decode, R: Discard + ?Sized>(r: &mut R) -> Result<Vec<T>> {
    let n = read_u16(r)? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(T::decode(r)?);
    }
    Ok(out)
}

fn slice_count(len: usize, what: &'static str) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::StringTooLong { what, len })
}

macro_rules! int_codec {
    ($($ty:ty => $read:ident, $write:ident;)*) => {$(
        impl Encode for $ty {
            fn encoded_len(&self) -> usize {
                std::mem::size_of::<$ty>()
            }

            fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
                $write(w, *self)
            }
        }

        impl Decode for $ty {
            fn decode<R: Discard + ?Sized>(r: &mut R) -> Result<Self> {
                $read(r)
            }
        }
    )*};
}

int_codec! {
    u8 => read_u8, write_u8;
    u16 => read_u16, write_u16;
    u32 => read_u32, write_u32;
    u64 => read_u64, write_u64;
}

impl Encode for String {
    fn encoded_len(&self) -> usize {
        str_len(self)
    }

    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        write_str(w, self)
    }
}

impl Decode for String {
    fn decode<R: Discard + ?Sized>(r: &mut R) -> Result<Self> {
        read_str(r)
    }
}

/// Slices carry a 16-bit element count.
impl<T: Encode> Encode for Vec<T> {
    fn encoded_len(&self) -> usize {
        slice_len(self)
    }

    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        write_slice(w, self)
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode<R: Discard + ?Sized>(r: &mut R) -> Result<Self> {
        read_slice(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hides everything but `Read` so the chunked path is exercised.
    struct ForwardReader<R>(R);

    impl<R: Read> Read for ForwardReader<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl<R: Read> Discard for ForwardReader<R> {}

    #[test]
    fn integers_are_little_endian() {
        let mut buf = Vec::new();
        write_u16(&mut buf, 0x0102).unwrap();
        write_u32(&mut buf, 0x0304_0506).unwrap();
        write_u64(&mut buf, 0x0708_090a_0b0c_0d0e).unwrap();
        assert_eq!(
            buf,
            [2, 1, 6, 5, 4, 3, 0x0e, 0x0d, 0x0c, 0x0b, 0x0a, 9, 8, 7]
        );

        let mut r = buf.as_slice();
        assert_eq!(read_u16(&mut r).unwrap(), 0x0102);
        assert_eq!(read_u32(&mut r).unwrap(), 0x0304_0506);
        assert_eq!(read_u64(&mut r).unwrap(), 0x0708_090a_0b0c_0d0e);
        assert!(r.is_empty());
    }

    #[test]
    fn truncated_integer_is_short_read() {
        let mut r: &[u8] = &[1, 2, 3];
        assert!(matches!(read_u32(&mut r), Err(Error::ShortRead("u32"))));
    }

    #[test]
    fn strings() {
        let mut buf = Vec::new();
        write_str(&mut buf, "").unwrap();
        write_str(&mut buf, "hello").unwrap();
        assert_eq!(buf.len(), str_len("") + str_len("hello"));

        let mut r = buf.as_slice();
        assert_eq!(read_str(&mut r).unwrap(), "");
        assert_eq!(read_str(&mut r).unwrap(), "hello");
    }

    #[test]
    fn max_length_string() {
        let long = "x".repeat(u16::MAX as usize);
        let mut buf = Vec::new();
        write_str(&mut buf, &long).unwrap();
        assert_eq!(read_str(&mut buf.as_slice()).unwrap(), long);

        let too_long = "x".repeat(u16::MAX as usize + 1);
        assert!(matches!(
            write_str(&mut Vec::new(), &too_long),
            Err(Error::StringTooLong { .. })
        ));
    }

    #[test]
    fn truncated_string_is_short_read() {
        let mut r: &[u8] = &[5, 0, b'a', b'b'];
        assert!(matches!(read_str(&mut r), Err(Error::ShortRead("string"))));
    }

    #[test]
    fn blob_respects_limit() {
        let mut buf = Vec::new();
        write_blob(&mut buf, b"abcdef").unwrap();
        assert_eq!(read_blob(&mut buf.as_slice(), 6).unwrap(), b"abcdef");
        assert!(matches!(
            read_blob(&mut buf.as_slice(), 5),
            Err(Error::TooLarge { size: 6, .. })
        ));
    }

    #[test]
    fn huge_declared_blob_does_not_preallocate() {
        // Declares 1 GiB but carries three bytes.
        let mut data = (1u32 << 30).to_le_bytes().to_vec();
        data.extend_from_slice(b"abc");
        assert!(matches!(
            read_blob(&mut data.as_slice(), u32::MAX),
            Err(Error::ShortRead("blob"))
        ));
    }

    #[test]
    fn string_slices() {
        let names = vec!["a".to_string(), String::new(), "ccc".to_string()];
        let mut buf = Vec::new();
        names.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), names.encoded_len());
        assert_eq!(buf.len(), 2 + 3 + 2 + 5);
        assert_eq!(Vec::<String>::decode(&mut buf.as_slice()).unwrap(), names);

        let mut empty = Vec::new();
        Vec::<String>::new().encode(&mut empty).unwrap();
        assert_eq!(empty, [0, 0]);
    }

    #[test]
    fn skip_simple() {
        let mut r: &[u8] = b"foobar";
        r.discard(3).unwrap();
        assert_eq!(r, b"bar");
    }

    #[test]
    fn skip_long_without_seek() {
        let data = vec![b'x'; 5000];
        let mut r = ForwardReader(Cursor::new(&data));
        r.discard(3000).unwrap();
        assert_eq!(r.0.position(), 3000);
    }

    #[test]
    fn skip_with_seek() {
        let mut r = Cursor::new(vec![0u8; 5000]);
        r.discard(4000).unwrap();
        assert_eq!(r.position(), 4000);
        assert!(r.discard(2000).is_err());
    }

    #[test]
    fn skip_past_end_fails() {
        let mut r = ForwardReader(&b"abc"[..]);
        let err = r.discard(10).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
