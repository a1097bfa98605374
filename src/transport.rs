//! Byte-stream plumbing for 9P connections.
//!
//! The engine only needs a stream it can split into one reading half and one
//! writing half. Addresses are either `host:port` (TCP, port 564 when
//! omitted), `tcp:host:port`, or `unix:/path/to/socket`.

use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::wire::Discard;

/// The registered 9P port.
pub const DEFAULT_PORT: u16 = 564;

/// Something that can be torn down from any thread holding a handle to it.
pub trait Close {
    fn close(&self) -> io::Result<()>;
}

/// The writing half of a connection, boxed so sessions need not be generic over it.
pub(crate) trait Sink: Write + Close + Send {}
impl<T: Write + Close + Send> Sink for T {}

/// A full-duplex byte stream a 9P connection can run over.
pub trait Transport: Send + 'static {
    type Reader: Discard + Send + 'static;
    type Writer: Write + Close + Send + 'static;

    /// Split into independently owned reading and writing halves.
    fn split(self) -> io::Result<(Self::Reader, Self::Writer)>;
}

impl Close for TcpStream {
    fn close(&self) -> io::Result<()> {
        ignore_not_connected(self.shutdown(Shutdown::Both))
    }
}

impl Close for UnixStream {
    fn close(&self) -> io::Result<()> {
        ignore_not_connected(self.shutdown(Shutdown::Both))
    }
}

fn ignore_not_connected(res: io::Result<()>) -> io::Result<()> {
    match res {
        Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

impl Transport for TcpStream {
    type Reader = BufReader<TcpStream>;
    type Writer = TcpStream;

    fn split(self) -> io::Result<(Self::Reader, Self::Writer)> {
        self.set_nodelay(true)?;
        let reader = self.try_clone()?;
        Ok((BufReader::new(reader), self))
    }
}

impl Transport for UnixStream {
    type Reader = BufReader<UnixStream>;
    type Writer = UnixStream;

    fn split(self) -> io::Result<(Self::Reader, Self::Writer)> {
        let reader = self.try_clone()?;
        Ok((BufReader::new(reader), self))
    }
}

/// Where to dial or listen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Addr {
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for Addr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(Error::InvalidPath(s.to_string()));
            }
            return Ok(Addr::Unix(PathBuf::from(path)));
        }
        let host = s.strip_prefix("tcp:").unwrap_or(s);
        if host.is_empty() {
            return Err(Error::InvalidPath(s.to_string()));
        }
        if has_port(host) {
            Ok(Addr::Tcp(host.to_string()))
        } else {
            Ok(Addr::Tcp(format!("{}:{}", host, DEFAULT_PORT)))
        }
    }
}

/// `[::1]:564` and `host:564` carry a port, `::1` and `host` do not.
fn has_port(host: &str) -> bool {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.contains("]:");
    }
    host.matches(':').count() == 1
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Tcp(host) => write!(f, "tcp:{}", host),
            Addr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// A dialed or accepted connection of either kind.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub fn dial(addr: &Addr) -> Result<Self> {
        log::debug!("dialing {}", addr);
        Ok(match addr {
            Addr::Tcp(host) => Stream::Tcp(TcpStream::connect(host.as_str())?),
            Addr::Unix(path) => Stream::Unix(UnixStream::connect(path)?),
        })
    }

    fn try_clone(&self) -> io::Result<Self> {
        Ok(match self {
            Stream::Tcp(s) => Stream::Tcp(s.try_clone()?),
            Stream::Unix(s) => Stream::Unix(s.try_clone()?),
        })
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

impl Discard for Stream {}

impl Close for Stream {
    fn close(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.close(),
            Stream::Unix(s) => s.close(),
        }
    }
}

impl Transport for Stream {
    type Reader = BufReader<Stream>;
    type Writer = Stream;

    fn split(self) -> io::Result<(Self::Reader, Self::Writer)> {
        if let Stream::Tcp(s) = &self {
            s.set_nodelay(true)?;
        }
        let reader = self.try_clone()?;
        Ok((BufReader::new(reader), self))
    }
}

/// A bound listening socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    pub fn bind(addr: &Addr) -> Result<Self> {
        Ok(match addr {
            Addr::Tcp(host) => Listener::Tcp(TcpListener::bind(host.as_str())?),
            Addr::Unix(path) => Listener::Unix(UnixListener::bind(path)?),
        })
    }

    pub fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            Listener::Tcp(l) => {
                let (s, peer) = l.accept()?;
                Ok((Stream::Tcp(s), peer.to_string()))
            }
            Listener::Unix(l) => {
                let (s, _) = l.accept()?;
                Ok((Stream::Unix(s), "unix".to_string()))
            }
        }
    }

    /// The bound address, useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<Addr> {
        match self {
            Listener::Tcp(l) => Ok(Addr::Tcp(l.local_addr()?.to_string())),
            Listener::Unix(l) => {
                let addr = l.local_addr()?;
                let path = addr
                    .as_pathname()
                    .ok_or_else(|| io::Error::other("unnamed unix socket"))?;
                Ok(Addr::Unix(path.to_path_buf()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_addresses() {
        assert_eq!(
            "localhost".parse::<Addr>().unwrap(),
            Addr::Tcp("localhost:564".into())
        );
        assert_eq!(
            "tcp:127.0.0.1:5640".parse::<Addr>().unwrap(),
            Addr::Tcp("127.0.0.1:5640".into())
        );
        assert_eq!(
            "[::1]:9".parse::<Addr>().unwrap(),
            Addr::Tcp("[::1]:9".into())
        );
        assert_eq!(
            "unix:/tmp/9p.sock".parse::<Addr>().unwrap(),
            Addr::Unix("/tmp/9p.sock".into())
        );
        assert!("unix:".parse::<Addr>().is_err());
        assert!("".parse::<Addr>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for s in ["tcp:host:1", "unix:/a/b"] {
            assert_eq!(s.parse::<Addr>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn tcp_loopback() {
        let listener = Listener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::thread::spawn(move || {
            let mut s = Stream::dial(&addr).unwrap();
            s.write_all(b"ping").unwrap();
        });
        let (s, _) = listener.accept().unwrap();
        let (mut r, _w) = s.split().unwrap();
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        client.join().unwrap();
    }
}
