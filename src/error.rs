//! Error types shared by the codec, the client and the server.

use std::io;

use thiserror::Error;

use crate::protocol::MessageType;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while speaking 9P.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying stream failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The stream ended before a field was complete.
    #[error("short read: stream ended inside {0}")]
    ShortRead(&'static str),

    /// The stream ended cleanly between two messages.
    #[error("peer hung up")]
    Hangup,

    /// A type byte that is not part of the catalog, or not valid in this direction.
    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// The envelope's size field disagrees with what the payload decoded to.
    #[error("size mismatch: header declares {declared} bytes, payload used {actual}")]
    SizeMismatch { declared: u32, actual: u64 },

    /// A message larger than the negotiated msize.
    #[error("message of {size} bytes exceeds msize {msize}")]
    TooLarge { size: u64, msize: u32 },

    /// A string or slice that does not fit its 16-bit length prefix.
    #[error("{what} of {len} elements does not fit a 16-bit length")]
    StringTooLong { what: &'static str, len: usize },

    /// The peer answered with a reply of the wrong type.
    #[error("unexpected reply: expected {expected}, got {got}")]
    UnexpectedReply {
        expected: MessageType,
        got: MessageType,
    },

    /// The server did not accept our protocol version.
    #[error("version rejected: asked for {wanted}, server answered {got}")]
    VersionRejected { wanted: String, got: String },

    /// The server offered an msize above what we proposed.
    #[error("server raised msize from {proposed} to {got}")]
    MsizeRaised { proposed: u32, got: u32 },

    /// An Rerror from the server.
    #[error("{0}")]
    Remote(String),

    /// A backend failure on the server side.
    #[error(transparent)]
    Fs(#[from] FsError),

    /// The connection is gone; carries the cause that tore it down.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The caller's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's context deadline passed.
    #[error("operation timed out")]
    TimedOut,

    /// A tag was handed back to the pool although it was not outstanding.
    #[error("tag {0} released twice")]
    TagReleasedTwice(u16),

    /// A client path that names nothing, such as "/" where a leaf is needed.
    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    /// A walk stopped before the named element.
    #[error("walk failed at {0:?}")]
    WalkFailed(String),

    /// A directory operation on something that is not one.
    #[error("{0}: not a directory")]
    NotADirectory(String),

    /// Every FID value is in use.
    #[error("no free fid")]
    FidExhausted,
}

impl Error {
    /// Whether this error leaves the connection unusable.
    ///
    /// Framing and protocol-logic failures are fatal; backend and resource
    /// failures stay local to the operation that hit them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ShortRead(_)
                | Error::Hangup
                | Error::UnknownType(_)
                | Error::SizeMismatch { .. }
                | Error::TooLarge { .. }
                | Error::UnexpectedReply { .. }
                | Error::ConnectionClosed(_)
        )
    }

    /// Turn an `UnexpectedEof` from `read_exact` into a short read on `what`.
    pub(crate) fn short(err: io::Error, what: &'static str) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Error::ShortRead(what)
        } else {
            Error::Io(err)
        }
    }
}

/// Backend failures, reported to clients as Rerror strings.
///
/// The display strings are the traditional 9P error texts so that clients
/// written against other servers recognise them.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("file not found")]
    NotFound,
    #[error("walk in non-directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("unknown fid")]
    UnknownFid,
    #[error("duplicate fid")]
    DuplicateFid,
    #[error("duplicate tag")]
    DuplicateTag,
    #[error("permission denied")]
    PermissionDenied,
    #[error("write prohibited")]
    WriteProhibited,
    #[error("remove prohibited")]
    RemoveProhibited,
    #[error("create prohibited")]
    CreateProhibited,
    #[error("wstat prohibited")]
    WstatProhibited,
    #[error("authentication not required")]
    NoAuth,
    #[error("unknown specifier in attach")]
    BadAttach,
    #[error("bad offset")]
    BadOffset,
    #[error("bad count")]
    BadCount,
    #[error("fid already open")]
    AlreadyOpen,
    #[error("fid not open for i/o")]
    NotOpen,
    #[error("walk of an open fid")]
    WalkOpen,
    #[error("not implemented")]
    NotImplemented,
    #[error("operation cancelled")]
    Cancelled,
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

pub type FsResult<T> = std::result::Result<T, FsError>;
