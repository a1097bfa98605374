//! 9P client: the connection multiplexer and a path-based session on top.

mod conn;
mod file;
mod session;
mod tags;

use std::time::Duration;

use crate::protocol::{DEFAULT_MSIZE, VERSION_9P2000};

pub use conn::Conn;
pub use file::File;
pub use session::{FidPool, Session};
pub use tags::TagPool;

/// Default number of requests a connection keeps in flight.
pub const DEFAULT_CONCURRENCY: u16 = 256;

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Protocol version proposed in Tversion.
    pub version: String,

    /// Maximum message size proposed in Tversion.
    pub msize: u32,

    /// Size of the tag pool. Capped at half the tag space; the other half
    /// is kept for Tflush.
    pub concurrency: u16,

    /// User name sent in Tattach.
    pub uname: String,

    /// Tree name sent in Tattach.
    pub aname: String,

    /// Deadline applied to each session operation; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: VERSION_9P2000.to_string(),
            msize: DEFAULT_MSIZE,
            concurrency: DEFAULT_CONCURRENCY,
            uname: "user".to_string(),
            aname: String::new(),
            timeout: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn msize(mut self, msize: u32) -> Self {
        self.msize = msize;
        self
    }

    pub fn concurrency(mut self, tags: u16) -> Self {
        self.concurrency = tags;
        self
    }

    pub fn uname(mut self, uname: impl Into<String>) -> Self {
        self.uname = uname.into();
        self
    }

    pub fn aname(mut self, aname: impl Into<String>) -> Self {
        self.aname = aname.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
