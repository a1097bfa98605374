//! Server configuration.

use crate::protocol::DEFAULT_MSIZE;

/// Message size a fresh session accepts before Tversion has been seen.
///
/// Large enough for any Tversion.
const INITIAL_MSIZE: u32 = 4096;

/// Settings shared by every session a [`super::Server`] runs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Limit on incoming messages until version negotiation completes.
    pub initial_msize: u32,

    /// Highest msize the server agrees to; the negotiated value is the
    /// lower of this and the client's proposal.
    pub max_msize: u32,

    /// iounit reported by Ropen/Rcreate when the backend leaves it at 0.
    /// 0 tells clients to use msize minus the I/O header.
    pub iounit: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            initial_msize: INITIAL_MSIZE,
            max_msize: DEFAULT_MSIZE * 8,
            iounit: 0,
        }
    }
}

impl ServerConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pre-negotiation message limit.
    pub fn initial_msize(mut self, msize: u32) -> Self {
        self.initial_msize = msize;
        self
    }

    /// Set the upper bound for negotiated msize.
    pub fn max_msize(mut self, msize: u32) -> Self {
        self.max_msize = msize;
        self
    }

    /// Set the default iounit.
    pub fn iounit(mut self, iounit: u32) -> Self {
        self.iounit = iounit;
        self
    }
}
