//! The client's bounded pool of request tags.

use std::collections::HashSet;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use crate::context::{Context, Waited};
use crate::error::{Error, Result};
use crate::protocol::NO_TAG;

/// A fixed set of tags, handed out one per in-flight request.
///
/// `acquire` blocks while every tag is outstanding. Tags come back through
/// `release`, which refuses a tag that is not currently handed out.
pub struct TagPool {
    free_tx: Sender<u16>,
    free_rx: Receiver<u16>,
    outstanding: Mutex<HashSet<u16>>,
    capacity: u16,
}

impl TagPool {
    /// A pool of tags `0..size`. `NO_TAG` is never handed out.
    pub fn new(size: u16) -> Self {
        Self::with_base(0, size)
    }

    /// A pool of tags `base..base + size`, clipped below `NO_TAG`.
    pub fn with_base(base: u16, size: u16) -> Self {
        let base = base.min(NO_TAG - 1);
        let size = size.clamp(1, NO_TAG - base);
        let (free_tx, free_rx) = bounded(size as usize);
        for tag in base..base + size {
            // The channel holds exactly `size` slots.
            let _ = free_tx.try_send(tag);
        }
        Self {
            free_tx,
            free_rx,
            outstanding: Mutex::new(HashSet::with_capacity(size as usize)),
            capacity: size,
        }
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Tags currently handed out.
    pub fn in_use(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Take a free tag, waiting for one until `ctx` is done.
    pub fn acquire(&self, ctx: &Context) -> Result<u16> {
        match ctx.recv(&self.free_rx) {
            Waited::Ready(tag) => {
                self.outstanding.lock().insert(tag);
                Ok(tag)
            }
            Waited::Interrupted(err) => Err(err),
            // The pool owns a sender, so the channel never disconnects.
            Waited::Disconnected => Err(Error::ConnectionClosed("tag pool closed".into())),
        }
    }

    /// Take a free tag without waiting.
    pub fn try_acquire(&self) -> Option<u16> {
        let tag = self.free_rx.try_recv().ok()?;
        self.outstanding.lock().insert(tag);
        Some(tag)
    }

    /// Return a tag to the pool.
    pub fn release(&self, tag: u16) -> Result<()> {
        if !self.outstanding.lock().remove(&tag) {
            log::error!("tag {} released while not outstanding", tag);
            return Err(Error::TagReleasedTwice(tag));
        }
        self.free_tx
            .try_send(tag)
            .map_err(|_| Error::TagReleasedTwice(tag))
    }
}
