//! The per-session fid table.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{FsError, FsResult};

/// Maps fid numbers to backend state for one session.
pub struct FidTable<F> {
    fids: RwLock<HashMap<u32, Arc<F>>>,
}

impl<F> Default for FidTable<F> {
    fn default() -> Self {
        Self {
            fids: RwLock::new(HashMap::new()),
        }
    }
}

impl<F> FidTable<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `fid`, failing if it is already live.
    pub fn insert(&self, fid: u32, state: F) -> FsResult<Arc<F>> {
        match self.fids.write().entry(fid) {
            Entry::Occupied(_) => Err(FsError::DuplicateFid),
            Entry::Vacant(slot) => Ok(slot.insert(Arc::new(state)).clone()),
        }
    }

    /// Rebind a live fid to new state, as a walk with `newfid == fid` does.
    pub fn replace(&self, fid: u32, state: F) -> FsResult<Arc<F>> {
        match self.fids.write().get_mut(&fid) {
            Some(slot) => {
                *slot = Arc::new(state);
                Ok(slot.clone())
            }
            None => Err(FsError::UnknownFid),
        }
    }

    pub fn get(&self, fid: u32) -> FsResult<Arc<F>> {
        self.fids
            .read()
            .get(&fid)
            .cloned()
            .ok_or(FsError::UnknownFid)
    }

    pub fn contains(&self, fid: u32) -> bool {
        self.fids.read().contains_key(&fid)
    }

    pub fn remove(&self, fid: u32) -> FsResult<Arc<F>> {
        self.fids.write().remove(&fid).ok_or(FsError::UnknownFid)
    }

    /// Drop every fid, returning their state for cleanup.
    pub fn drain(&self) -> Vec<Arc<F>> {
        self.fids.write().drain().map(|(_, state)| state).collect()
    }

    pub fn len(&self) -> usize {
        self.fids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fids.read().is_empty()
    }
}
