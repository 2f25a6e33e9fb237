//! Write-ahead log anchoring.
//!
//! Components holding unflushed state that can only be rebuilt by replaying
//! the log register an anchor at the earliest log index they depend on. Log
//! garbage collection must not discard entries at or after the earliest
//! registered index.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Position of an operation in the replicated log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub term: u64,
    pub index: u64,
}

impl OpId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

/// Handle to a registered anchor.
#[derive(Debug, PartialEq, Eq)]
pub struct LogAnchor {
    id: u64,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    by_index: BTreeMap<(u64, u64), String>,
    index_of: HashMap<u64, u64>,
}

/// Tracks every live anchor and answers the earliest anchored log index.
#[derive(Default)]
pub struct LogAnchorRegistry {
    state: Mutex<RegistryState>,
}

impl LogAnchorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, log_index: u64, owner: &str) -> Result<LogAnchor> {
        let mut state = self.state.lock()?;
        let id = state.next_id;
        state.next_id += 1;
        state.by_index.insert((log_index, id), owner.to_string());
        state.index_of.insert(id, log_index);
        Ok(LogAnchor { id })
    }

    pub fn update_registration(&self, anchor: &LogAnchor, log_index: u64) -> Result<()> {
        let mut state = self.state.lock()?;
        let old_index = state.index_of.get(&anchor.id).copied().ok_or_else(|| {
            Error::NotFound(format!("log anchor {} is not registered", anchor.id))
        })?;
        let owner = state
            .by_index
            .remove(&(old_index, anchor.id))
            .unwrap_or_default();
        state.by_index.insert((log_index, anchor.id), owner);
        state.index_of.insert(anchor.id, log_index);
        Ok(())
    }

    pub fn unregister(&self, anchor: LogAnchor) -> Result<()> {
        let mut state = self.state.lock()?;
        let index = state.index_of.remove(&anchor.id).ok_or_else(|| {
            Error::NotFound(format!("log anchor {} is not registered", anchor.id))
        })?;
        state.by_index.remove(&(index, anchor.id));
        Ok(())
    }

    /// Earliest log index still anchored, if any.
    pub fn earliest_registered_log_index(&self) -> Result<Option<u64>> {
        let state = self.state.lock()?;
        Ok(state.by_index.keys().next().map(|(index, _)| *index))
    }

    pub fn anchor_count(&self) -> Result<usize> {
        Ok(self.state.lock()?.index_of.len())
    }

    /// Owners of all live anchors, ordered by anchored index.
    pub fn dump_anchors(&self) -> Result<Vec<(u64, String)>> {
        let state = self.state.lock()?;
        Ok(state
            .by_index
            .iter()
            .map(|((index, _), owner)| (*index, owner.clone()))
            .collect())
    }
}

#[cfg(test)]
impl LogAnchorRegistry {
    /// Poisons the registry lock so every later call fails.
    pub(crate) fn poison(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let _ = std::thread::spawn(move || {
            let _state = registry.state.lock();
            panic!("poisoning log anchor registry");
        })
        .join();
    }
}

const NO_INDEX: u64 = u64::MAX;

/// Keeps a single anchor at the lowest log index it has been offered.
///
/// The anchor is registered lazily on the first offer and released when the
/// anchorer is released or dropped.
pub struct MinLogIndexAnchorer {
    registry: Arc<LogAnchorRegistry>,
    owner: String,
    anchor: Mutex<Option<LogAnchor>>,
    minimum: AtomicU64,
}

impl MinLogIndexAnchorer {
    pub fn new(registry: Arc<LogAnchorRegistry>, owner: impl Into<String>) -> Self {
        Self {
            registry,
            owner: owner.into(),
            anchor: Mutex::new(None),
            minimum: AtomicU64::new(NO_INDEX),
        }
    }

    pub fn anchor_if_minimum(&self, log_index: u64) -> Result<()> {
        let mut anchor = self.anchor.lock()?;
        match anchor.as_ref() {
            None => {
                *anchor = Some(self.registry.register(log_index, &self.owner)?);
                self.minimum.store(log_index, Ordering::SeqCst);
            }
            Some(existing) => {
                if log_index < self.minimum.load(Ordering::SeqCst) {
                    self.registry.update_registration(existing, log_index)?;
                    self.minimum.store(log_index, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }

    pub fn release_anchor(&self) -> Result<()> {
        let mut anchor = self.anchor.lock()?;
        if let Some(existing) = anchor.take() {
            self.registry.unregister(existing)?;
        }
        self.minimum.store(NO_INDEX, Ordering::SeqCst);
        Ok(())
    }

    pub fn minimum_log_index(&self) -> Option<u64> {
        match self.minimum.load(Ordering::SeqCst) {
            NO_INDEX => None,
            index => Some(index),
        }
    }
}

impl Drop for MinLogIndexAnchorer {
    fn drop(&mut self) {
        if let Err(e) = self.release_anchor() {
            tracing::warn!(owner = %self.owner, error = %e, "Failed to release log anchor");
        }
    }
}
