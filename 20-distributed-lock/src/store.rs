//! In-memory lock table shared by a node's endpoints.
//!
//! This is the only replicated state. The leader validates every change here
//! before fanning it out; followers apply the leader's decisions verbatim.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::command::Command;

/// Key → owner map behind a single mutation guard.
///
/// The map itself never leaves this type, so every read and write goes
/// through the guard. `BTreeMap` keeps snapshots sorted, which makes status
/// output and test comparisons stable.
#[derive(Default)]
pub struct LockTable {
    owners: Mutex<BTreeMap<String, String>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    // Each operation is a single insert or remove, so a poisoned guard never
    // hides a half-applied change.
    fn guard(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes `key` for `requester` if nobody holds it.
    pub fn try_lock(&self, key: &str, requester: &str) -> bool {
        let mut owners = self.guard();
        if owners.contains_key(key) {
            return false;
        }
        owners.insert(key.to_string(), requester.to_string());
        true
    }

    /// Releases `key` if, and only if, `requester` currently holds it.
    pub fn try_unlock(&self, key: &str, requester: &str) -> bool {
        let mut owners = self.guard();
        match owners.get(key) {
            Some(owner) if owner == requester => {
                owners.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Returns the current owner of `key`.
    pub fn lookup(&self, key: &str) -> Option<String> {
        self.guard().get(key).cloned()
    }

    /// Applies a mutation without ownership checks.
    ///
    /// Used on followers for changes the leader already validated, and on the
    /// leader to roll back a change whose fan-out failed. A mirror that has
    /// drifted is tolerated: the divergence is logged and the leader's
    /// decision wins.
    pub fn apply(&self, command: Command, key: &str, requester: &str) {
        let mut owners = self.guard();
        match command {
            Command::Lock => {
                if let Some(previous) = owners.insert(key.to_string(), requester.to_string()) {
                    if previous != requester {
                        warn!(
                            %key,
                            %previous,
                            owner = %requester,
                            "replicated lock replaced a different owner"
                        );
                    }
                }
            }
            Command::Unlock => {
                if owners.remove(key).is_none() {
                    warn!(%key, "replicated unlock for a key that was not held");
                }
            }
            Command::Check => {}
        }
    }

    /// Returns a copy of every held key and its owner.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.guard().clone()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }
}
