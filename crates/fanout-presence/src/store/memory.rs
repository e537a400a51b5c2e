//! In-process set store.
//!
//! Shared between hosts that live in the same process (tests, single-node
//! deployments) by cloning the `Arc` that wraps it. Leases are measured on
//! the tokio clock so paused-time tests can advance them.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{Result, SetStore};

/// In-memory [`SetStore`] with per-member lease expiry.
#[derive(Default)]
pub struct MemorySetStore {
    /// key → (member → lease deadline).
    sets: Mutex<HashMap<String, BTreeMap<String, Option<Instant>>>>,
}

impl MemorySetStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with at least one stored member (expired or not).
    pub fn key_count(&self) -> usize {
        self.sets.lock().len()
    }
}

#[async_trait]
impl SetStore for MemorySetStore {
    async fn add(&self, key: &str, member: &str, lease: Option<Duration>) -> Result<()> {
        let deadline = lease.map(|l| Instant::now() + l);
        let mut sets = self.sets.lock();
        let _ = sets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned(), deadline);
        Ok(())
    }

    async fn remove(&self, key: &str, member: &str) -> Result<()> {
        let mut sets = self.sets.lock();
        if let Some(members) = sets.get_mut(key) {
            let _ = members.remove(member);
            if members.is_empty() {
                let _ = sets.remove(key);
            }
        }
        Ok(())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let sets = self.sets.lock();
        Ok(sets
            .get(key)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, deadline)| deadline.is_none_or(|d| d > now))
                    .map(|(m, _)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut sets = self.sets.lock();
        let mut purged = 0;
        sets.retain(|_, members| {
            let before = members.len();
            members.retain(|_, deadline| deadline.is_none_or(|d| d > now));
            purged += before - members.len();
            !members.is_empty()
        });
        Ok(purged)
    }
}
