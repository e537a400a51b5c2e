//! Per-process map of live connections keyed by account.
//!
//! A single mutex covers the whole registry, so `add`, `remove`, `has`, and
//! `list` are linearizable with respect to each other. The map is never
//! exposed; callers only see snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use fanout_core::{AccountId, ConnectionId};
use parking_lot::Mutex;

use crate::websocket::connection::ClientConnection;

#[derive(Default)]
struct Inner {
    accounts: HashMap<AccountId, HashMap<ConnectionId, Arc<ClientConnection>>>,
    owners: HashMap<ConnectionId, AccountId>,
}

impl Inner {
    /// Detach `id` from `account`, dropping the account entry when it empties.
    ///
    /// Returns `Some(now_empty)` if the pair was present.
    fn detach(&mut self, account: &AccountId, id: &ConnectionId) -> Option<bool> {
        let conns = self.accounts.get_mut(account)?;
        let _ = conns.remove(id)?;
        let _ = self.owners.remove(id);
        let empty = conns.is_empty();
        if empty {
            let _ = self.accounts.remove(account);
        }
        Some(empty)
    }
}

/// Account → connections registry for this host.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `connection` under `account`.
    ///
    /// Returns `true` when this is the account's first local connection,
    /// decided inside the same critical section as the insert. A connection
    /// id already registered under another account is moved.
    pub fn add(
        &self,
        account: &AccountId,
        id: ConnectionId,
        connection: Arc<ClientConnection>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.owners.get(&id).cloned() {
            if previous != *account {
                let _ = inner.detach(&previous, &id);
            }
        }
        let _ = inner.owners.insert(id.clone(), account.clone());
        let conns = inner.accounts.entry(account.clone()).or_default();
        let first = conns.is_empty();
        let _ = conns.insert(id, connection);
        first
    }

    /// Remove one connection. Idempotent.
    ///
    /// Returns `true` when the pair was present and the account now has no
    /// local connections.
    pub fn remove(&self, account: &AccountId, id: &ConnectionId) -> bool {
        self.inner.lock().detach(account, id).unwrap_or(false)
    }

    /// Whether `account` has at least one local connection.
    pub fn has(&self, account: &AccountId) -> bool {
        self.inner.lock().accounts.contains_key(account)
    }

    /// Snapshot of `account`'s connections.
    pub fn list(&self, account: &AccountId) -> Vec<Arc<ClientConnection>> {
        self.inner
            .lock()
            .accounts
            .get(account)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every account with a local connection.
    pub fn accounts(&self) -> Vec<AccountId> {
        self.inner.lock().accounts.keys().cloned().collect()
    }

    /// Total local connections.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().owners.len()
    }

    /// Number of accounts with a local connection.
    pub fn account_count(&self) -> usize {
        self.inner.lock().accounts.len()
    }
}
