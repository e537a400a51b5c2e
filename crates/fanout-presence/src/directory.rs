//! Cross-host presence directory.
//!
//! Maps each account to the set of hosts that currently hold at least one
//! live connection for it. The mapping is a best-effort hint maintained with
//! lag: a host may appear briefly after its last connection closed, or be
//! missing briefly after its first connection opened. Readers must treat it
//! as advisory.
//!
//! Announcements carry a lease when one is configured. A host that dies
//! without retracting drops out of [`PresenceDirectory::hosts`] once its
//! leases lapse; live hosts keep theirs fresh by re-announcing.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use fanout_core::{AccountId, DirectoryError, DirectoryOperation, HostId};
use tracing::{debug, instrument};

use crate::store::SetStore;

const KEY_PREFIX: &str = "presence:";

/// Store key for an account's host set.
pub fn presence_key(account: &AccountId) -> String {
    format!("{KEY_PREFIX}{account}")
}

/// Account → hosts directory backed by a shared [`SetStore`].
#[derive(Clone)]
pub struct PresenceDirectory {
    store: Arc<dyn SetStore>,
    lease: Option<Duration>,
}

impl PresenceDirectory {
    /// Create a directory. `lease` of `None` disables expiry.
    pub fn new(store: Arc<dyn SetStore>, lease: Option<Duration>) -> Self {
        Self { store, lease }
    }

    /// Lease attached to each announcement.
    pub fn lease(&self) -> Option<Duration> {
        self.lease
    }

    /// Record that `host` holds a live connection for `account`.
    ///
    /// Idempotent; announcing again refreshes the lease.
    #[instrument(skip_all, fields(account = %account, host = %host))]
    pub async fn announce(&self, account: &AccountId, host: &HostId) -> Result<(), DirectoryError> {
        let key = presence_key(account);
        self.store
            .add(&key, host.as_str(), self.lease)
            .await
            .map_err(|e| {
                DirectoryError::new(DirectoryOperation::Announce, account.as_str(), e.to_string())
                    .with_source(e)
            })?;
        debug!("host announced");
        Ok(())
    }

    /// Record that `host` no longer holds any connection for `account`.
    ///
    /// Removing an absent host is a no-op.
    #[instrument(skip_all, fields(account = %account, host = %host))]
    pub async fn retract(&self, account: &AccountId, host: &HostId) -> Result<(), DirectoryError> {
        let key = presence_key(account);
        self.store
            .remove(&key, host.as_str())
            .await
            .map_err(|e| {
                DirectoryError::new(DirectoryOperation::Retract, account.as_str(), e.to_string())
                    .with_source(e)
            })?;
        debug!("host retracted");
        Ok(())
    }

    /// Hosts currently believed to hold connections for `account`.
    pub async fn hosts(&self, account: &AccountId) -> Result<BTreeSet<HostId>, DirectoryError> {
        let key = presence_key(account);
        let members = self.store.members(&key).await.map_err(|e| {
            DirectoryError::new(DirectoryOperation::Hosts, account.as_str(), e.to_string())
                .with_source(e)
        })?;
        Ok(members
            .into_iter()
            .filter_map(HostId::parse)
            .collect())
    }

    /// Delete lapsed announcements from the backing store.
    ///
    /// Reads already hide them; this only reclaims space left behind by
    /// hosts that died without retracting.
    pub async fn purge_expired(&self) -> Result<usize, DirectoryError> {
        let purged = self.store.purge_expired().await.map_err(|e| {
            DirectoryError::new(DirectoryOperation::Purge, "*", e.to_string())
                .with_source(e)
        })?;
        if purged > 0 {
            debug!(purged, "expired announcements purged");
        }
        Ok(purged)
    }
}
