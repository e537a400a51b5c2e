//! Presence lease renewal.
//!
//! Announcements expire unless refreshed. This task re-announces every
//! account with a local connection once per interval, so a live host stays
//! listed and a crashed one drops out within one lease. The same tick
//! deletes lapsed announcements so dead hosts do not accumulate in the
//! store.

use std::sync::Arc;
use std::time::Duration;

use fanout_core::HostId;
use fanout_presence::PresenceDirectory;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::DIRECTORY_ERRORS_TOTAL;
use crate::registry::ConnectionRegistry;

/// Re-announce every local account, then purge lapsed announcements, until
/// `cancel` fires.
pub fn spawn_lease_renewal(
    registry: Arc<ConnectionRegistry>,
    presence: PresenceDirectory,
    host: HostId,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Connections announce themselves; skip the immediate first tick
        let _ = ticker.tick().await;
        info!(%host, interval_secs = interval.as_secs(), "lease renewal started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let renewed = renew_all(&registry, &presence, &host).await;
                    debug!(renewed, "presence leases renewed");
                    purge_lapsed(&presence).await;
                }
            }
        }
        info!(%host, "lease renewal stopped");
    })
}

/// Re-announce each account currently in `registry`. Returns how many
/// announcements succeeded.
pub async fn renew_all(
    registry: &ConnectionRegistry,
    presence: &PresenceDirectory,
    host: &HostId,
) -> usize {
    let mut renewed = 0;
    for account in registry.accounts() {
        match presence.announce(&account, host).await {
            Ok(()) => renewed += 1,
            Err(e) => {
                counter!(DIRECTORY_ERRORS_TOTAL, "operation" => "announce").increment(1);
                warn!(%account, error = %e, "lease renewal failed");
            }
        }
    }
    renewed
}

async fn purge_lapsed(presence: &PresenceDirectory) {
    if let Err(e) = presence.purge_expired().await {
        counter!(DIRECTORY_ERRORS_TOTAL, "operation" => "purge").increment(1);
        warn!(error = %e, "purge of lapsed presence failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::ClientConnection;
    use fanout_core::{AccountId, ConnectionId};
    use fanout_presence::MemorySetStore;
    use tokio::sync::mpsc;

    fn add(registry: &ConnectionRegistry, account: &str, id: &str) {
        let (tx, _rx) = mpsc::channel(1);
        let account = AccountId::from(account);
        let id = ConnectionId::from(id);
        let conn = ClientConnection::new(id.clone(), account.clone(), tx, CancellationToken::new());
        let _ = registry.add(&account, id, Arc::new(conn));
    }

    #[tokio::test]
    async fn renew_all_announces_every_local_account() {
        let registry = ConnectionRegistry::new();
        let presence = PresenceDirectory::new(Arc::new(MemorySetStore::new()), None);
        add(&registry, "alice", "c1");
        add(&registry, "bob", "c2");

        let host = HostId::from("h1:1");
        assert_eq!(renew_all(&registry, &presence, &host).await, 2);
        assert!(presence.hosts(&"alice".into()).await.unwrap().contains(&host));
        assert!(presence.hosts(&"bob".into()).await.unwrap().contains(&host));
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_keeps_leased_presence_alive() {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = PresenceDirectory::new(
            Arc::new(MemorySetStore::new()),
            Some(Duration::from_secs(10)),
        );
        let host = HostId::from("h1:1");
        add(&registry, "alice", "c1");
        presence.announce(&"alice".into(), &host).await.unwrap();

        let cancel = CancellationToken::new();
        let task = spawn_lease_renewal(
            registry.clone(),
            presence.clone(),
            host.clone(),
            Duration::from_secs(3),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(presence.hosts(&"alice".into()).await.unwrap().contains(&host));

        cancel.cancel();
        task.await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(presence.hosts(&"alice".into()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_purges_hosts_that_stopped_renewing() {
        let store = Arc::new(MemorySetStore::new());
        let lease = Some(Duration::from_secs(10));
        let presence = PresenceDirectory::new(store.clone(), lease);
        let registry = Arc::new(ConnectionRegistry::new());
        let host = HostId::from("h1:1");
        add(&registry, "alice", "c1");
        presence.announce(&"alice".into(), &host).await.unwrap();

        // A sibling that announced once and then died.
        let dead = PresenceDirectory::new(store.clone(), lease);
        dead.announce(&"bob".into(), &"h9:1".into()).await.unwrap();
        assert_eq!(store.key_count(), 2);

        let cancel = CancellationToken::new();
        let task = spawn_lease_renewal(
            registry,
            presence.clone(),
            host.clone(),
            Duration::from_secs(3),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(store.key_count(), 1);
        assert!(presence.hosts(&"alice".into()).await.unwrap().contains(&host));

        cancel.cancel();
        task.await.unwrap();
    }
}
