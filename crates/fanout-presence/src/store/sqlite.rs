//! `SQLite`-backed set store.
//!
//! Uses an `r2d2` pool over one database file. Several server processes on
//! the same machine can open the same file and share presence through it;
//! WAL mode plus a busy timeout serializes their writes per row.
//!
//! Lease deadlines are stored as wall-clock epoch milliseconds because
//! the processes sharing the file do not share a monotonic clock.

use std::time::Duration;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, params};
use tracing::debug;

use super::{Result, SetStore};

/// Alias for the connection pool type.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// Configuration for the connection pool.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Maximum pool size (default: 8).
    pub pool_size: u32,
    /// Busy timeout in milliseconds (default: 5000).
    pub busy_timeout_ms: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Pragma customizer that runs on each new connection.
#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout_ms: u32,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = {};\
             PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))?;
        Ok(())
    }
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS set_members (
    set_key       TEXT    NOT NULL,
    member        TEXT    NOT NULL,
    expires_at_ms INTEGER,
    PRIMARY KEY (set_key, member)
);
CREATE INDEX IF NOT EXISTS idx_set_members_expiry ON set_members (expires_at_ms);";

/// [`SetStore`] persisted in a shared `SQLite` file.
#[derive(Clone)]
pub struct SqliteSetStore {
    pool: ConnectionPool,
}

impl SqliteSetStore {
    /// Open (or create) the store at `path` and ensure the schema exists.
    pub fn open(path: &str, config: &ConnectionConfig) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path);
        Self::from_manager(manager, config)
    }

    /// Private in-memory store (one connection, for tests).
    pub fn in_memory() -> Result<Self> {
        let config = ConnectionConfig {
            pool_size: 1,
            ..ConnectionConfig::default()
        };
        Self::from_manager(SqliteConnectionManager::memory(), &config)
    }

    fn from_manager(manager: SqliteConnectionManager, config: &ConnectionConfig) -> Result<Self> {
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(Duration::from_secs(5))
            .connection_customizer(Box::new(PragmaCustomizer {
                busy_timeout_ms: config.busy_timeout_ms,
            }))
            .build(manager)?;
        pool.get()?.execute_batch(SCHEMA)?;
        Ok(Self { pool })
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn deadline_ms(lease: Option<Duration>) -> Option<i64> {
    lease.map(|l| now_ms().saturating_add(i64::try_from(l.as_millis()).unwrap_or(i64::MAX)))
}

#[async_trait]
impl SetStore for SqliteSetStore {
    async fn add(&self, key: &str, member: &str, lease: Option<Duration>) -> Result<()> {
        let pool = self.pool.clone();
        let (key, member) = (key.to_owned(), member.to_owned());
        let expires = deadline_ms(lease);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = pool.get()?;
            let _ = conn.execute(
                "INSERT INTO set_members (set_key, member, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT (set_key, member) DO UPDATE SET expires_at_ms = excluded.expires_at_ms",
                params![key, member, expires],
            )?;
            Ok(())
        })
        .await?
    }

    async fn remove(&self, key: &str, member: &str) -> Result<()> {
        let pool = self.pool.clone();
        let (key, member) = (key.to_owned(), member.to_owned());
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = pool.get()?;
            let _ = conn.execute(
                "DELETE FROM set_members WHERE set_key = ?1 AND member = ?2",
                params![key, member],
            )?;
            Ok(())
        })
        .await?
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        let pool = self.pool.clone();
        let key = key.to_owned();
        let now = now_ms();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let conn = pool.get()?;
            let mut stmt = conn.prepare_cached(
                "SELECT member FROM set_members
                 WHERE set_key = ?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)
                 ORDER BY member",
            )?;
            let rows = stmt.query_map(params![key, now], |row| row.get::<_, String>(0))?;
            let mut members = Vec::new();
            for row in rows {
                members.push(row?);
            }
            Ok(members)
        })
        .await?
    }

    async fn purge_expired(&self) -> Result<usize> {
        let pool = self.pool.clone();
        let now = now_ms();
        let removed = tokio::task::spawn_blocking(move || -> Result<usize> {
            let conn = pool.get()?;
            Ok(conn.execute(
                "DELETE FROM set_members WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
                params![now],
            )?)
        })
        .await??;
        debug!(removed, "purged expired set members");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_add_and_read() {
        let store = SqliteSetStore::in_memory().unwrap();
        store.add("presence:alice", "h2:1", None).await.unwrap();
        store.add("presence:alice", "h1:1", None).await.unwrap();
        assert_eq!(
            store.members("presence:alice").await.unwrap(),
            vec!["h1:1", "h2:1"]
        );
    }

    #[tokio::test]
    async fn duplicate_add_keeps_one_row() {
        let store = SqliteSetStore::in_memory().unwrap();
        store.add("k", "m", None).await.unwrap();
        store.add("k", "m", None).await.unwrap();
        assert_eq!(store.members("k").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = SqliteSetStore::in_memory().unwrap();
        store.add("k", "m", None).await.unwrap();
        store.remove("k", "m").await.unwrap();
        store.remove("k", "m").await.unwrap();
        assert!(store.members("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_lease_is_hidden_and_purged() {
        let store = SqliteSetStore::in_memory().unwrap();
        store
            .add("k", "gone", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        store.add("k", "kept", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.members("k").await.unwrap(), vec!["kept"]);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn two_handles_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presence.db");
        let path = path.to_str().unwrap();
        let h1 = SqliteSetStore::open(path, &ConnectionConfig::default()).unwrap();
        let h2 = SqliteSetStore::open(path, &ConnectionConfig::default()).unwrap();

        h1.add("presence:alice", "h1:1", None).await.unwrap();
        h2.add("presence:alice", "h2:1", None).await.unwrap();
        assert_eq!(
            h1.members("presence:alice").await.unwrap(),
            vec!["h1:1", "h2:1"]
        );

        h1.remove("presence:alice", "h2:1").await.unwrap();
        assert_eq!(h2.members("presence:alice").await.unwrap(), vec!["h1:1"]);
    }
}
