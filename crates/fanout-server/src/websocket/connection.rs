//! WebSocket client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use fanout_core::{AccountId, ConnectionId, DeliveryError};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::frames::ServerFrame;

/// Handle to one live client connection.
///
/// Frames are queued onto a bounded channel drained by the connection's
/// writer task, which preserves per-connection FIFO order. Closing cancels
/// the connection's token; both the reader and the writer watch it.
pub struct ClientConnection {
    id: ConnectionId,
    account: AccountId,
    tx: mpsc::Sender<Arc<String>>,
    cancel: CancellationToken,
    /// When this connection was established.
    pub connected_at: Instant,
    is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(
        id: ConnectionId,
        account: AccountId,
        tx: mpsc::Sender<Arc<String>>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            account,
            tx,
            cancel,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Account this connection was opened for.
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// Queue a text frame for the client.
    ///
    /// Never blocks. A full buffer or a closed writer is reported and
    /// counted as a drop.
    pub fn send(&self, frame: Arc<String>) -> Result<(), DeliveryError> {
        if self.cancel.is_cancelled() {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            return Err(DeliveryError::Closed {
                conn_id: self.id.to_string(),
            });
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                let conn_id = self.id.to_string();
                Err(match e {
                    TrySendError::Full(_) => DeliveryError::BufferFull { conn_id },
                    TrySendError::Closed(_) => DeliveryError::Closed { conn_id },
                })
            }
        }
    }

    /// Encode and queue a server frame.
    pub fn send_frame(&self, frame: &ServerFrame) -> Result<(), DeliveryError> {
        self.send(frame.encode()?)
    }

    /// Ask the connection to close. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether a close has been requested.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve once the connection has been asked to close.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong or any inbound frame received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Duration since the last pong (or connection establishment).
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("account", &self.account)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
