//! In-process relay bus.
//!
//! One bounded topic per subscribed host. Hosts that live in the same
//! process (single-node deployments, tests) share one `MemoryBus`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use fanout_core::{HostId, RelayEnvelope, RelayError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::InterHostTransport;
use crate::router::MessageRouter;

const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Host-topic pub/sub over `tokio::sync::mpsc`.
pub struct MemoryBus {
    topics: DashMap<HostId, mpsc::Sender<RelayEnvelope>>,
    capacity: usize,
}

impl MemoryBus {
    /// Create a bus with the default per-topic capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Create a bus whose topics buffer up to `capacity` envelopes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to relays addressed to `host`.
    ///
    /// Replaces any previous subscription for the same host.
    pub fn subscribe(&self, host: &HostId) -> mpsc::Receiver<RelayEnvelope> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.topics.insert(host.clone(), tx).is_some() {
            debug!(%host, "replaced relay subscription");
        }
        rx
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InterHostTransport for MemoryBus {
    async fn publish(
        &self,
        destination: &HostId,
        envelope: &RelayEnvelope,
    ) -> Result<(), RelayError> {
        let Some(tx) = self.topics.get(destination).map(|t| t.value().clone()) else {
            return Err(RelayError::Publish {
                host: destination.to_string(),
                message: "no subscriber".into(),
            });
        };
        match tx.try_send(envelope.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RelayError::Publish {
                host: destination.to_string(),
                message: "topic full".into(),
            }),
            Err(TrySendError::Closed(_)) => {
                let _ = self
                    .topics
                    .remove_if(destination, |_, current| current.same_channel(&tx));
                Err(RelayError::Publish {
                    host: destination.to_string(),
                    message: "subscriber gone".into(),
                })
            }
        }
    }
}

/// Drain `rx` into `router` until `cancel` fires or the topic closes.
pub fn spawn_relay_listener(
    mut rx: mpsc::Receiver<RelayEnvelope>,
    router: Arc<MessageRouter>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(host = %router.host(), "relay listener started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                envelope = rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    if let Err(e) = router.handle_relay(envelope).await {
                        warn!(code = e.code(), error = %e, "relay rejected");
                    }
                }
            }
        }
        info!(host = %router.host(), "relay listener stopped");
    })
}
