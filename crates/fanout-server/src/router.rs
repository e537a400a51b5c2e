//! Two-phase message routing: local delivery, then one relay per remote host.
//!
//! The presence directory is advisory. A host listed for an account that
//! has since disconnected receives a relay it delivers to nobody; a host
//! missing from the list because its announce is still in flight misses the
//! message. Both are accepted drops.
//!
//! Relays received from siblings go through [`MessageRouter::handle_relay`],
//! which delivers locally and never publishes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use fanout_core::{
    AccountId, ChannelId, ChannelMessage, DirectMessage, HostId, RelayEnvelope, RelayError,
    RelayPayload,
};
use fanout_presence::{ChannelDirectory, PresenceDirectory};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::metrics::{
    DELIVERIES_TOTAL, DELIVERY_FAILURES_TOTAL, DIRECTORY_ERRORS_TOTAL, RELAY_PUBLISH_FAILURES_TOTAL,
    RELAYS_PUBLISHED_TOTAL, RELAYS_RECEIVED_TOTAL, ROUTE_DURATION_SECONDS,
};
use crate::registry::ConnectionRegistry;
use crate::transport::InterHostTransport;
use crate::websocket::frames::ServerFrame;

/// Outcome counts for one routed message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    /// Frames queued on local connections.
    pub delivered: usize,
    /// Local connections that rejected the frame.
    pub failed: usize,
    /// Relays handed to the transport.
    pub relayed: usize,
    /// Relays the transport refused.
    pub relay_failures: usize,
}

/// Routes direct and channel messages to every live connection of each
/// recipient, on this host and its siblings.
pub struct MessageRouter {
    host: HostId,
    registry: Arc<ConnectionRegistry>,
    presence: PresenceDirectory,
    channels: ChannelDirectory,
    transport: Arc<dyn InterHostTransport>,
}

impl MessageRouter {
    /// Create a router for `host`.
    pub fn new(
        host: HostId,
        registry: Arc<ConnectionRegistry>,
        presence: PresenceDirectory,
        channels: ChannelDirectory,
        transport: Arc<dyn InterHostTransport>,
    ) -> Self {
        Self {
            host,
            registry,
            presence,
            channels,
            transport,
        }
    }

    /// This host's id.
    pub fn host(&self) -> &HostId {
        &self.host
    }

    /// Deliver a direct message to every connection of `target`.
    #[instrument(skip_all, fields(source = %source, target = %target))]
    pub async fn direct(
        &self,
        source: AccountId,
        target: AccountId,
        content: impl Into<String>,
    ) -> DeliveryReport {
        let start = Instant::now();
        let message = DirectMessage::new(source, target, content);
        let mut report = self.deliver_direct(&message);

        match self.presence.hosts(message.target()).await {
            Ok(hosts) => {
                for host in hosts.into_iter().filter(|h| *h != self.host) {
                    let envelope =
                        RelayEnvelope::direct(self.host.clone(), host.clone(), message.clone());
                    self.publish(&host, &envelope, "direct", &mut report).await;
                }
            }
            Err(e) => {
                counter!(DIRECTORY_ERRORS_TOTAL, "operation" => "hosts").increment(1);
                warn!(error = %e, "presence lookup failed, delivered locally only");
            }
        }

        histogram!(ROUTE_DURATION_SECONDS, "kind" => "direct")
            .record(start.elapsed().as_secs_f64());
        debug!(?report, "direct message routed");
        report
    }

    /// Deliver a channel message to every subscriber except the author.
    ///
    /// Remote subscribers are grouped so each sibling host receives one
    /// relay listing its recipients.
    #[instrument(skip_all, fields(channel = %channel, author = %author))]
    pub async fn broadcast(
        &self,
        channel: ChannelId,
        author: AccountId,
        content: impl Into<String>,
    ) -> DeliveryReport {
        let start = Instant::now();
        let message = ChannelMessage::new(channel, author, content);
        let mut report = DeliveryReport::default();

        let subscribers = match self.channels.subscribers(message.channel()).await {
            Ok(subscribers) => subscribers,
            Err(e) => {
                counter!(DIRECTORY_ERRORS_TOTAL, "operation" => "subscribers").increment(1);
                warn!(error = %e, "subscriber lookup failed, nothing delivered");
                return report;
            }
        };
        let recipients: Vec<AccountId> = subscribers
            .into_iter()
            .filter(|a| a != message.author())
            .collect();
        if recipients.is_empty() {
            debug!("no recipients");
            return report;
        }

        self.deliver_channel(&message, &recipients, &mut report);

        let lookups = futures::future::join_all(
            recipients
                .iter()
                .map(|account| async move { (account, self.presence.hosts(account).await) }),
        )
        .await;
        let mut by_host: BTreeMap<HostId, Vec<AccountId>> = BTreeMap::new();
        for (account, hosts) in lookups {
            match hosts {
                Ok(hosts) => {
                    for host in hosts.into_iter().filter(|h| *h != self.host) {
                        by_host.entry(host).or_default().push(account.clone());
                    }
                }
                Err(e) => {
                    counter!(DIRECTORY_ERRORS_TOTAL, "operation" => "hosts").increment(1);
                    warn!(%account, error = %e, "presence lookup failed, skipping remote delivery");
                }
            }
        }
        for (host, accounts) in by_host {
            let envelope =
                RelayEnvelope::channel(self.host.clone(), host.clone(), message.clone(), accounts);
            self.publish(&host, &envelope, "channel", &mut report).await;
        }

        histogram!(ROUTE_DURATION_SECONDS, "kind" => "channel")
            .record(start.elapsed().as_secs_f64());
        debug!(?report, recipients = recipients.len(), "channel message routed");
        report
    }

    /// Deliver a relay from a sibling host to local connections only.
    #[instrument(skip_all, fields(origin = %envelope.origin()))]
    pub async fn handle_relay(&self, envelope: RelayEnvelope) -> Result<DeliveryReport, RelayError> {
        if let Err(e) = envelope.validate_for(&self.host) {
            counter!(RELAYS_RECEIVED_TOTAL, "outcome" => "rejected").increment(1);
            return Err(e);
        }
        counter!(RELAYS_RECEIVED_TOTAL, "outcome" => "accepted").increment(1);

        let report = match envelope.payload() {
            RelayPayload::Direct { message } => self.deliver_direct(message),
            RelayPayload::Channel {
                message,
                recipients,
            } => {
                let unique: BTreeSet<&AccountId> = recipients
                    .iter()
                    .filter(|a| *a != message.author())
                    .collect();
                let recipients: Vec<AccountId> = unique.into_iter().cloned().collect();
                let mut report = DeliveryReport::default();
                self.deliver_channel(message, &recipients, &mut report);
                report
            }
        };
        debug!(?report, "relay delivered");
        Ok(report)
    }

    fn deliver_direct(&self, message: &DirectMessage) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        match ServerFrame::direct(message).encode() {
            Ok(frame) => self.deliver_local(message.target(), &frame, "direct", &mut report),
            Err(e) => warn!(error = %e, "failed to encode direct frame"),
        }
        report
    }

    fn deliver_channel(
        &self,
        message: &ChannelMessage,
        recipients: &[AccountId],
        report: &mut DeliveryReport,
    ) {
        let frame = match ServerFrame::channel(message).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode channel frame");
                return;
            }
        };
        for account in recipients {
            self.deliver_local(account, &frame, "channel", report);
        }
    }

    fn deliver_local(
        &self,
        account: &AccountId,
        frame: &Arc<String>,
        kind: &'static str,
        report: &mut DeliveryReport,
    ) {
        for conn in self.registry.list(account) {
            match conn.send(frame.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    counter!(DELIVERIES_TOTAL, "kind" => kind).increment(1);
                }
                Err(e) => {
                    report.failed += 1;
                    counter!(DELIVERY_FAILURES_TOTAL).increment(1);
                    warn!(%account, conn_id = %conn.id(), error = %e, "local delivery failed");
                }
            }
        }
    }

    async fn publish(
        &self,
        host: &HostId,
        envelope: &RelayEnvelope,
        kind: &'static str,
        report: &mut DeliveryReport,
    ) {
        match self.transport.publish(host, envelope).await {
            Ok(()) => {
                report.relayed += 1;
                counter!(RELAYS_PUBLISHED_TOTAL, "kind" => kind).increment(1);
            }
            Err(e) => {
                report.relay_failures += 1;
                counter!(RELAY_PUBLISH_FAILURES_TOTAL).increment(1);
                warn!(%host, code = e.code(), error = %e, "relay publish failed");
            }
        }
    }
}
