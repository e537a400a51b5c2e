//! Channel membership directory.
//!
//! Channel subscriptions live in the same shared store as presence so that
//! whichever host accepts a broadcast can compute its recipients.
//! Subscriptions are explicit and do not expire.

use std::collections::BTreeSet;
use std::sync::Arc;

use fanout_core::{AccountId, ChannelId, DirectoryError, DirectoryOperation};
use tracing::debug;

use crate::store::SetStore;

const KEY_PREFIX: &str = "channel:";

/// Store key for a channel's subscriber set.
pub fn channel_key(channel: &ChannelId) -> String {
    format!("{KEY_PREFIX}{channel}")
}

/// Channel → subscribing accounts.
#[derive(Clone)]
pub struct ChannelDirectory {
    store: Arc<dyn SetStore>,
}

impl ChannelDirectory {
    /// Create a directory over `store`.
    pub fn new(store: Arc<dyn SetStore>) -> Self {
        Self { store }
    }

    /// Subscribe `account` to `channel`. Idempotent.
    pub async fn subscribe(
        &self,
        channel: &ChannelId,
        account: &AccountId,
    ) -> Result<(), DirectoryError> {
        self.store
            .add(&channel_key(channel), account.as_str(), None)
            .await
            .map_err(|e| {
                DirectoryError::new(DirectoryOperation::Subscribe, channel.as_str(), e.to_string())
                    .with_source(e)
            })?;
        debug!(%channel, %account, "subscribed");
        Ok(())
    }

    /// Unsubscribe `account` from `channel`. Idempotent.
    pub async fn unsubscribe(
        &self,
        channel: &ChannelId,
        account: &AccountId,
    ) -> Result<(), DirectoryError> {
        self.store
            .remove(&channel_key(channel), account.as_str())
            .await
            .map_err(|e| {
                DirectoryError::new(
                    DirectoryOperation::Unsubscribe,
                    channel.as_str(),
                    e.to_string(),
                )
                .with_source(e)
            })?;
        debug!(%channel, %account, "unsubscribed");
        Ok(())
    }

    /// Current subscribers of `channel`.
    pub async fn subscribers(
        &self,
        channel: &ChannelId,
    ) -> Result<BTreeSet<AccountId>, DirectoryError> {
        let members = self
            .store
            .members(&channel_key(channel))
            .await
            .map_err(|e| {
                DirectoryError::new(
                    DirectoryOperation::Subscribers,
                    channel.as_str(),
                    e.to_string(),
                )
                .with_source(e)
            })?;
        Ok(members.into_iter().filter_map(AccountId::parse).collect())
    }
}
