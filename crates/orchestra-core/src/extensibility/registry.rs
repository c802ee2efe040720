// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory cache of extensibility subscriptions.
//!
//! Subscription records live in the store under
//! [`SUBSCRIPTIONS_LINK`](super::SUBSCRIPTIONS_LINK). The
//! registry loads all of them at startup and then follows a single marker
//! record ([`LAST_UPDATED_LINK`]) that is touched after every registration or
//! removal, so lookups on the task hot path never hit the store.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    ExtensibilitySubscription, LAST_UPDATED_LINK, SUBSCRIPTION_KIND, checkpoint_key,
    subscription_link,
};
use crate::error::{CoreError, Result};
use crate::store::{DocumentChange, DocumentStore};
use crate::task::TaskStage;

const MARKER_KIND: &str = "extensibility-subscription-marker";

/// Body of the marker record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LastUpdated {
    subscription_link: String,
}

/// Subscriptions keyed by record address.
pub struct SubscriptionRegistry {
    store: Arc<dyn DocumentStore>,
    subscriptions: DashMap<String, ExtensibilitySubscription>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Empty registry over `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            subscriptions: DashMap::new(),
        }
    }

    /// Replace the cache with every persisted subscription.
    pub async fn load_all(&self) -> Result<usize> {
        let documents = self.store.list_kind(SUBSCRIPTION_KIND).await?;
        self.subscriptions.clear();
        for document in documents {
            match serde_json::from_value::<ExtensibilitySubscription>(document.body) {
                Ok(subscription) => {
                    self.subscriptions.insert(document.link, subscription);
                }
                Err(e) => {
                    warn!(link = %document.link, error = %e, "Skipping malformed subscription");
                }
            }
        }
        info!(count = self.subscriptions.len(), "Extensibility subscriptions loaded");
        Ok(self.subscriptions.len())
    }

    /// Re-read one subscription record; a missing record is evicted.
    pub async fn refresh(&self, link: &str) -> Result<()> {
        match self.store.get(link).await? {
            Some(document) => {
                let subscription: ExtensibilitySubscription = serde_json::from_value(document.body)?;
                debug!(link = %link, key = %subscription.key(), "Subscription refreshed");
                self.subscriptions.insert(link.to_string(), subscription);
            }
            None => {
                if self.subscriptions.remove(link).is_some() {
                    debug!(link = %link, "Subscription evicted");
                }
            }
        }
        Ok(())
    }

    /// Subscription registered for a checkpoint.
    pub fn lookup(
        &self,
        task_kind: &str,
        stage: TaskStage,
        sub_stage: &str,
    ) -> Option<ExtensibilitySubscription> {
        let link = subscription_link(&checkpoint_key(task_kind, stage, sub_stage));
        self.subscriptions.get(&link).map(|s| s.value().clone())
    }

    /// Number of cached subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Load every subscription, then follow the marker record until
    /// `shutdown` is notified.
    ///
    /// The marker feed is subscribed before the load, so a registration
    /// landing while the load runs is still applied.
    pub async fn load_and_watch(self: Arc<Self>, shutdown: Arc<Notify>) -> Result<JoinHandle<()>> {
        let changes = self.store.subscribe(LAST_UPDATED_LINK);
        self.load_all().await?;
        Ok(self.follow(changes, shutdown))
    }

    /// Follow the marker record until `shutdown` is notified.
    pub fn watch(self: Arc<Self>, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let changes = self.store.subscribe(LAST_UPDATED_LINK);
        self.follow(changes, shutdown)
    }

    fn follow(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<DocumentChange>,
        shutdown: Arc<Notify>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        debug!("Subscription watcher shutting down");
                        break;
                    }
                    change = changes.recv() => match change {
                        Ok(DocumentChange::Updated { version, .. }) => {
                            if let Err(e) = self.on_marker_updated(version).await {
                                warn!(error = %e, "Failed to apply subscription change");
                            }
                        }
                        Ok(DocumentChange::Deleted { .. }) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Subscription feed lagged, reloading");
                            if let Err(e) = self.load_all().await {
                                warn!(error = %e, "Failed to reload subscriptions");
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    async fn on_marker_updated(&self, version: u64) -> Result<()> {
        let Some(marker) = self.store.get(LAST_UPDATED_LINK).await? else {
            return Ok(());
        };
        if marker.version != version {
            // Another change landed before this one was read
            self.load_all().await?;
            return Ok(());
        }
        let marker: LastUpdated = serde_json::from_value(marker.body)?;
        self.refresh(&marker.subscription_link).await
    }

    /// Persist `subscription` unless a record for its checkpoint exists.
    /// Returns the record address.
    pub async fn register(
        store: &dyn DocumentStore,
        subscription: &ExtensibilitySubscription,
    ) -> Result<String> {
        let key = subscription.key();
        let existing = store
            .query_by_field(SUBSCRIPTION_KIND, "key", &Value::String(key.clone()))
            .await?;
        if let Some(document) = existing.into_iter().next() {
            debug!(key = %key, "Subscription already registered");
            return Ok(document.link);
        }

        let link = subscription_link(&key);
        let mut body = serde_json::to_value(subscription)?;
        if let Value::Object(fields) = &mut body {
            fields.insert("key".to_string(), Value::String(key.clone()));
        }
        match store.create(&link, SUBSCRIPTION_KIND, body, None).await {
            Ok(_) | Err(CoreError::DocumentAlreadyExists { .. }) => {}
            Err(e) => return Err(e),
        }
        Self::touch_marker(store, &link).await?;
        info!(key = %key, link = %link, "Subscription registered");
        Ok(link)
    }

    /// Remove a subscription record. Returns whether it existed.
    pub async fn unregister(store: &dyn DocumentStore, link: &str) -> Result<bool> {
        let existed = store.delete(link).await?;
        if existed {
            Self::touch_marker(store, link).await?;
            info!(link = %link, "Subscription removed");
        }
        Ok(existed)
    }

    /// Point the marker record at `link`, creating it if needed.
    pub async fn touch_marker(store: &dyn DocumentStore, link: &str) -> Result<()> {
        let body = json!({ "subscriptionLink": link });
        match store.update(LAST_UPDATED_LINK, None, body.clone(), None).await {
            Ok(_) => Ok(()),
            Err(CoreError::DocumentNotFound { .. }) => {
                match store
                    .create(LAST_UPDATED_LINK, MARKER_KIND, body.clone(), None)
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(CoreError::DocumentAlreadyExists { .. }) => store
                        .update(LAST_UPDATED_LINK, None, body, None)
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }
}
