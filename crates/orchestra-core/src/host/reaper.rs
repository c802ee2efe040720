// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Expiration reaper.
//!
//! Periodically asks the store for documents past their expiration and
//! deletes them. Documents owned by a live service are deleted through that
//! service, so its delete hook runs (tasks notify their parent when they
//! expire before finishing).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::{Host, Operation};
use crate::error::Result;

/// Expiration reaper configuration.
#[derive(Debug, Clone)]
pub struct ExpirationReaperConfig {
    /// How often to poll for expired documents
    pub poll_interval: Duration,
    /// Maximum documents deleted per poll
    pub batch_size: usize,
}

impl Default for ExpirationReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

/// Expiration reaper that runs as a background task.
pub struct ExpirationReaper {
    host: Host,
    config: ExpirationReaperConfig,
    shutdown: Arc<Notify>,
}

impl ExpirationReaper {
    /// Create a new reaper over `host`.
    pub fn new(host: Host, config: ExpirationReaperConfig) -> Self {
        Self {
            host,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reaper loop.
    pub async fn run(self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Expiration reaper started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Expiration reaper shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.reap_expired().await {
                        error!(error = %e, "Failed to reap expired documents");
                    }
                }
            }
        }
    }

    /// Delete every document that is due. Returns how many were handled.
    pub async fn reap_expired(&self) -> Result<usize> {
        let due = self
            .host
            .store()
            .expired(Utc::now(), self.config.batch_size)
            .await?;

        if due.is_empty() {
            debug!("No expired documents");
            return Ok(0);
        }

        info!(count = due.len(), "Deleting expired documents");

        for link in &due {
            let result = if self.host.is_running(link) {
                self.host.send(Operation::delete(link.clone())).await.map(|_| ())
            } else {
                self.host.store().delete(link).await.map(|_| ())
            };
            if let Err(e) = result {
                warn!(link = %link, error = %e, "Failed to delete expired document");
                // Continue with the rest of the batch
            }
        }

        Ok(due.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::notifier::MockNotifier;
    use crate::store::MemoryDocumentStore;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    #[tokio::test]
    async fn test_reap_removes_orphaned_expired_documents() {
        let store = Arc::new(MemoryDocumentStore::new());
        let host = Host::new(Config::default(), store.clone(), Arc::new(MockNotifier::new()));
        let now = Utc::now();

        host.store()
            .create("/old", "task", json!({}), Some(now - ChronoDuration::seconds(1)))
            .await
            .unwrap();
        host.store()
            .create("/fresh", "task", json!({}), Some(now + ChronoDuration::hours(1)))
            .await
            .unwrap();

        let reaper = ExpirationReaper::new(host.clone(), ExpirationReaperConfig::default());
        assert_eq!(reaper.reap_expired().await.unwrap(), 1);

        assert!(host.store().get("/old").await.unwrap().is_none());
        assert!(host.store().get("/fresh").await.unwrap().is_some());
        assert_eq!(reaper.reap_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let host = Host::new(
            Config::default(),
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MockNotifier::new()),
        );
        let reaper = ExpirationReaper::new(
            host,
            ExpirationReaperConfig {
                poll_interval: Duration::from_millis(5),
                batch_size: 10,
            },
        );
        let shutdown = reaper.shutdown_handle();
        let handle = tokio::spawn(reaper.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.notify_one();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper did not stop")
            .unwrap();
    }
}
