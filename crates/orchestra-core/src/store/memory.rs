// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory document store.
//!
//! Used by the demo binary, embedded setups and tests. Nothing survives a
//! restart.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use super::{Document, DocumentChange, DocumentStore};
use crate::error::CoreError;

const FEED_CAPACITY: usize = 64;

/// Document store backed by a `HashMap`.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<String, Document>>,
    feeds: Mutex<HashMap<String, broadcast::Sender<DocumentChange>>>,
}

impl std::fmt::Debug for MemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDocumentStore").finish_non_exhaustive()
    }
}

impl MemoryDocumentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, change: DocumentChange) {
        let link = match &change {
            DocumentChange::Updated { link, .. } | DocumentChange::Deleted { link } => link,
        };
        let feeds = self.feeds.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sender) = feeds.get(link) {
            // No receivers is fine
            let _ = sender.send(change);
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(
        &self,
        link: &str,
        kind: &str,
        body: Value,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<Document, CoreError> {
        let document = {
            let mut documents = self.documents.write().await;
            if documents.contains_key(link) {
                return Err(CoreError::DocumentAlreadyExists {
                    link: link.to_string(),
                });
            }
            let document = Document {
                link: link.to_string(),
                kind: kind.to_string(),
                version: 0,
                body,
                expiration,
                updated_at: Utc::now(),
            };
            documents.insert(link.to_string(), document.clone());
            document
        };

        debug!(link = %link, kind = %kind, "Document created");
        self.publish(DocumentChange::Updated {
            link: link.to_string(),
            version: 0,
        });
        Ok(document)
    }

    async fn get(&self, link: &str) -> Result<Option<Document>, CoreError> {
        Ok(self.documents.read().await.get(link).cloned())
    }

    async fn update(
        &self,
        link: &str,
        expected_version: Option<u64>,
        body: Value,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<Document, CoreError> {
        let document = {
            let mut documents = self.documents.write().await;
            let document =
                documents
                    .get_mut(link)
                    .ok_or_else(|| CoreError::DocumentNotFound {
                        link: link.to_string(),
                    })?;
            if let Some(expected) = expected_version {
                if expected != document.version {
                    return Err(CoreError::VersionConflict {
                        link: link.to_string(),
                        expected,
                        actual: document.version,
                    });
                }
            }
            document.version += 1;
            document.body = body;
            document.expiration = expiration;
            document.updated_at = Utc::now();
            document.clone()
        };

        self.publish(DocumentChange::Updated {
            link: link.to_string(),
            version: document.version,
        });
        Ok(document)
    }

    async fn delete(&self, link: &str) -> Result<bool, CoreError> {
        let existed = self.documents.write().await.remove(link).is_some();
        if existed {
            debug!(link = %link, "Document deleted");
            self.publish(DocumentChange::Deleted {
                link: link.to_string(),
            });
        }
        Ok(existed)
    }

    async fn query_by_field(
        &self,
        kind: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Document>, CoreError> {
        let documents = self.documents.read().await;
        Ok(documents
            .values()
            .filter(|d| d.kind == kind && d.body.get(field) == Some(value))
            .cloned()
            .collect())
    }

    async fn list_kind(&self, kind: &str) -> Result<Vec<Document>, CoreError> {
        let documents = self.documents.read().await;
        Ok(documents
            .values()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect())
    }

    async fn expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, CoreError> {
        let documents = self.documents.read().await;
        let mut due: Vec<&Document> = documents
            .values()
            .filter(|d| d.expiration.is_some_and(|at| at <= now))
            .collect();
        due.sort_by_key(|d| d.expiration);
        Ok(due.into_iter().take(limit).map(|d| d.link.clone()).collect())
    }

    fn subscribe(&self, link: &str) -> broadcast::Receiver<DocumentChange> {
        let mut feeds = self.feeds.lock().unwrap_or_else(|e| e.into_inner());
        feeds
            .entry(link.to_string())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .subscribe()
    }
}
