// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Document store interface and backends for orchestra-core.
//!
//! The store is an external collaborator: it owns durability, versioning and
//! expiration bookkeeping. The core only needs create/read/update/delete by
//! address, a query-by-field primitive and a per-document change feed.

pub mod memory;

pub use self::memory::MemoryDocumentStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::CoreError;

/// Document record from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Address of the document.
    pub link: String,
    /// Document kind, used for queries (e.g. `task`, `counter-subtask`).
    pub kind: String,
    /// Optimistic version; 0 for a freshly created document.
    pub version: u64,
    /// JSON body.
    pub body: Value,
    /// When the store may delete the document.
    pub expiration: Option<DateTime<Utc>>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

/// Change notification emitted on a document's feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentChange {
    /// The document was created or updated.
    Updated {
        /// Address of the document.
        link: String,
        /// Version after the write.
        version: u64,
    },
    /// The document was deleted.
    Deleted {
        /// Address of the document.
        link: String,
    },
}

/// Document store operations consumed by the orchestration core.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a document at `link` with version 0.
    ///
    /// Fails with [`CoreError::DocumentAlreadyExists`] when the link is taken.
    async fn create(
        &self,
        link: &str,
        kind: &str,
        body: Value,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<Document, CoreError>;

    /// Read a document.
    async fn get(&self, link: &str) -> Result<Option<Document>, CoreError>;

    /// Replace a document body, bumping its version.
    ///
    /// When `expected_version` is set and does not match, fails with
    /// [`CoreError::VersionConflict`].
    async fn update(
        &self,
        link: &str,
        expected_version: Option<u64>,
        body: Value,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<Document, CoreError>;

    /// Delete a document. Returns whether it existed.
    async fn delete(&self, link: &str) -> Result<bool, CoreError>;

    /// Documents of `kind` whose top-level `field` equals `value`.
    async fn query_by_field(
        &self,
        kind: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Document>, CoreError>;

    /// All documents of `kind`.
    async fn list_kind(&self, kind: &str) -> Result<Vec<Document>, CoreError>;

    /// Links of documents whose expiration is at or before `now`.
    async fn expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, CoreError>;

    /// Subscribe to changes of a single document.
    fn subscribe(&self, link: &str) -> broadcast::Receiver<DocumentChange>;
}
