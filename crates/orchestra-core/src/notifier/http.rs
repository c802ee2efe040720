// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP notifier backed by reqwest.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{Notifier, SIGNATURE_HEADER, sign};
use crate::error::CoreError;

/// POSTs deliveries over HTTP, optionally signing the body.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    signing_key: Option<String>,
}

impl HttpNotifier {
    /// Create a notifier with the given request timeout.
    pub fn new(timeout: Duration) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::DeliveryFailed {
                target: "http client".to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            signing_key: None,
        })
    }

    /// Sign every body with HMAC-SHA256 under `key`.
    pub fn with_signing_key(mut self, key: Option<String>) -> Self {
        self.signing_key = key;
        self
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn post(&self, url: &str, body: &Value) -> Result<(), CoreError> {
        let payload = serde_json::to_vec(body)?;
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(key) = &self.signing_key {
            request = request.header(SIGNATURE_HEADER, sign(key, &payload)?);
        }

        let response = request
            .body(payload)
            .send()
            .await
            .map_err(|e| CoreError::DeliveryFailed {
                target: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        debug!(url = %url, status = status.as_u16(), "External delivery answered");
        if status.is_success() {
            Ok(())
        } else {
            Err(CoreError::DeliveryFailed {
                target: url.to_string(),
                reason: format!("HTTP {}", status.as_u16()),
            })
        }
    }
}
