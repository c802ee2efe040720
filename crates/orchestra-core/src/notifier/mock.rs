// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock notifier for testing.
//!
//! Records every delivery and can be told to fail.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::Notifier;
use crate::error::CoreError;

/// One recorded delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Target URL.
    pub url: String,
    /// Delivered body.
    pub body: Value,
    /// Whether the attempt was answered with success.
    pub succeeded: bool,
}

/// Mock notifier for testing.
#[derive(Debug, Clone, Default)]
pub struct MockNotifier {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
    fail_all: Arc<AtomicBool>,
    fail_next: Arc<AtomicU32>,
}

impl MockNotifier {
    /// Create a notifier that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a notifier that rejects everything.
    pub fn failing() -> Self {
        let notifier = Self::default();
        notifier.fail_all.store(true, Ordering::SeqCst);
        notifier
    }

    /// Reject the next `count` attempts.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Every attempt so far, in order.
    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().await.clone()
    }

    /// Attempts addressed to `url`.
    pub async fn deliveries_to(&self, url: &str) -> Vec<Delivery> {
        self.deliveries
            .lock()
            .await
            .iter()
            .filter(|d| d.url == url)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn post(&self, url: &str, body: &Value) -> Result<(), CoreError> {
        let forced = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let fail = forced || self.fail_all.load(Ordering::SeqCst);

        self.deliveries.lock().await.push(Delivery {
            url: url.to_string(),
            body: body.clone(),
            succeeded: !fail,
        });

        if fail {
            Err(CoreError::DeliveryFailed {
                target: url.to_string(),
                reason: "mock delivery failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_records_deliveries() {
        let notifier = MockNotifier::new();
        notifier.post("http://a.test", &json!({"n": 1})).await.unwrap();
        notifier.post("http://b.test", &json!({"n": 2})).await.unwrap();

        assert_eq!(notifier.deliveries().await.len(), 2);
        let to_a = notifier.deliveries_to("http://a.test").await;
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0].body, json!({"n": 1}));
        assert!(to_a[0].succeeded);
    }

    #[tokio::test]
    async fn test_fail_next_then_recover() {
        let notifier = MockNotifier::new();
        notifier.fail_next(2);

        assert!(notifier.post("http://a.test", &Value::Null).await.is_err());
        assert!(notifier.post("http://a.test", &Value::Null).await.is_err());
        assert!(notifier.post("http://a.test", &Value::Null).await.is_ok());

        let outcomes: Vec<bool> = notifier
            .deliveries()
            .await
            .iter()
            .map(|d| d.succeeded)
            .collect();
        assert_eq!(outcomes, vec![false, false, true]);
    }

    #[tokio::test]
    async fn test_failing_rejects_everything() {
        let notifier = MockNotifier::failing();
        assert!(notifier.post("http://a.test", &Value::Null).await.is_err());
        assert!(notifier.post("http://a.test", &Value::Null).await.is_err());
    }
}
