// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Extensibility checkpoints.
//!
//! External subscribers register interest in a (task kind, stage, substage)
//! checkpoint. When a task reaches a subscribed checkpoint, the task state
//! machine hands the transition to an [`Extensibility`] capability instead of
//! running its hook:
//!
//! ```text
//!   async:     notify subscriber ──► hook runs immediately
//!
//!   blocking:  create callback record (BLOCKED, due = now + ttl)
//!              notify subscriber ──► task idles
//!                    │
//!        subscriber POSTs resume          due time elapses
//!                    │                          │
//!                 RESUME ──► PATCH task      DONE + timeout failure
//!                    │       (reply payload)    │
//!                  DONE                    PATCH task FAILED
//! ```
//!
//! Each checkpoint fires once per task: the task stamps the checkpoint key
//! into its custom properties before notifying.

pub mod callback;
pub mod gate;
pub mod registry;

pub use self::callback::{CallbackStatus, ExtensibilityCallbackService, ExtensibilityCallbackState};
pub use self::gate::ExtensibilityGate;
pub use self::registry::SubscriptionRegistry;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::host::Host;
use crate::task::TaskStage;

/// Address under which subscriptions are stored.
pub const SUBSCRIPTIONS_LINK: &str = "/extensibility-subscriptions";

/// Marker record touched whenever a subscription changes.
pub const LAST_UPDATED_LINK: &str = "/extensibility-subscriptions-last-updated";

/// Address under which blocking callback records live.
pub const CALLBACKS_LINK: &str = "/extensibility-callbacks";

/// Document kind of subscription records.
pub const SUBSCRIPTION_KIND: &str = "extensibility-subscription";

/// Custom property suffix overriding a topic's blocking timeout (seconds).
pub const TOPIC_TIMEOUT_SUFFIX: &str = ".timeout";

/// Deterministic key of a checkpoint: `kind:STAGE:SUBSTAGE`.
pub fn checkpoint_key(task_kind: &str, stage: TaskStage, sub_stage: &str) -> String {
    format!("{}:{}:{}", task_kind, stage, sub_stage)
}

/// Address of the subscription record for a checkpoint key.
pub fn subscription_link(key: &str) -> String {
    format!("{}/{}", SUBSCRIPTIONS_LINK, key)
}

/// A subscriber's interest in one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensibilitySubscription {
    /// Task kind.
    pub task: String,
    /// Stage of the checkpoint.
    pub stage: TaskStage,
    /// Substage wire name of the checkpoint.
    pub sub_stage: String,
    /// Where notifications go: an absolute URL or an internal link.
    pub callback_reference: String,
    /// Whether the task waits for a resume.
    #[serde(default)]
    pub blocking: bool,
    /// Event topic, used to look up a per-topic timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
}

impl ExtensibilitySubscription {
    /// Checkpoint key of this subscription.
    pub fn key(&self) -> String {
        checkpoint_key(&self.task, self.stage, &self.sub_stage)
    }
}

/// A task transition intercepted at a subscribed checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Checkpoint key already stamped on the task.
    pub key: String,
    /// The matching subscription.
    pub subscription: ExtensibilitySubscription,
    /// Address of the task.
    pub task_link: String,
    /// Task kind.
    pub task_kind: String,
    /// Stage the task is at.
    pub stage: TaskStage,
    /// Substage wire name the task is at.
    pub sub_stage: String,
    /// Substage wire name the task uses for failures.
    pub error_sub_stage: String,
    /// Full serialized task state.
    pub task_state: Value,
    /// Projection sent to the subscriber.
    pub notification_payload: Value,
    /// Shape the subscriber may amend and send back on resume.
    pub reply_payload: Value,
    /// Task custom properties.
    pub custom_properties: HashMap<String, String>,
    /// Task tenancy.
    pub tenant_links: Option<Vec<String>>,
    /// Task request tracker.
    pub request_tracker_link: Option<String>,
    /// Locale of the task's caller.
    pub locale: Option<String>,
}

/// What the task does after interception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Run the stage hook now.
    Continue,
    /// Do nothing; a resume PATCH will re-enter the task later.
    Suspended,
}

/// Capability injected into task factories that support checkpoints.
#[async_trait]
pub trait Extensibility: Send + Sync {
    /// Subscription for a checkpoint, if any.
    fn subscription(
        &self,
        task_kind: &str,
        stage: TaskStage,
        sub_stage: &str,
    ) -> Option<ExtensibilitySubscription>;

    /// Notify the subscriber and decide whether the task continues.
    async fn intercept(&self, host: &Host, checkpoint: Checkpoint) -> GateOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checkpoint_key_and_link() {
        let key = checkpoint_key("ProvisionTask", TaskStage::Started, "ALLOCATING");
        assert_eq!(key, "ProvisionTask:STARTED:ALLOCATING");
        assert_eq!(
            subscription_link(&key),
            "/extensibility-subscriptions/ProvisionTask:STARTED:ALLOCATING"
        );
    }

    #[test]
    fn test_subscription_wire_shape() {
        let subscription: ExtensibilitySubscription = serde_json::from_value(json!({
            "task": "ProvisionTask",
            "stage": "STARTED",
            "subStage": "ALLOCATING",
            "callbackReference": "https://hooks.test/provision"
        }))
        .unwrap();
        assert!(!subscription.blocking);
        assert!(subscription.topic_id.is_none());
        assert_eq!(subscription.key(), "ProvisionTask:STARTED:ALLOCATING");
    }
}
