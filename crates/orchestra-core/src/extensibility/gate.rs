// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interception of subscribed checkpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::callback::{ExtensibilityCallbackService, ExtensibilityCallbackState};
use super::{
    CALLBACKS_LINK, Checkpoint, Extensibility, ExtensibilitySubscription, GateOutcome,
    SubscriptionRegistry, TOPIC_TIMEOUT_SUFFIX,
};
use crate::config::Config;
use crate::error::{CoreError, ErrorResponse};
use crate::host::{ACCEPT_LANGUAGE, Action, Host, Operation, deadline_after};
use crate::notifier::is_external;
use crate::task::{CallbackResponse, TaskCallback, TaskInfo, TaskStage};

/// [`Extensibility`] backed by the subscription registry.
#[derive(Debug, Clone)]
pub struct ExtensibilityGate {
    registry: Arc<SubscriptionRegistry>,
}

impl ExtensibilityGate {
    /// Gate answering lookups from `registry`.
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    /// The registry.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    async fn block(&self, host: &Host, checkpoint: Checkpoint, payload: Value) -> GateOutcome {
        let target = checkpoint.subscription.callback_reference.clone();
        let timeout = blocking_timeout(
            host.config(),
            &checkpoint.subscription,
            &checkpoint.custom_properties,
        );

        let callback = match TaskCallback::with_sub_stage_names(
            checkpoint.task_link.clone(),
            checkpoint.stage,
            Some(checkpoint.sub_stage.clone()),
            TaskStage::Failed,
            Some(checkpoint.error_sub_stage.clone()),
        ) {
            Ok(callback) => callback,
            Err(e) => {
                warn!(task = %checkpoint.task_link, error = %e, "Cannot block checkpoint");
                return GateOutcome::Continue;
            }
        };

        let record_link = format!("{}/{}", CALLBACKS_LINK, Uuid::new_v4());
        let record = ExtensibilityCallbackState {
            due: Some(deadline_after(timeout)),
            task_state_json: checkpoint.task_state.clone(),
            task_state_class_name: checkpoint.task_kind.clone(),
            service_task_callback: callback,
            reply_payload: checkpoint.reply_payload.clone(),
            custom_properties: Some(checkpoint.custom_properties.clone()),
            request_tracker_link: checkpoint.request_tracker_link.clone(),
            tenant_links: checkpoint.tenant_links.clone(),
            locale: checkpoint.locale.clone(),
            ..Default::default()
        };

        let created = match serde_json::to_value(&record) {
            Ok(body) => {
                host.start_service(
                    record_link.clone(),
                    Box::new(ExtensibilityCallbackService::new()),
                    body,
                )
                .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = created {
            error!(task = %checkpoint.task_link, error = %e, "Failed to create checkpoint callback");
            fail_task(host, &checkpoint, &e);
            return GateOutcome::Suspended;
        }

        let service_callback = if is_external(&target) {
            host.config().absolute_uri(&record_link)
        } else {
            record_link.clone()
        };
        let envelope = json!({
            "serviceCallback": service_callback,
            "taskStateClassName": checkpoint.task_kind,
            "notificationPayload": payload,
            "replyPayload": checkpoint.reply_payload,
            "tenantLinks": checkpoint.tenant_links,
        });

        info!(
            task = %checkpoint.task_link,
            checkpoint = %checkpoint.key,
            record = %record_link,
            timeout_secs = timeout.as_secs(),
            "Task blocked on checkpoint"
        );
        spawn_notify(host.clone(), target, envelope, checkpoint);
        GateOutcome::Suspended
    }
}

#[async_trait]
impl Extensibility for ExtensibilityGate {
    fn subscription(
        &self,
        task_kind: &str,
        stage: TaskStage,
        sub_stage: &str,
    ) -> Option<ExtensibilitySubscription> {
        self.registry.lookup(task_kind, stage, sub_stage)
    }

    async fn intercept(&self, host: &Host, checkpoint: Checkpoint) -> GateOutcome {
        let mut payload = checkpoint.notification_payload.clone();
        strip_system_properties(&mut payload);

        if checkpoint.subscription.blocking {
            return self.block(host, checkpoint, payload).await;
        }

        debug!(task = %checkpoint.task_link, checkpoint = %checkpoint.key, "Notifying subscriber");
        let target = checkpoint.subscription.callback_reference.clone();
        spawn_notify(host.clone(), target, payload, checkpoint);
        GateOutcome::Continue
    }
}

/// Time a blocking checkpoint waits: the task's `<topic>.timeout` custom
/// property (seconds), then the configured topic timeout, then the default.
pub fn blocking_timeout(
    config: &Config,
    subscription: &ExtensibilitySubscription,
    custom_properties: &HashMap<String, String>,
) -> Duration {
    let Some(topic) = subscription.topic_id.as_deref() else {
        return config.extensibility_timeout;
    };
    custom_properties
        .get(&format!("{}{}", topic, TOPIC_TIMEOUT_SUFFIX))
        .and_then(|secs| secs.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .or_else(|| config.topic_timeouts.get(topic).copied())
        .unwrap_or(config.extensibility_timeout)
}

/// Drop custom properties whose key starts with `_`.
pub fn strip_system_properties(payload: &mut Value) {
    if let Some(Value::Object(props)) = payload.get_mut("customProperties") {
        props.retain(|key, _| !key.starts_with('_'));
    }
}

/// POST the notification, retrying; the task fails once attempts run out.
fn spawn_notify(host: Host, target: String, body: Value, checkpoint: Checkpoint) {
    let attempts = host.config().notification_retry_count.max(1);
    let wait = host.config().notification_retry_wait;
    let headers: HashMap<String, String> = checkpoint
        .locale
        .iter()
        .map(|locale| (ACCEPT_LANGUAGE.to_string(), locale.clone()))
        .collect();

    tokio::spawn(async move {
        let mut last_error = None;
        for attempt in 0..attempts {
            match host
                .deliver(Action::Post, &target, body.clone(), &headers)
                .await
            {
                Ok(()) => {
                    debug!(subscriber = %target, checkpoint = %checkpoint.key, "Subscriber notified");
                    return;
                }
                Err(e) => {
                    warn!(subscriber = %target, attempt = attempt + 1, error = %e, "Subscriber notification failed");
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        error!(subscriber = %target, task = %checkpoint.task_link, attempts, "Subscriber notification not delivered");
        if checkpoint.stage.is_terminal() {
            return;
        }
        let error = last_error.unwrap_or_else(|| CoreError::DeliveryFailed {
            target: target.clone(),
            reason: "no attempt made".to_string(),
        });
        fail_task(&host, &checkpoint, &error);
    });
}

/// PATCH the task to FAILED on its error substage. Not awaited: the caller
/// may be running inside the task's own actor.
fn fail_task(host: &Host, checkpoint: &Checkpoint, cause: &CoreError) {
    let response = CallbackResponse {
        task_info: TaskInfo::failed(
            ErrorResponse::from_error(cause).with_locale(checkpoint.locale.clone()),
        ),
        task_sub_stage: Some(checkpoint.error_sub_stage.clone()),
        custom_properties: None,
    };
    match serde_json::to_value(&response) {
        Ok(body) => host.spawn_send(Operation::patch(checkpoint.task_link.clone(), body)),
        Err(e) => error!(task = %checkpoint.task_link, error = %e, "Failed to encode task failure"),
    }
}
