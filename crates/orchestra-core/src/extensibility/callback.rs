// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Callback record of a blocking checkpoint.
//!
//! The record is created BLOCKED with a due time. The subscriber resumes the
//! task by POSTing to the record; the record then delivers the reply payload
//! to the task and moves to DONE. If the due time passes first, the record
//! moves to DONE and fails the task instead. Whichever happens first wins:
//! the loser finds the record no longer BLOCKED.
//!
//! | From | To | Trigger |
//! |------|----|---------|
//! | BLOCKED | RESUME | subscriber POST |
//! | RESUME | DONE | resume delivered to the task |
//! | BLOCKED | DONE | due time elapsed |

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{CoreError, ErrorResponse, Result};
use crate::host::{
    ACCEPT_LANGUAGE, Action, Host, Operation, Request, Service, ServiceContext, deadline_after,
};
use crate::task::merge::additive_map;
use crate::task::{TaskCallback, Transition};

/// Document kind of callback records.
pub const CALLBACK_KIND: &str = "extensibility-callback";

/// Status of a blocking checkpoint. Ordered; only moves forward.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackStatus {
    /// Waiting for the subscriber.
    #[default]
    Blocked,
    /// Subscriber answered; delivering to the task.
    Resume,
    /// Processed.
    Done,
}

/// Persisted callback record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensibilityCallbackState {
    /// Address of the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_self_link: Option<String>,
    /// Store version.
    #[serde(default)]
    pub document_version: u64,
    /// When the store deletes the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_expiration: Option<DateTime<Utc>>,
    /// Where the checkpoint stands.
    #[serde(default)]
    pub status: CallbackStatus,
    /// Resume delivery attempts so far.
    #[serde(default)]
    pub retry_counter: u32,
    /// When the checkpoint times out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<DateTime<Utc>>,
    /// Task state at interception time.
    #[serde(default)]
    pub task_state_json: Value,
    /// Kind of the intercepted task.
    #[serde(default)]
    pub task_state_class_name: String,
    /// Task to resume, with the stage/substage to resume it on and the
    /// stage/substage to fail it with.
    #[serde(default)]
    pub service_task_callback: TaskCallback,
    /// Body sent back to the task on resume.
    #[serde(default)]
    pub reply_payload: Value,
    /// Custom properties returned to the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_properties: Option<HashMap<String, String>>,
    /// Request tracker of the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_tracker_link: Option<String>,
    /// Tenancy of the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_links: Option<Vec<String>>,
    /// Locale of the task's caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    /// Set when the checkpoint timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ErrorResponse>,
}

/// Body of a POST (resume) or PATCH to a callback record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackUpdate {
    /// Requested status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CallbackStatus>,
    /// Resume attempt counter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_counter: Option<u32>,
    /// Must match the stored callback address when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_task_callback: Option<TaskCallback>,
    /// Fields merged into the stored reply payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_payload: Option<Value>,
    /// Custom properties merged into the stored ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_properties: Option<HashMap<String, String>>,
}

impl CallbackUpdate {
    fn is_status_only(&self) -> bool {
        self.retry_counter.is_none()
            && self.service_task_callback.is_none()
            && self.reply_payload.is_none()
            && self.custom_properties.is_none()
    }
}

impl ExtensibilityCallbackState {
    /// Check an update against the stored record.
    pub fn validate(&self, update: &CallbackUpdate) -> Result<Transition> {
        let link = self.document_self_link.clone().unwrap_or_default();

        if self.status == CallbackStatus::Done {
            if update.status == Some(CallbackStatus::Done) && update.is_status_only() {
                return Ok(Transition::Absorb);
            }
            return Err(CoreError::Conflict {
                link,
                message: "Notification has already been processed.".to_string(),
            });
        }

        if let Some(callback) = &update.service_task_callback {
            if callback.address() != self.service_task_callback.address() {
                return Err(CoreError::validation(
                    "serviceTaskCallback",
                    "Set callback address is not allowed",
                ));
            }
        }

        if let Some(retry_counter) = update.retry_counter {
            if retry_counter < self.retry_counter && update.status != Some(CallbackStatus::Done) {
                return Err(CoreError::validation(
                    "retryCounter",
                    "Decrease retry counter is not allowed",
                ));
            }
        }

        if let Some(status) = update.status {
            if status < self.status {
                return Err(CoreError::validation(
                    "status",
                    format!("status can not move backwards from {:?} to {:?}", self.status, status),
                ));
            }
        }

        Ok(Transition::Apply)
    }

    /// Copy of the record with `update` applied.
    fn merged(&self, update: CallbackUpdate) -> Self {
        let mut next = self.clone();
        if let Some(status) = update.status {
            next.status = status;
        }
        if let Some(retry_counter) = update.retry_counter {
            next.retry_counter = next.retry_counter.max(retry_counter);
        }
        if let Some(reply) = update.reply_payload {
            merge_reply_payload(&mut next, reply);
        }
        additive_map(&mut next.custom_properties, update.custom_properties);
        next
    }

    /// PATCH body that resumes the task.
    pub fn resume_body(&self) -> Value {
        let response = self
            .service_task_callback
            .success_response()
            .with_custom_properties(self.custom_properties.clone());
        let mut body = match &self.reply_payload {
            Value::Object(fields) => fields.clone(),
            _ => serde_json::Map::new(),
        };
        if let Ok(Value::Object(fields)) = serde_json::to_value(&response) {
            body.extend(fields);
        }
        Value::Object(body)
    }
}

/// Shallow-merge `reply` into the stored payload. Custom properties found in
/// the reply also join the record's custom properties.
fn merge_reply_payload(state: &mut ExtensibilityCallbackState, reply: Value) {
    let Value::Object(fields) = reply else {
        return;
    };
    if let Some(Value::Object(props)) = fields.get("customProperties") {
        let props = props
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect();
        additive_map(&mut state.custom_properties, Some(props));
    }
    match &mut state.reply_payload {
        Value::Object(stored) => stored.extend(fields),
        stored => *stored = Value::Object(fields),
    }
}

/// The callback record actor.
#[derive(Debug, Default)]
pub struct ExtensibilityCallbackService {
    state: ExtensibilityCallbackState,
}

impl ExtensibilityCallbackService {
    /// Service for a record that has not been created yet.
    pub fn new() -> Self {
        Self::default()
    }

    fn headers(&self) -> HashMap<String, String> {
        self.state
            .locale
            .iter()
            .map(|locale| (ACCEPT_LANGUAGE.to_string(), locale.clone()))
            .collect()
    }

    async fn persist(
        &mut self,
        ctx: &ServiceContext,
        mut next: ExtensibilityCallbackState,
    ) -> Result<()> {
        if next.status == CallbackStatus::Done && self.state.status != CallbackStatus::Done {
            next.document_expiration =
                Some(deadline_after(ctx.config().processed_notification_expiry));
        }
        let expected = self.state.document_version;
        next.document_version = expected + 1;
        let doc = ctx
            .update_document(expected, serde_json::to_value(&next)?, next.document_expiration)
            .await?;
        next.document_version = doc.version;
        self.state = next;
        Ok(())
    }
}

#[async_trait]
impl Service for ExtensibilityCallbackService {
    fn kind(&self) -> &'static str {
        CALLBACK_KIND
    }

    fn document(&self) -> Value {
        serde_json::to_value(&self.state).unwrap_or(Value::Null)
    }

    async fn handle_create(&mut self, ctx: &ServiceContext, op: &Operation) -> Result<()> {
        let mut state: ExtensibilityCallbackState = op.body_as()?;
        if state.service_task_callback.is_empty() {
            return Err(CoreError::validation(
                "serviceTaskCallback",
                "a callback record needs a task to resume",
            ));
        }

        state.document_self_link = Some(ctx.link().to_string());
        state.document_version = 0;
        state.status = CallbackStatus::Blocked;
        state.retry_counter = 0;
        let due = *state
            .due
            .get_or_insert_with(|| deadline_after(ctx.config().extensibility_timeout));
        // Reaped eventually even if the timer is lost with the process
        let grace = chrono::Duration::from_std(ctx.config().processed_notification_expiry)
            .unwrap_or_else(|_| chrono::Duration::zero());
        state.document_expiration = Some(due.checked_add_signed(grace).unwrap_or(due));

        let doc = ctx
            .create_document(CALLBACK_KIND, serde_json::to_value(&state)?, state.document_expiration)
            .await?;
        state.document_version = doc.version;
        self.state = state;
        Ok(())
    }

    async fn handle_start(&mut self, ctx: &ServiceContext, request: Request) {
        let delay = self
            .state
            .due
            .and_then(|due| (due - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO);
        ctx.schedule_timer(delay);

        debug!(link = %ctx.link(), due = ?self.state.due, "Checkpoint blocked");
        request.responder.complete(self.document());
    }

    #[instrument(skip_all, fields(link = %ctx.link()))]
    async fn handle_post(&mut self, ctx: &ServiceContext, request: Request) {
        let Request { op, responder } = request;
        let mut update: CallbackUpdate = match op.body_as() {
            Ok(update) => update,
            Err(e) => {
                responder.fail(e);
                return;
            }
        };
        // A POST is a resume; only a processed record keeps the sent status
        if self.state.status != CallbackStatus::Done {
            update.status = Some(CallbackStatus::Resume);
        }

        match self.state.validate(&update) {
            Ok(Transition::Apply) => {}
            Ok(Transition::Absorb) => {
                responder.complete(self.document());
                return;
            }
            Err(e) => {
                warn!(error = %e, "Resume rejected");
                responder.fail(e);
                return;
            }
        }

        let already_resuming = self.state.status == CallbackStatus::Resume;
        let next = self.state.merged(update);
        if let Err(e) = self.persist(ctx, next).await {
            responder.fail(e);
            return;
        }
        responder.complete(self.document());

        if !already_resuming {
            info!(task = ?self.state.service_task_callback.address(), "Checkpoint resumed");
            spawn_resume(ctx.host().clone(), ctx.link().to_string(), &self.state, self.headers());
        }
    }

    #[instrument(skip_all, fields(link = %ctx.link()))]
    async fn handle_patch(&mut self, ctx: &ServiceContext, request: Request) {
        let update: CallbackUpdate = match request.op.body_as() {
            Ok(update) => update,
            Err(e) => {
                request.responder.fail(e);
                return;
            }
        };
        match self.state.validate(&update) {
            Ok(Transition::Apply) => {}
            Ok(Transition::Absorb) => {
                request.responder.complete(self.document());
                return;
            }
            Err(e) => {
                request.responder.fail(e);
                return;
            }
        }
        let next = self.state.merged(update);
        match self.persist(ctx, next).await {
            Ok(()) => request.responder.complete(self.document()),
            Err(e) => request.responder.fail(e),
        }
    }

    /// The due time elapsed: fail the task unless it was resumed first.
    async fn handle_timer(&mut self, ctx: &ServiceContext) {
        if self.state.status != CallbackStatus::Blocked {
            debug!(link = %ctx.link(), status = ?self.state.status, "Timeout after resume, ignored");
            return;
        }

        let failure = ErrorResponse::from_message(format!(
            "Extensibility checkpoint of {} timed out",
            self.state.task_state_class_name
        ))
        .with_locale(self.state.locale.clone());
        let mut next = self.state.clone();
        next.status = CallbackStatus::Done;
        next.failure = Some(failure.clone());
        if let Err(e) = self.persist(ctx, next).await {
            error!(link = %ctx.link(), error = %e, "Failed to record checkpoint timeout");
            return;
        }

        let callback = &self.state.service_task_callback;
        let Some(task) = callback.address().map(str::to_string) else {
            return;
        };
        warn!(link = %ctx.link(), task = %task, "Extensibility checkpoint timed out");
        match serde_json::to_value(callback.failure_response(failure)) {
            Ok(body) => {
                if let Err(e) = ctx
                    .host()
                    .deliver(Action::Patch, &task, body, &self.headers())
                    .await
                {
                    error!(task = %task, error = %e, "Failed to fail timed out task");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode timeout response"),
        }
    }
}

/// Deliver the resume to the task, bumping the record's retry counter before
/// each attempt and marking it DONE on success.
fn spawn_resume(
    host: Host,
    record: String,
    state: &ExtensibilityCallbackState,
    headers: HashMap<String, String>,
) {
    let Some(task) = state.service_task_callback.address().map(str::to_string) else {
        return;
    };
    let body = state.resume_body();
    let first_attempt = state.retry_counter + 1;
    let attempts = host.config().resume_retry_count.max(1);
    let wait = host.config().resume_retry_wait;

    tokio::spawn(async move {
        for attempt in 0..attempts {
            let counter = json!({ "retryCounter": first_attempt + attempt });
            if let Err(e) = host.send(Operation::patch(record.clone(), counter)).await {
                warn!(record = %record, error = %e, "Failed to record resume attempt");
            }

            match host
                .deliver(Action::Patch, &task, body.clone(), &headers)
                .await
            {
                Ok(()) => {
                    let done = json!({ "status": CallbackStatus::Done });
                    if let Err(e) = host.send(Operation::patch(record.clone(), done)).await {
                        warn!(record = %record, error = %e, "Failed to mark checkpoint done");
                    }
                    return;
                }
                Err(e) => {
                    warn!(record = %record, task = %task, attempt = attempt + 1, error = %e, "Resume delivery failed");
                    if attempt + 1 < attempts {
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }
        error!(record = %record, task = %task, attempts, "Resume not delivered, checkpoint stays in RESUME");
    });
}
