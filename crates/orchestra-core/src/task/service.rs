// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The generic task state machine.
//!
//! A task kind supplies a [`TaskHandler`]; [`TaskService`] runs it inside a
//! document actor and takes care of everything shared by all kinds:
//!
//! | Concern | Where |
//! |---------|-------|
//! | create-time defaults and validation | `handle_create` |
//! | CREATED → STARTED promotion | `handle_start` |
//! | transition rules, merge, persistence | `handle_patch` |
//! | request tracker updates | `update_request_tracker` |
//! | extensibility checkpoints | `prepare_checkpoint`, `handle_stage_patch` |
//! | parent notification | `notify_caller` |
//! | self-delete and expiry notification | `handle_stage_patch`, `handle_delete` |
//!
//! Kinds drive their own progress through a [`TaskControl`], which only ever
//! sends PATCHes to the task's own address. All stage changes therefore go
//! through the same validation path whether they come from the kind itself,
//! a child's callback, or an extensibility resume.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use super::transition::{self, Transition};
use super::{SubStage, TASK_KIND, TaskBody, TaskCallback, TaskInfo, TaskStage, TaskState, TaskStatus};
use crate::counter::CounterSubTask;
use crate::error::{CoreError, ErrorResponse, Result};
use crate::extensibility::{
    Checkpoint, Extensibility, ExtensibilitySubscription, GateOutcome, checkpoint_key,
};
use crate::host::{
    ACCEPT_LANGUAGE, Action, Host, Operation, Request, Service, ServiceContext, ServiceFactory,
    child_link, deadline_after,
};

/// Task document type of a handler.
pub type StateOf<H> = TaskState<<H as TaskHandler>::SubStage, <H as TaskHandler>::Body>;

/// Behavior of one task kind.
///
/// Only [`handle_started_stage`](TaskHandler::handle_started_stage) is
/// required; every other hook has a default.
#[async_trait]
pub trait TaskHandler: Send + Sync + Sized + 'static {
    /// Ordered substages of this kind.
    type SubStage: SubStage;
    /// Kind-specific document fields.
    type Body: TaskBody;

    /// Kind name, used in checkpoint keys and logs.
    const KIND: &'static str;

    /// Name reported to the request tracker.
    fn display_name(&self) -> &str {
        Self::KIND
    }

    /// Extra validation of the initial state. An error rejects the create.
    fn validate_new_state(&self, _state: &StateOf<Self>) -> Result<()> {
        Ok(())
    }

    /// Extra validation and merging of an accepted patch, applied after the
    /// common fields were merged. An error rejects the patch.
    fn validate_and_merge(&self, _patch: &StateOf<Self>, _state: &mut StateOf<Self>) -> Result<()> {
        Ok(())
    }

    /// Runs whenever the task enters CREATED or STARTED (on any substage).
    async fn handle_started_stage(&self, task: &TaskControl<Self>, state: &StateOf<Self>);

    /// Opt a task out of extensibility checkpoints.
    fn skip_extensibility(&self, _state: &StateOf<Self>) -> bool {
        false
    }

    /// Projection of the task sent to extensibility subscribers.
    fn notification_payload(&self, state: &StateOf<Self>) -> Value {
        default_notification_payload(state)
    }

    /// Shape a blocking subscriber may amend and send back on resume.
    fn reply_payload(&self, state: &StateOf<Self>) -> Value {
        json!({ "customProperties": state.custom_properties })
    }
}

/// Default subscriber projection: address, stage, substage, custom
/// properties and tenancy.
pub fn default_notification_payload<S: SubStage, B: TaskBody>(state: &TaskState<S, B>) -> Value {
    json!({
        "documentSelfLink": state.document_self_link,
        "taskInfo": state.task_info,
        "taskSubStage": state.task_sub_stage,
        "customProperties": state.custom_properties,
        "tenantLinks": state.tenant_links,
    })
}

/// Per-factory task behavior switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskOptions {
    /// Delete the task once it reaches FINISHED, FAILED or CANCELLED.
    pub self_delete: bool,
}

/// Level at which [`TaskControl::fail_task_with`] logs the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureLog {
    /// `warn!`
    #[default]
    Warning,
    /// `info!`, for expected failures.
    Info,
}

// ============================================================================
// Factory
// ============================================================================

/// Creates [`TaskService`]s for POSTs to a factory link.
pub struct TaskFactory<H: TaskHandler> {
    handler: Arc<H>,
    options: TaskOptions,
    extensibility: Option<Arc<dyn Extensibility>>,
}

impl<H: TaskHandler> fmt::Debug for TaskFactory<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFactory")
            .field("kind", &H::KIND)
            .field("options", &self.options)
            .field("extensibility", &self.extensibility.is_some())
            .finish()
    }
}

impl<H: TaskHandler> TaskFactory<H> {
    /// Factory for `handler` with default options and no checkpoints.
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            options: TaskOptions::default(),
            extensibility: None,
        }
    }

    /// Delete tasks once they reach a terminal stage.
    pub fn self_delete(mut self) -> Self {
        self.options.self_delete = true;
        self
    }

    /// Enable extensibility checkpoints.
    pub fn with_extensibility(mut self, extensibility: Option<Arc<dyn Extensibility>>) -> Self {
        self.extensibility = extensibility;
        self
    }
}

impl<H: TaskHandler> ServiceFactory for TaskFactory<H> {
    fn create_service(
        &self,
        factory_link: &str,
        op: &Operation,
    ) -> Result<(String, Box<dyn Service>)> {
        let link = child_link(factory_link, op)?;
        let service = TaskService::new(
            Arc::clone(&self.handler),
            self.options,
            self.extensibility.clone(),
        );
        Ok((link, Box::new(service)))
    }
}

// ============================================================================
// Service
// ============================================================================

/// Document actor running one task.
pub struct TaskService<H: TaskHandler> {
    handler: Arc<H>,
    options: TaskOptions,
    extensibility: Option<Arc<dyn Extensibility>>,
    state: StateOf<H>,
    locale: Option<String>,
}

/// A checkpoint stamped on the task and awaiting interception.
struct PendingCheckpoint {
    key: String,
    subscription: ExtensibilitySubscription,
}

impl<H: TaskHandler> TaskService<H> {
    /// Service for a task that has not been created yet.
    pub fn new(
        handler: Arc<H>,
        options: TaskOptions,
        extensibility: Option<Arc<dyn Extensibility>>,
    ) -> Self {
        Self {
            handler,
            options,
            extensibility,
            state: TaskState::default(),
            locale: None,
        }
    }

    fn control(&self, ctx: &ServiceContext) -> TaskControl<H> {
        TaskControl::new(ctx.host().clone(), ctx.link(), self.locale.clone())
    }

    fn locale_headers(&self) -> HashMap<String, String> {
        self.locale
            .iter()
            .map(|locale| (ACCEPT_LANGUAGE.to_string(), locale.clone()))
            .collect()
    }

    /// Write `candidate` through to the store and make it current.
    async fn persist(&mut self, ctx: &ServiceContext, mut candidate: StateOf<H>) -> Result<()> {
        let expected = self.state.document_version;
        candidate.document_version = expected + 1;
        let body = serde_json::to_value(&candidate)?;
        let doc = ctx
            .update_document(expected, body, candidate.document_expiration)
            .await?;
        candidate.document_version = doc.version;
        self.state = candidate;
        Ok(())
    }

    /// Stamp the checkpoint key on `candidate` when the new stage/substage is
    /// subscribed and has not been notified yet.
    fn prepare_checkpoint(&self, candidate: &mut StateOf<H>) -> Option<PendingCheckpoint> {
        let gate = self.extensibility.as_ref()?;
        let stage = candidate.stage()?;
        let sub_stage = candidate.task_sub_stage?;
        let subscription = gate.subscription(H::KIND, stage, sub_stage.name())?;

        let key = checkpoint_key(H::KIND, stage, sub_stage.name());
        if candidate.custom_property(&key).is_some() {
            debug!(key = %key, "Checkpoint already notified");
            return None;
        }
        if self.handler.skip_extensibility(candidate) {
            return None;
        }

        candidate.set_custom_property(key.clone(), chrono::Utc::now().to_rfc3339());
        Some(PendingCheckpoint { key, subscription })
    }

    fn checkpoint(&self, ctx: &ServiceContext, pending: PendingCheckpoint) -> Checkpoint {
        let sub_stage = self.state.task_sub_stage.unwrap_or(H::SubStage::CREATED);
        Checkpoint {
            key: pending.key,
            subscription: pending.subscription,
            task_link: ctx.link().to_string(),
            task_kind: H::KIND.to_string(),
            stage: self.state.stage().unwrap_or(TaskStage::Created),
            sub_stage: sub_stage.name().to_string(),
            error_sub_stage: H::SubStage::ERROR.name().to_string(),
            task_state: self.document(),
            notification_payload: self.handler.notification_payload(&self.state),
            reply_payload: self.handler.reply_payload(&self.state),
            custom_properties: self.state.custom_properties.clone().unwrap_or_default(),
            tenant_links: self.state.tenant_links.clone(),
            request_tracker_link: self.state.request_tracker_link.clone(),
            locale: self.locale.clone(),
        }
    }

    /// Run whatever the current stage calls for, after the triggering
    /// operation has been answered.
    async fn handle_stage_patch(&self, ctx: &ServiceContext, pending: Option<PendingCheckpoint>) {
        let Some(stage) = self.state.stage() else {
            return;
        };
        // Decided before the hooks run; they may not rely on the task staying
        let should_self_delete = self.options.self_delete && stage > TaskStage::Started;

        if let (Some(pending), Some(gate)) = (pending, self.extensibility.as_ref()) {
            let mut checkpoint = self.checkpoint(ctx, pending);
            if stage.is_terminal() {
                // A finished task can not be suspended; subscribers are only told
                checkpoint.subscription.blocking = false;
            }
            let key = checkpoint.key.clone();
            if gate.intercept(ctx.host(), checkpoint).await == GateOutcome::Suspended {
                info!(link = %ctx.link(), checkpoint = %key, "Task suspended at checkpoint");
                return;
            }
        }

        match stage {
            TaskStage::Created | TaskStage::Started => {
                let control = self.control(ctx);
                self.handler
                    .handle_started_stage(&control, &self.state)
                    .await;
            }
            TaskStage::Finished => {
                info!(link = %ctx.link(), kind = H::KIND, "Task finished");
                self.notify_caller(ctx);
            }
            TaskStage::Failed => {
                warn!(
                    link = %ctx.link(),
                    kind = H::KIND,
                    failure = self.state.failure().map(|f| f.message.as_str()).unwrap_or(""),
                    "Task failed"
                );
                self.notify_caller(ctx);
            }
            TaskStage::Cancelled => {
                info!(link = %ctx.link(), kind = H::KIND, "Task cancelled");
            }
        }

        if should_self_delete {
            ctx.send_self(Operation::delete(ctx.link()));
        }
    }

    /// Report a terminal stage to the parent. Never blocks the task.
    fn notify_caller(&self, ctx: &ServiceContext) {
        let Some(callback) = self
            .state
            .service_task_callback
            .as_ref()
            .filter(|callback| !callback.is_empty())
        else {
            debug!(link = %ctx.link(), "No callback to notify");
            return;
        };
        let Some(address) = callback.address().map(str::to_string) else {
            return;
        };
        let host = ctx.host().clone();

        if callback.is_external() {
            let body = self.document();
            tokio::spawn(async move {
                if let Err(e) = host.notifier().post(&address, &body).await {
                    error!(address = %address, error = %e, "Failed to notify external caller");
                }
            });
            return;
        }

        let response = match self.state.stage() {
            Some(TaskStage::Finished) => callback.success_response(),
            Some(TaskStage::Cancelled) => return,
            _ => callback.failure_response(
                self.state
                    .failure()
                    .cloned()
                    .unwrap_or_else(|| ErrorResponse::from_message("Unexpected State")),
            ),
        }
        .with_custom_properties(self.state.custom_properties.clone());

        match serde_json::to_value(&response) {
            Ok(body) => {
                let op = self
                    .control(ctx)
                    .outgoing(Operation::patch(address, body))
                    .wait_for_availability();
                host.spawn_send(op);
            }
            Err(e) => warn!(link = %ctx.link(), error = %e, "Failed to encode callback response"),
        }
    }

    /// PATCH the request tracker with the current status. Terminal stages are
    /// retried, intermediate ones are best effort.
    fn update_request_tracker(&self, ctx: &ServiceContext) {
        let Some(tracker) = self.state.request_tracker_link.clone() else {
            return;
        };
        let status = TaskStatus::from_state(self.handler.display_name(), &self.state);
        let stage = status.task_info.stage;
        let body = match serde_json::to_value(&status) {
            Ok(body) => body,
            Err(e) => {
                warn!(link = %ctx.link(), error = %e, "Failed to encode task status");
                return;
            }
        };

        let host = ctx.host().clone();
        let headers = self.locale_headers();
        let interval = host.config().tracker_retry_interval;
        let mut retries_left = match stage {
            TaskStage::Finished | TaskStage::Failed => host.config().task_retries,
            _ => 0,
        };

        tokio::spawn(async move {
            loop {
                match host
                    .deliver(Action::Patch, &tracker, body.clone(), &headers)
                    .await
                {
                    Ok(()) => return,
                    Err(e) if e.is_cancellation() => {
                        debug!(tracker = %tracker, "Request tracker update cancelled");
                        return;
                    }
                    Err(e) if retries_left > 0 => {
                        retries_left -= 1;
                        debug!(tracker = %tracker, error = %e, retries_left, "Retrying request tracker update");
                        tokio::time::sleep(interval).await;
                    }
                    Err(e) => {
                        warn!(tracker = %tracker, stage = %stage, error = %e, "Failed to update request tracker");
                        return;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl<H: TaskHandler> Service for TaskService<H> {
    fn kind(&self) -> &'static str {
        TASK_KIND
    }

    fn document(&self) -> Value {
        serde_json::to_value(&self.state).unwrap_or(Value::Null)
    }

    async fn handle_create(&mut self, ctx: &ServiceContext, op: &Operation) -> Result<()> {
        let mut state: StateOf<H> = op.body_as()?;
        if state.document_version != 0 {
            return Err(CoreError::validation(
                "documentVersion",
                "must be 0 when creating a task",
            ));
        }

        state.document_self_link = Some(ctx.link().to_string());
        state
            .service_task_callback
            .get_or_insert_with(TaskCallback::empty);
        state
            .task_info
            .get_or_insert_with(|| TaskInfo::create(TaskStage::Created));
        state.task_sub_stage.get_or_insert(H::SubStage::CREATED);
        if state.document_expiration.is_none() {
            state.document_expiration = Some(deadline_after(ctx.config().default_task_expiration));
        }

        self.handler.validate_new_state(&state)?;

        let body = serde_json::to_value(&state)?;
        let doc = ctx
            .create_document(TASK_KIND, body, state.document_expiration)
            .await?;
        state.document_version = doc.version;
        self.state = state;

        debug!(link = %ctx.link(), kind = H::KIND, "Task created");
        Ok(())
    }

    #[instrument(skip_all, fields(link = %ctx.link(), kind = H::KIND))]
    async fn handle_start(&mut self, ctx: &ServiceContext, request: Request) {
        let Request { op, responder } = request;
        self.locale = op.header(ACCEPT_LANGUAGE).map(str::to_string);

        let (Some(stage), Some(_)) = (self.state.stage(), self.state.task_sub_stage) else {
            responder.fail(CoreError::validation(
                "taskInfo",
                "stage and subStage are required",
            ));
            return;
        };
        if stage.is_terminal() {
            responder.complete(self.document());
            return;
        }

        let mut candidate = self.state.clone();
        let mut changed = false;
        if stage == TaskStage::Created {
            candidate.task_info = Some(TaskInfo::create(TaskStage::Started));
            changed = true;
        }
        let pending = self.prepare_checkpoint(&mut candidate);
        changed |= pending.is_some();

        if changed {
            if let Err(e) = self.persist(ctx, candidate).await {
                responder.fail(e);
                return;
            }
            ctx.adjust_stat(TaskStage::Started.as_str(), 1);
            self.update_request_tracker(ctx);
        }

        responder.complete(self.document());
        self.handle_stage_patch(ctx, pending).await;
    }

    #[instrument(skip_all, fields(link = %ctx.link(), kind = H::KIND))]
    async fn handle_patch(&mut self, ctx: &ServiceContext, request: Request) {
        let Request { op, responder } = request;
        let patch: StateOf<H> = match op.body_as() {
            Ok(patch) => patch,
            Err(e) => {
                responder.fail(e);
                return;
            }
        };

        let current_stage = self.state.stage().unwrap_or(TaskStage::Created);
        let current_sub_stage = self.state.task_sub_stage.unwrap_or(H::SubStage::CREATED);
        match transition::validate(
            ctx.link(),
            current_stage,
            current_sub_stage,
            patch.stage(),
            patch.task_sub_stage,
        ) {
            Ok(Transition::Apply) => {}
            Ok(Transition::Absorb) => {
                debug!(
                    current = %current_stage,
                    incoming = ?patch.stage(),
                    "Transition absorbed"
                );
                responder.complete(self.document());
                return;
            }
            Err(e) => {
                warn!(error = %e, "Transition rejected");
                responder.fail(e);
                return;
            }
        }

        let mut candidate = self.state.clone();
        if let Some(incoming) = patch.task_info.clone() {
            let info = candidate
                .task_info
                .get_or_insert_with(|| TaskInfo::create(incoming.stage));
            info.stage = incoming.stage;
            if incoming.failure.is_some() {
                info.failure = incoming.failure;
            }
        }
        if let Some(sub_stage) = patch.task_sub_stage {
            candidate.task_sub_stage = Some(sub_stage);
        }
        candidate.merge_patch(patch.clone());
        if candidate.document_expiration.is_none() {
            candidate.document_expiration =
                Some(deadline_after(ctx.config().default_task_expiration));
        }
        if let Err(e) = self.handler.validate_and_merge(&patch, &mut candidate) {
            responder.fail(e);
            return;
        }

        let stage = candidate.stage().unwrap_or(current_stage);
        let pending = self.prepare_checkpoint(&mut candidate);
        if let Err(e) = self.persist(ctx, candidate).await {
            responder.fail(e);
            return;
        }
        ctx.adjust_stat(stage.as_str(), 1);
        self.update_request_tracker(ctx);

        responder.complete(self.document());
        self.handle_stage_patch(ctx, pending).await;
    }

    async fn handle_delete(&mut self, ctx: &ServiceContext, _op: &Operation) -> Result<()> {
        let stage = self.state.stage().unwrap_or(TaskStage::Created);
        let callback = self
            .state
            .service_task_callback
            .as_ref()
            .filter(|callback| !callback.is_empty());

        if let (false, Some(callback)) = (stage.is_terminal(), callback) {
            let failure = ErrorResponse::from_message(format!("Task expired in stage: {}", stage))
                .with_locale(self.locale.clone());
            let response = callback.failure_response(failure);
            match (callback.address(), serde_json::to_value(&response)) {
                (Some(address), Ok(body)) if callback.is_external() => {
                    let host = ctx.host().clone();
                    let address = address.to_string();
                    tokio::spawn(async move {
                        if let Err(e) = host.notifier().post(&address, &body).await {
                            warn!(address = %address, error = %e, "Failed to notify caller of task expiry");
                        }
                    });
                }
                (Some(address), Ok(body)) => {
                    // Not awaited: the parent may be the one deleting this task
                    let op = Operation::patch(address, body)
                        .with_headers(&self.locale_headers())
                        .with_referer(ctx.link())
                        .wait_for_availability();
                    ctx.host().spawn_send(op);
                }
                (None, _) => {}
                (_, Err(e)) => {
                    warn!(link = %ctx.link(), error = %e, "Failed to encode task expiry response");
                }
            }
        }

        debug!(link = %ctx.link(), stage = %stage, "Task deleted");
        Ok(())
    }
}

// ============================================================================
// Control
// ============================================================================

/// Handle given to [`TaskHandler`] hooks to drive the task.
///
/// Every stage change is a PATCH to the task's own address, processed after
/// the current hook returns.
pub struct TaskControl<H: TaskHandler> {
    host: Host,
    link: String,
    locale: Option<String>,
    _kind: PhantomData<fn() -> H>,
}

impl<H: TaskHandler> Clone for TaskControl<H> {
    fn clone(&self) -> Self {
        Self {
            host: self.host.clone(),
            link: self.link.clone(),
            locale: self.locale.clone(),
            _kind: PhantomData,
        }
    }
}

impl<H: TaskHandler> fmt::Debug for TaskControl<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskControl")
            .field("kind", &H::KIND)
            .field("link", &self.link)
            .finish()
    }
}

impl<H: TaskHandler> TaskControl<H> {
    /// Control over the task at `link`.
    pub fn new(host: Host, link: impl Into<String>, locale: Option<String>) -> Self {
        Self {
            host,
            link: link.into(),
            locale,
            _kind: PhantomData,
        }
    }

    /// Address of the task.
    pub fn link(&self) -> &str {
        &self.link
    }

    /// The host.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Locale of the request that started the task.
    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    /// Tag `op` with the task as referer and the caller's locale.
    pub fn outgoing(&self, op: Operation) -> Operation {
        let op = op.with_referer(self.link.clone());
        match &self.locale {
            Some(locale) if op.header(ACCEPT_LANGUAGE).is_none() => {
                op.with_header(ACCEPT_LANGUAGE, locale.clone())
            }
            _ => op,
        }
    }

    /// Send an operation on behalf of the task and wait for the reply.
    ///
    /// Hooks run inside the task's actor, so awaiting an operation addressed
    /// to the task itself never completes; use [`spawn_send`](Self::spawn_send)
    /// for that.
    pub async fn send(&self, op: Operation) -> Result<Value> {
        self.host.send(self.outgoing(op)).await
    }

    /// Send an operation on behalf of the task without waiting.
    pub fn spawn_send(&self, op: Operation) {
        self.host.spawn_send(self.outgoing(op));
    }

    fn send_patch(&self, patch: &StateOf<H>) {
        match serde_json::to_value(patch) {
            Ok(body) => self.spawn_send(Operation::patch(self.link.clone(), body)),
            Err(e) => error!(link = %self.link, error = %e, "Failed to encode task patch"),
        }
    }

    /// Move to `stage`/`sub_stage`; `mutate` may fill other patch fields.
    pub fn proceed_to(
        &self,
        stage: TaskStage,
        sub_stage: H::SubStage,
        mutate: impl FnOnce(&mut StateOf<H>),
    ) {
        let mut patch = StateOf::<H>::patch(stage, sub_stage);
        mutate(&mut patch);
        self.send_patch(&patch);
    }

    /// Move to another substage of STARTED.
    pub fn proceed_to_sub_stage(&self, sub_stage: H::SubStage) {
        self.proceed_to(TaskStage::Started, sub_stage, |_| {});
    }

    /// Move to FINISHED/COMPLETED.
    pub fn complete(&self) {
        self.proceed_to(TaskStage::Finished, H::SubStage::COMPLETED, |_| {});
    }

    /// Move to FAILED/ERROR with `failure`.
    pub fn complete_with_error(&self, failure: ErrorResponse) {
        self.proceed_to(TaskStage::Failed, H::SubStage::ERROR, |patch| {
            patch.task_info = Some(TaskInfo::failed(failure));
        });
    }

    /// Fail the task, logging at warning level.
    pub fn fail_task(&self, message: &str, cause: Option<&(dyn StdError + 'static)>) {
        self.fail_task_with(FailureLog::Warning, message, cause);
    }

    /// Fail the task. The failure record is built from `cause` when given,
    /// from `message` otherwise.
    pub fn fail_task_with(
        &self,
        log: FailureLog,
        message: &str,
        cause: Option<&(dyn StdError + 'static)>,
    ) {
        let message = if message.is_empty() {
            "Unexpected State"
        } else {
            message
        };
        let cause_text = cause.map(|c| c.to_string()).unwrap_or_default();
        match log {
            FailureLog::Warning => {
                warn!(link = %self.link, kind = H::KIND, cause = %cause_text, "{}", message)
            }
            FailureLog::Info => {
                info!(link = %self.link, kind = H::KIND, cause = %cause_text, "{}", message)
            }
        }

        let failure = cause
            .map(ErrorResponse::from_error)
            .unwrap_or_else(|| ErrorResponse::from_message(message))
            .with_locale(self.locale.clone());
        self.complete_with_error(failure);
    }

    /// Create a fan-in counter expecting `count` children. On completion it
    /// PATCHes this task to STARTED/`sub_stage_complete` (or STARTED/ERROR
    /// when the failure ratio exceeds `error_threshold`).
    ///
    /// Fails the task and returns `None` when the counter cannot be created.
    pub async fn create_counter_subtask(
        &self,
        count: u64,
        error_threshold: f64,
        sub_stage_complete: H::SubStage,
    ) -> Option<String> {
        let callback = match TaskCallback::create(
            self.link.clone(),
            TaskStage::Started,
            sub_stage_complete,
            TaskStage::Started,
            H::SubStage::ERROR,
        ) {
            Ok(callback) => callback,
            Err(e) => {
                self.fail_task("Failure creating counter callback", Some(&e));
                return None;
            }
        };

        match CounterSubTask::create(&self.host, &self.link, count, error_threshold, callback).await
        {
            Ok(link) => Some(link),
            Err(e) => {
                self.fail_task("Failure creating counter subtask", Some(&e));
                None
            }
        }
    }

    /// Callback to hand to `count` children.
    ///
    /// A single child reports straight to this task unless `force_counter`
    /// is set; more children report to a counter. `external` makes the
    /// address absolute for children living outside the process.
    pub async fn create_counter_subtask_callback(
        &self,
        count: u64,
        external: bool,
        sub_stage_complete: H::SubStage,
        force_counter: bool,
    ) -> Option<TaskCallback> {
        let address = |link: &str| {
            if external {
                self.host.config().absolute_uri(link)
            } else {
                link.to_string()
            }
        };

        let callback = if count == 1 && !force_counter {
            TaskCallback::create(
                address(&self.link),
                TaskStage::Started,
                sub_stage_complete,
                TaskStage::Started,
                H::SubStage::ERROR,
            )
        } else {
            let counter_link = self
                .create_counter_subtask(count, 0.0, sub_stage_complete)
                .await?;
            TaskCallback::with_stages(
                address(&counter_link),
                TaskStage::Finished,
                TaskStage::Failed,
            )
        };

        match callback {
            Ok(callback) => Some(callback),
            Err(e) => {
                self.fail_task("Failure creating callback", Some(&e));
                None
            }
        }
    }

    /// Report an outcome to `callback` from the child side. A failed
    /// delivery fails this task.
    pub async fn report_to_callback(
        &self,
        callback: &TaskCallback,
        outcome: std::result::Result<(), ErrorResponse>,
    ) {
        let Some(address) = callback.address() else {
            return;
        };
        let response = match outcome {
            Ok(()) => callback.success_response(),
            Err(failure) => callback.failure_response(failure.with_locale(self.locale.clone())),
        };
        let headers: HashMap<String, String> = self
            .locale
            .iter()
            .map(|locale| (ACCEPT_LANGUAGE.to_string(), locale.clone()))
            .collect();

        let delivered = match serde_json::to_value(&response) {
            Ok(body) => self.host.deliver(Action::Patch, address, body, &headers).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = delivered {
            self.fail_task("Failure reporting to callback", Some(&e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::notifier::MockNotifier;
    use crate::store::MemoryDocumentStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    crate::sub_stages! {
        enum Step {
            Created => "CREATED",
            Working => "WORKING",
            Completed => "COMPLETED",
            Error => "ERROR",
        }
        created = Created;
        completed = Completed;
        error = Error;
    }

    /// Walks CREATED → WORKING → FINISHED.
    #[derive(Default)]
    struct Walker {
        hook_runs: AtomicU32,
    }

    #[async_trait]
    impl TaskHandler for Walker {
        type SubStage = Step;
        type Body = crate::task::EmptyBody;
        const KIND: &'static str = "Walker";

        async fn handle_started_stage(&self, task: &TaskControl<Self>, state: &StateOf<Self>) {
            self.hook_runs.fetch_add(1, Ordering::SeqCst);
            match state.task_sub_stage {
                Some(Step::Created) => task.proceed_to_sub_stage(Step::Working),
                Some(Step::Working) => task.complete(),
                _ => {}
            }
        }
    }

    fn test_host() -> Host {
        Host::new(
            Config::default(),
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MockNotifier::new()),
        )
    }

    async fn wait_for_stage(host: &Host, link: &str, stage: &str) -> Value {
        for _ in 0..200 {
            if let Ok(doc) = host.send(Operation::get(link)).await {
                if doc["taskInfo"]["stage"] == stage {
                    return doc;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{} never reached {}", link, stage);
    }

    #[tokio::test]
    async fn test_create_applies_defaults() {
        let host = test_host();
        host.register_factory("/walkers", Arc::new(TaskFactory::new(Walker::default())));

        let doc = host
            .send(Operation::post("/walkers", json!({ "documentSelfLink": "w" })))
            .await
            .unwrap();

        assert_eq!(doc["documentSelfLink"], "/walkers/w");
        assert_eq!(doc["taskInfo"]["stage"], "STARTED");
        assert_eq!(doc["taskSubStage"], "CREATED");
        assert!(doc["documentExpiration"].is_string());
        assert!(doc["serviceTaskCallback"].is_object());
    }

    #[tokio::test]
    async fn test_create_rejects_nonzero_version() {
        let host = test_host();
        host.register_factory("/walkers", Arc::new(TaskFactory::new(Walker::default())));

        let err = host
            .send(Operation::post("/walkers", json!({ "documentVersion": 3 })))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_task_walks_to_finished() {
        let host = test_host();
        host.register_factory("/walkers", Arc::new(TaskFactory::new(Walker::default())));
        host.send(Operation::post("/walkers", json!({ "documentSelfLink": "w" })))
            .await
            .unwrap();

        let doc = wait_for_stage(&host, "/walkers/w", "FINISHED").await;
        assert_eq!(doc["taskSubStage"], "COMPLETED");
        assert_eq!(host.stats().get("/walkers/w", "FINISHED"), 1);
    }

    #[tokio::test]
    async fn test_terminal_task_is_left_alone_on_start() {
        let host = test_host();
        let handler = Arc::new(Walker::default());
        let service = TaskService::new(Arc::clone(&handler), TaskOptions::default(), None);

        let doc = host
            .start_service(
                "/walkers/done",
                Box::new(service),
                json!({ "taskInfo": { "stage": "FINISHED" }, "taskSubStage": "COMPLETED" }),
            )
            .await
            .unwrap();

        assert_eq!(doc["taskInfo"]["stage"], "FINISHED");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.hook_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_self_delete_removes_finished_task() {
        let host = test_host();
        host.register_factory(
            "/walkers",
            Arc::new(TaskFactory::new(Walker::default()).self_delete()),
        );
        host.send(Operation::post("/walkers", json!({ "documentSelfLink": "w" })))
            .await
            .unwrap();

        for _ in 0..200 {
            if !host.is_running("/walkers/w") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!host.is_running("/walkers/w"));
        assert!(host.store().get("/walkers/w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_outgoing_tagging_and_failure_from_cause() {
        let host = test_host();
        let control = TaskControl::<Walker>::new(host, "/walkers/x", Some("de".to_string()));
        let cause = CoreError::DocumentNotFound {
            link: "/things/1".to_string(),
        };

        // The PATCH is fire-and-forget; only the outgoing tagging is checked here
        let op = control.outgoing(Operation::get("/things/1"));
        assert_eq!(op.referer.as_deref(), Some("/walkers/x"));
        assert_eq!(op.header(ACCEPT_LANGUAGE), Some("de"));

        let failure = ErrorResponse::from_error(&cause).with_locale(Some("de".to_string()));
        assert_eq!(failure.status_code, 404);
        assert_eq!(failure.error_code.as_deref(), Some("DOCUMENT_NOT_FOUND"));
        control.fail_task("lookup failed", Some(&cause));
    }
}
