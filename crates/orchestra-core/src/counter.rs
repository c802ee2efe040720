// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fan-in barrier for parallel child tasks.
//!
//! A counter lives under its parent's address (`{parent}/counters/{id}`) and
//! expects `completionsRemaining` terminal reports. Each child POSTs or
//! PATCHes a callback response to it. When the count reaches zero, or the
//! failure ratio exceeds the threshold, the counter notifies its own callback
//! exactly once. Reports arriving after that are answered with success and
//! otherwise ignored.
//!
//! Decrement, ratio check and the fire decision happen inside one handler
//! invocation of the counter's actor, so concurrent reports cannot both fire.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{CoreError, ErrorResponse, Result};
use crate::host::{Action, Host, Operation, Request, Service, ServiceContext, deadline_after};
use crate::task::merge::additive_map;
use crate::task::{TaskCallback, TaskInfo, TaskStage};

/// Document kind of counters.
pub const COUNTER_KIND: &str = "counter-subtask";

/// Path segment under which a parent's counters live.
pub const COUNTERS_SEGMENT: &str = "counters";

/// Persisted counter document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSubTaskState {
    /// Address of the counter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_self_link: Option<String>,
    /// Store version.
    #[serde(default)]
    pub document_version: u64,
    /// When the store deletes the counter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_expiration: Option<DateTime<Utc>>,
    /// Reports still expected.
    #[serde(default)]
    pub completions_remaining: u64,
    /// FINISHED reports received.
    #[serde(default)]
    pub finished_count: u64,
    /// FAILED and CANCELLED reports received.
    #[serde(default)]
    pub fail_count: u64,
    /// Tolerated failure ratio in `[0, 1]`; 0 fails on the first failure.
    #[serde(default)]
    pub error_threshold: f64,
    /// Where the aggregate outcome goes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_task_callback: Option<TaskCallback>,
    /// Custom properties collected from successful children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_properties: Option<HashMap<String, String>>,
    /// First failure reported by a child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ErrorResponse>,
    /// Whether the threshold cut the barrier short.
    #[serde(default)]
    pub forced_failure: bool,
}

/// Body a child reports with: the shape of a callback response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CounterReport {
    #[serde(default)]
    task_info: Option<TaskInfo>,
    #[serde(default)]
    custom_properties: Option<HashMap<String, String>>,
}

/// Read a threshold given either as a fraction or as a percentage.
pub fn normalize_threshold(threshold: f64) -> f64 {
    if threshold.is_nan() {
        return 0.0;
    }
    let fraction = if threshold > 1.0 {
        threshold / 100.0
    } else {
        threshold
    };
    fraction.clamp(0.0, 1.0)
}

/// The counter document actor.
#[derive(Debug, Default)]
pub struct CounterSubTask {
    state: CounterSubTaskState,
}

impl CounterSubTask {
    /// Start a counter under `parent_link` expecting `count` reports and
    /// return its address.
    pub async fn create(
        host: &Host,
        parent_link: &str,
        count: u64,
        error_threshold: f64,
        callback: TaskCallback,
    ) -> Result<String> {
        let link = format!("{}/{}/{}", parent_link, COUNTERS_SEGMENT, Uuid::new_v4());
        let initial = CounterSubTaskState {
            completions_remaining: count,
            error_threshold,
            service_task_callback: Some(callback),
            ..Default::default()
        };
        host.start_service(
            link.clone(),
            Box::new(Self::default()),
            serde_json::to_value(&initial)?,
        )
        .await?;
        debug!(counter = %link, parent = %parent_link, count, "Counter created");
        Ok(link)
    }

    /// Current state.
    pub fn state(&self) -> &CounterSubTaskState {
        &self.state
    }

    /// Apply one report to a copy of the state. Returns `None` when the
    /// report does not count.
    fn apply_report(&self, report: CounterReport) -> Result<Option<CounterSubTaskState>> {
        let Some(info) = report.task_info else {
            return Err(CoreError::validation("taskInfo", "a report needs a stage"));
        };

        let mut next = self.state.clone();
        match info.stage {
            TaskStage::Finished => {
                next.completions_remaining -= 1;
                next.finished_count += 1;
                additive_map(&mut next.custom_properties, report.custom_properties);
            }
            TaskStage::Failed | TaskStage::Cancelled => {
                next.completions_remaining -= 1;
                next.fail_count += 1;
                if next.failure.is_none() {
                    next.failure = Some(info.failure.unwrap_or_else(|| {
                        ErrorResponse::from_message(format!("Subtask {}", info.stage))
                    }));
                }

                let total = next.finished_count + next.fail_count + next.completions_remaining;
                let ratio = next.fail_count as f64 / total as f64;
                if next.error_threshold == 0.0 || ratio > next.error_threshold {
                    next.completions_remaining = 0;
                    next.forced_failure = true;
                }
            }
            TaskStage::Created | TaskStage::Started => return Ok(None),
        }
        Ok(Some(next))
    }

    /// Deliver the aggregate outcome. Failures are logged, not retried.
    fn fire(&self, ctx: &ServiceContext) {
        let Some(callback) = self
            .state
            .service_task_callback
            .as_ref()
            .filter(|callback| !callback.is_empty())
        else {
            return;
        };
        let Some(address) = callback.address().map(str::to_string) else {
            return;
        };

        let response = if self.state.forced_failure {
            callback.failure_response(
                self.state
                    .failure
                    .clone()
                    .unwrap_or_else(|| ErrorResponse::from_message("Subtask failed")),
            )
        } else {
            callback.success_response()
        }
        .with_custom_properties(self.state.custom_properties.clone());

        let body = match serde_json::to_value(&response) {
            Ok(body) => body,
            Err(e) => {
                warn!(counter = %ctx.link(), error = %e, "Failed to encode counter response");
                return;
            }
        };

        info!(
            counter = %ctx.link(),
            address = %address,
            finished = self.state.finished_count,
            failed = self.state.fail_count,
            forced = self.state.forced_failure,
            "Counter complete"
        );

        let host = ctx.host().clone();
        let counter = ctx.link().to_string();
        tokio::spawn(async move {
            if let Err(e) = host
                .deliver(Action::Patch, &address, body, &HashMap::new())
                .await
            {
                warn!(counter = %counter, address = %address, error = %e, "Failed to deliver counter outcome");
            }
        });
    }

    #[instrument(skip_all, fields(counter = %ctx.link()))]
    async fn report(&mut self, ctx: &ServiceContext, request: Request) {
        let Request { op, responder } = request;
        let report: CounterReport = match op.body_as() {
            Ok(report) => report,
            Err(e) => {
                responder.fail(e);
                return;
            }
        };

        if self.state.completions_remaining == 0 {
            debug!("Counter already complete, report ignored");
            responder.complete(self.document());
            return;
        }

        let mut next = match self.apply_report(report) {
            Ok(Some(next)) => next,
            Ok(None) => {
                responder.complete(self.document());
                return;
            }
            Err(e) => {
                responder.fail(e);
                return;
            }
        };

        let fired = next.completions_remaining == 0;
        if fired {
            // Kept around so late reports are still answered
            next.document_expiration =
                Some(deadline_after(ctx.config().processed_notification_expiry));
        }

        let expected = self.state.document_version;
        next.document_version = expected + 1;
        let body = match serde_json::to_value(&next) {
            Ok(body) => body,
            Err(e) => {
                responder.fail(e.into());
                return;
            }
        };
        match ctx
            .update_document(expected, body, next.document_expiration)
            .await
        {
            Ok(doc) => next.document_version = doc.version,
            Err(e) => {
                responder.fail(e);
                return;
            }
        }
        self.state = next;
        ctx.adjust_stat(if fired { "fired" } else { "reports" }, 1);

        responder.complete(self.document());
        if fired {
            self.fire(ctx);
        }
    }
}

#[async_trait]
impl Service for CounterSubTask {
    fn kind(&self) -> &'static str {
        COUNTER_KIND
    }

    fn document(&self) -> Value {
        serde_json::to_value(&self.state).unwrap_or(Value::Null)
    }

    async fn handle_create(&mut self, ctx: &ServiceContext, op: &Operation) -> Result<()> {
        let mut state: CounterSubTaskState = op.body_as()?;
        if state.completions_remaining < 1 {
            return Err(CoreError::validation(
                "completionsRemaining",
                "a counter must expect at least one report",
            ));
        }
        if state
            .service_task_callback
            .as_ref()
            .is_none_or(TaskCallback::is_empty)
        {
            return Err(CoreError::validation(
                "serviceTaskCallback",
                "a counter needs a callback",
            ));
        }

        state.document_self_link = Some(ctx.link().to_string());
        state.document_version = 0;
        state.finished_count = 0;
        state.fail_count = 0;
        state.forced_failure = false;
        state.error_threshold = normalize_threshold(state.error_threshold);
        if state.document_expiration.is_none() {
            state.document_expiration = Some(deadline_after(ctx.config().default_task_expiration));
        }

        let doc = ctx
            .create_document(
                COUNTER_KIND,
                serde_json::to_value(&state)?,
                state.document_expiration,
            )
            .await?;
        state.document_version = doc.version;
        self.state = state;
        Ok(())
    }

    async fn handle_post(&mut self, ctx: &ServiceContext, request: Request) {
        self.report(ctx, request).await;
    }

    async fn handle_patch(&mut self, ctx: &ServiceContext, request: Request) {
        self.report(ctx, request).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(remaining: u64, threshold: f64) -> CounterSubTask {
        CounterSubTask {
            state: CounterSubTaskState {
                completions_remaining: remaining,
                error_threshold: threshold,
                ..Default::default()
            },
        }
    }

    fn report(stage: TaskStage) -> CounterReport {
        CounterReport {
            task_info: Some(TaskInfo::create(stage)),
            custom_properties: None,
        }
    }

    fn feed(counter: &mut CounterSubTask, stages: &[TaskStage]) {
        for stage in stages {
            if counter.state.completions_remaining == 0 {
                return;
            }
            if let Some(next) = counter.apply_report(report(*stage)).unwrap() {
                counter.state = next;
            }
        }
    }

    #[test]
    fn test_normalize_threshold() {
        assert_eq!(normalize_threshold(0.4), 0.4);
        assert_eq!(normalize_threshold(40.0), 0.4);
        assert_eq!(normalize_threshold(-1.0), 0.0);
        assert_eq!(normalize_threshold(250.0), 1.0);
        assert_eq!(normalize_threshold(f64::NAN), 0.0);
    }

    #[test]
    fn test_ratio_equal_to_threshold_does_not_force() {
        let mut c = counter(5, 0.4);
        feed(
            &mut c,
            &[
                TaskStage::Finished,
                TaskStage::Finished,
                TaskStage::Finished,
                TaskStage::Failed,
                TaskStage::Failed,
            ],
        );
        assert_eq!(c.state.completions_remaining, 0);
        assert_eq!(c.state.finished_count, 3);
        assert_eq!(c.state.fail_count, 2);
        assert!(!c.state.forced_failure);
    }

    #[test]
    fn test_ratio_above_threshold_forces_completion() {
        let mut c = counter(5, 0.4);
        feed(&mut c, &[TaskStage::Failed, TaskStage::Failed]);
        assert_eq!(c.state.completions_remaining, 3);

        feed(&mut c, &[TaskStage::Failed]);
        assert_eq!(c.state.completions_remaining, 0);
        assert_eq!(c.state.fail_count, 3);
        assert!(c.state.forced_failure);
    }

    #[test]
    fn test_zero_threshold_forces_on_first_failure() {
        let mut c = counter(100, 0.0);
        feed(&mut c, &[TaskStage::Finished, TaskStage::Cancelled]);
        assert_eq!(c.state.completions_remaining, 0);
        assert!(c.state.forced_failure);
        assert_eq!(
            c.state.failure.as_ref().map(|f| f.message.as_str()),
            Some("Subtask CANCELLED")
        );
    }

    #[test]
    fn test_progress_reports_do_not_count() {
        let c = counter(2, 0.0);
        assert!(c.apply_report(report(TaskStage::Started)).unwrap().is_none());
        assert!(c.apply_report(report(TaskStage::Created)).unwrap().is_none());
        let missing = CounterReport {
            task_info: None,
            custom_properties: None,
        };
        assert_eq!(c.apply_report(missing).unwrap_err().status_code(), 400);
    }

    #[test]
    fn test_first_failure_is_kept() {
        let mut c = counter(3, 1.0);
        for message in ["first", "second"] {
            let next = c
                .apply_report(CounterReport {
                    task_info: Some(TaskInfo::failed(ErrorResponse::from_message(message))),
                    custom_properties: None,
                })
                .unwrap()
                .unwrap();
            c.state = next;
        }
        assert_eq!(c.state.failure.unwrap().message, "first");
    }

    #[test]
    fn test_success_merges_custom_properties() {
        let c = counter(2, 0.0);
        let next = c
            .apply_report(CounterReport {
                task_info: Some(TaskInfo::create(TaskStage::Finished)),
                custom_properties: Some(HashMap::from([("k".to_string(), "v".to_string())])),
            })
            .unwrap()
            .unwrap();
        assert_eq!(next.custom_properties.unwrap()["k"], "v");
    }
}
