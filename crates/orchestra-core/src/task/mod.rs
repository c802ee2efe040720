// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task documents and the generic task state machine.
//!
//! A task is a document with a top-level [`TaskStage`], a kind-specific
//! [`SubStage`], an optional parent [`TaskCallback`] and a kind-specific body.
//! Transitions arrive as PATCHes to the task's own address and are validated
//! by [`transition::validate`] before being merged.

pub mod callback;
pub mod merge;
pub mod service;
pub mod status;
pub mod sub_stage;
pub mod transition;

pub use self::callback::{CallbackResponse, TaskCallback};
pub use self::merge::TaskBody;
pub use self::service::{FailureLog, TaskControl, TaskFactory, TaskHandler, TaskOptions, TaskService};
pub use self::status::TaskStatus;
pub use self::sub_stage::SubStage;
pub use self::transition::Transition;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorResponse;

/// Document kind recorded for task documents.
pub const TASK_KIND: &str = "task";

/// Custom property holding a link to the task's event log.
pub const EVENT_LOG_LINK_PROPERTY: &str = "__eventLogLink";

/// Top-level lifecycle phase of a task. Ordered by declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStage {
    /// Accepted, not started.
    Created,
    /// Running; substages carry the detail.
    Started,
    /// Completed successfully.
    Finished,
    /// Completed with a failure.
    Failed,
    /// Cancelled; the parent is not notified.
    Cancelled,
}

impl TaskStage {
    /// All stages in order.
    pub const ALL: [TaskStage; 5] = [
        Self::Created,
        Self::Started,
        Self::Finished,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Started => "STARTED",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Position in [`TaskStage::ALL`].
    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    /// FINISHED, FAILED or CANCELLED.
    pub fn is_terminal(&self) -> bool {
        *self >= Self::Finished
    }
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage plus the failure that caused a FAILED stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    /// Current stage.
    pub stage: TaskStage,
    /// Failure details, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ErrorResponse>,
}

impl TaskInfo {
    /// Info for `stage` without failure.
    pub fn create(stage: TaskStage) -> Self {
        Self {
            stage,
            failure: None,
        }
    }

    /// FAILED with `failure`.
    pub fn failed(failure: ErrorResponse) -> Self {
        Self {
            stage: TaskStage::Failed,
            failure: Some(failure),
        }
    }
}

/// Body used by task kinds that carry no fields of their own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyBody {}

impl TaskBody for EmptyBody {
    fn merge(&mut self, _patch: Self) {}
}

/// A task document. The same shape is used for PATCH bodies, where every
/// field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    rename_all = "camelCase",
    bound(deserialize = "S: serde::de::DeserializeOwned, B: serde::de::DeserializeOwned")
)]
pub struct TaskState<S, B> {
    /// Address of the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_self_link: Option<String>,
    /// Store version; must be 0 on create.
    #[serde(default)]
    pub document_version: u64,
    /// When the store deletes the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_expiration: Option<DateTime<Utc>>,
    /// Stage and failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_info: Option<TaskInfo>,
    /// Kind-specific substage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_sub_stage: Option<S>,
    /// Where to report FINISHED/FAILED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_task_callback: Option<TaskCallback>,
    /// Progress record patched on every stage change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_tracker_link: Option<String>,
    /// Open string map, merged across patches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_properties: Option<HashMap<String, String>>,
    /// Tenancy of the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_links: Option<Vec<String>>,
    /// Kind-specific fields.
    #[serde(flatten)]
    pub body: B,
}

impl<S, B: Default> Default for TaskState<S, B> {
    fn default() -> Self {
        Self {
            document_self_link: None,
            document_version: 0,
            document_expiration: None,
            task_info: None,
            task_sub_stage: None,
            service_task_callback: None,
            request_tracker_link: None,
            custom_properties: None,
            tenant_links: None,
            body: B::default(),
        }
    }
}

impl<S: SubStage, B: TaskBody> TaskState<S, B> {
    /// A patch body moving to `stage`/`sub_stage`.
    pub fn patch(stage: TaskStage, sub_stage: S) -> Self {
        Self {
            task_info: Some(TaskInfo::create(stage)),
            task_sub_stage: Some(sub_stage),
            ..Self::default()
        }
    }

    /// Current stage, if set.
    pub fn stage(&self) -> Option<TaskStage> {
        self.task_info.as_ref().map(|info| info.stage)
    }

    /// Failure attached to the task, if any.
    pub fn failure(&self) -> Option<&ErrorResponse> {
        self.task_info.as_ref().and_then(|info| info.failure.as_ref())
    }

    /// Look up a custom property.
    pub fn custom_property(&self, key: &str) -> Option<&str> {
        self.custom_properties
            .as_ref()
            .and_then(|props| props.get(key))
            .map(String::as_str)
    }

    /// Set a custom property.
    pub fn set_custom_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom_properties
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
    }

    /// Merge the non-stage fields of an accepted patch.
    ///
    /// Custom properties merge additively; callback, tracker link and
    /// expiration are overwritten when present; tenancy is first-write-wins.
    pub fn merge_patch(&mut self, patch: Self) {
        merge::additive_map(&mut self.custom_properties, patch.custom_properties);
        merge::overwrite_if_present(&mut self.service_task_callback, patch.service_task_callback);
        merge::overwrite_if_present(&mut self.request_tracker_link, patch.request_tracker_link);
        merge::overwrite_if_present(&mut self.document_expiration, patch.document_expiration);
        merge::first_write_wins(&mut self.tenant_links, patch.tenant_links);
        self.body.merge(patch.body);
    }
}
