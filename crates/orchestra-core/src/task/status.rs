// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Progress record sent to a task's request tracker.

use serde::{Deserialize, Serialize};

use super::{EVENT_LOG_LINK_PROPERTY, SubStage, TaskBody, TaskInfo, TaskStage, TaskState};

const PROGRESS_MAX: u8 = 100;

/// Status projection of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    /// Display name of the task kind.
    pub phase: String,
    /// Address of the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_link: Option<String>,
    /// Stage and failure.
    pub task_info: TaskInfo,
    /// Substage wire name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_stage: Option<String>,
    /// Percentage, 0-100.
    pub progress: u8,
    /// Event log of the task, when one was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_log_link: Option<String>,
    /// Tenancy of the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_links: Option<Vec<String>>,
}

impl TaskStatus {
    /// Project `state` for the tracker.
    pub fn from_state<S: SubStage, B: TaskBody>(phase: &str, state: &TaskState<S, B>) -> Self {
        let task_info = state
            .task_info
            .clone()
            .unwrap_or_else(|| TaskInfo::create(TaskStage::Created));
        Self {
            phase: phase.to_string(),
            task_link: state.document_self_link.clone(),
            progress: progress(state.task_sub_stage),
            task_info,
            sub_stage: state.task_sub_stage.map(|s| s.name().to_string()),
            event_log_link: state
                .custom_property(EVENT_LOG_LINK_PROPERTY)
                .map(str::to_string),
            tenant_links: state.tenant_links.clone(),
        }
    }
}

/// Progress of a substage: its declaration index spread over every
/// substage but the last two, capped at 100. The last two are conventionally
/// the completion and failure substages.
pub fn progress<S: SubStage>(sub_stage: Option<S>) -> u8 {
    let Some(sub_stage) = sub_stage else {
        return 0;
    };
    let steps = S::COUNT.saturating_sub(2).max(1);
    (sub_stage.ordinal() * PROGRESS_MAX as usize / steps).min(PROGRESS_MAX as usize) as u8
}
