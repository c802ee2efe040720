// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parent notification contract.
//!
//! A [`TaskCallback`] records where a task reports its outcome and which
//! stage/substage the receiver agreed to treat as success and as failure.
//! The receiver's substage type is unknown to the reporting task, so
//! substages travel as their wire names.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{SubStage, TaskInfo, TaskStage};
use crate::error::{CoreError, ErrorResponse, Result};
use crate::notifier::is_external;

/// Where and how to report a task's outcome. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCallback {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service_self_link: Option<String>,
    task_stage_complete: TaskStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task_sub_stage_complete: Option<String>,
    task_stage_failed: TaskStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task_sub_stage_failed: Option<String>,
}

impl Default for TaskCallback {
    fn default() -> Self {
        Self::empty()
    }
}

impl TaskCallback {
    /// Callback to `address` with success and failure stage/substage pairs.
    pub fn create<S: SubStage>(
        address: impl Into<String>,
        stage_complete: TaskStage,
        sub_stage_complete: S,
        stage_failed: TaskStage,
        sub_stage_failed: S,
    ) -> Result<Self> {
        Ok(Self {
            service_self_link: Some(require_address(address.into())?),
            task_stage_complete: stage_complete,
            task_sub_stage_complete: Some(sub_stage_complete.name().to_string()),
            task_stage_failed: stage_failed,
            task_sub_stage_failed: Some(sub_stage_failed.name().to_string()),
        })
    }

    /// Callback to `address` that only names stages.
    pub fn with_stages(
        address: impl Into<String>,
        stage_complete: TaskStage,
        stage_failed: TaskStage,
    ) -> Result<Self> {
        Ok(Self {
            service_self_link: Some(require_address(address.into())?),
            task_stage_complete: stage_complete,
            task_sub_stage_complete: None,
            task_stage_failed: stage_failed,
            task_sub_stage_failed: None,
        })
    }

    /// Callback whose substages are already wire names, for callers that do
    /// not know the receiver's substage type.
    pub fn with_sub_stage_names(
        address: impl Into<String>,
        stage_complete: TaskStage,
        sub_stage_complete: Option<String>,
        stage_failed: TaskStage,
        sub_stage_failed: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            service_self_link: Some(require_address(address.into())?),
            task_stage_complete: stage_complete,
            task_sub_stage_complete: sub_stage_complete,
            task_stage_failed: stage_failed,
            task_sub_stage_failed: sub_stage_failed,
        })
    }

    /// The "no callback" sentinel used by root tasks.
    pub fn empty() -> Self {
        Self {
            service_self_link: None,
            task_stage_complete: TaskStage::Finished,
            task_sub_stage_complete: None,
            task_stage_failed: TaskStage::Failed,
            task_sub_stage_failed: None,
        }
    }

    /// Whether this is the "no callback" sentinel.
    pub fn is_empty(&self) -> bool {
        self.service_self_link.as_deref().is_none_or(str::is_empty)
    }

    /// Whether the address is an absolute URL.
    pub fn is_external(&self) -> bool {
        self.service_self_link.as_deref().is_some_and(is_external)
    }

    /// Target address.
    pub fn address(&self) -> Option<&str> {
        self.service_self_link.as_deref().filter(|a| !a.is_empty())
    }

    /// Stage reported on success.
    pub fn stage_complete(&self) -> TaskStage {
        self.task_stage_complete
    }

    /// Substage reported on success.
    pub fn sub_stage_complete(&self) -> Option<&str> {
        self.task_sub_stage_complete.as_deref()
    }

    /// Stage reported on failure.
    pub fn stage_failed(&self) -> TaskStage {
        self.task_stage_failed
    }

    /// Substage reported on failure.
    pub fn sub_stage_failed(&self) -> Option<&str> {
        self.task_sub_stage_failed.as_deref()
    }

    /// Response carrying the success stage/substage.
    pub fn success_response(&self) -> CallbackResponse {
        CallbackResponse {
            task_info: TaskInfo::create(self.task_stage_complete),
            task_sub_stage: self.task_sub_stage_complete.clone(),
            custom_properties: None,
        }
    }

    /// Response carrying the failure stage/substage and `failure`.
    pub fn failure_response(&self, failure: ErrorResponse) -> CallbackResponse {
        CallbackResponse {
            task_info: TaskInfo {
                stage: self.task_stage_failed,
                failure: Some(failure),
            },
            task_sub_stage: self.task_sub_stage_failed.clone(),
            custom_properties: None,
        }
    }
}

fn require_address(address: String) -> Result<String> {
    if address.trim().is_empty() {
        return Err(CoreError::validation(
            "serviceSelfLink",
            "callback address is required",
        ));
    }
    Ok(address)
}

/// Body delivered to a callback address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    /// Stage (and failure) agreed with the receiver.
    pub task_info: TaskInfo,
    /// Substage agreed with the receiver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_sub_stage: Option<String>,
    /// Custom properties forwarded to the receiver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_properties: Option<HashMap<String, String>>,
}

impl CallbackResponse {
    /// Forward custom properties to the receiver.
    pub fn with_custom_properties(mut self, properties: Option<HashMap<String, String>>) -> Self {
        super::merge::additive_map(&mut self.custom_properties, properties);
        self
    }
}
