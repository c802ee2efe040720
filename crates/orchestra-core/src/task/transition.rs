// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stage and substage transition rules.

use super::{SubStage, TaskStage};
use crate::error::{CoreError, Result};

/// Outcome of validating an incoming transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Merge the patch and dispatch the new stage.
    Apply,
    /// Complete the patch without changing anything.
    Absorb,
}

/// Validate a transition from `current` to the incoming stage/substage.
///
/// Rules, in order:
/// 1. A patch without a stage is rejected.
/// 2. FAILED onto FAILED is absorbed (no second failure notification).
/// 3. A stage regression is rejected, unless the task already sits in
///    FAILED on its error substage and the patch carries no substage or the
///    error substage; that duplicate failure is absorbed.
/// 4. A substage regression within the same stage is rejected, unless the
///    incoming substage is transient, in which case it is absorbed. A
///    substage regression that comes with a later stage is absorbed.
pub fn validate<S: SubStage>(
    link: &str,
    current_stage: TaskStage,
    current_sub_stage: S,
    incoming_stage: Option<TaskStage>,
    incoming_sub_stage: Option<S>,
) -> Result<Transition> {
    let Some(incoming_stage) = incoming_stage else {
        return Err(CoreError::validation("taskInfo.stage", "stage is required"));
    };

    if current_stage == TaskStage::Failed && incoming_stage == TaskStage::Failed {
        return Ok(Transition::Absorb);
    }

    if current_stage > incoming_stage {
        let duplicate_failure = current_stage == TaskStage::Failed
            && current_sub_stage.is_error()
            && incoming_sub_stage.is_none_or(|sub| sub.is_error());
        if duplicate_failure {
            return Ok(Transition::Absorb);
        }
        return Err(CoreError::InvalidTransition {
            link: link.to_string(),
            message: format!(
                "stage can not move backwards from {} to {}",
                current_stage, incoming_stage
            ),
        });
    }

    if let Some(incoming_sub_stage) = incoming_sub_stage {
        if current_sub_stage > incoming_sub_stage {
            if current_stage != incoming_stage || incoming_sub_stage.is_transient() {
                return Ok(Transition::Absorb);
            }
            return Err(CoreError::InvalidTransition {
                link: link.to_string(),
                message: format!(
                    "subStage can not move backwards from {} to {}",
                    current_sub_stage.name(),
                    incoming_sub_stage.name()
                ),
            });
        }
    }

    Ok(Transition::Apply)
}
