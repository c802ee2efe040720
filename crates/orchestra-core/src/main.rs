// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestra Core - demo binary
//!
//! Runs one parent task that fans out to a configurable number of child
//! tasks, waits for them through a counter barrier and finishes. Useful for
//! watching the stage machine and the barrier in the logs:
//!
//! ```text
//! RUST_LOG=orchestra_core=debug cargo run -- 5
//! ```

use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{error, info};

use orchestra_core::config::Config;
use orchestra_core::host::Operation;
use orchestra_core::runtime::OrchestraRuntime;
use orchestra_core::task::service::StateOf;
use orchestra_core::task::{EmptyBody, TaskControl, TaskFactory, TaskHandler};

const FAN_OUT_LINK: &str = "/demo/fan-out";
const CHILD_LINK: &str = "/demo/children";

orchestra_core::sub_stages! {
    enum FanOutSubStage {
        Created => "CREATED",
        Collected => "COLLECTED",
        Completed => "COMPLETED",
        Error => "ERROR",
    }
    created = Created;
    completed = Completed;
    error = Error;
}

orchestra_core::sub_stages! {
    enum ChildSubStage {
        Created => "CREATED",
        Working => "WORKING",
        Completed => "COMPLETED",
        Error => "ERROR",
    }
    created = Created;
    completed = Completed;
    error = Error;
}

orchestra_core::task_body! {
    struct FanOutBody {
        #[merge(first_write_wins)]
        child_count: Option<u64>,
    }
}

/// Starts `childCount` children and waits for all of them.
struct FanOutTask;

#[async_trait]
impl TaskHandler for FanOutTask {
    type SubStage = FanOutSubStage;
    type Body = FanOutBody;
    const KIND: &'static str = "FanOutTask";

    async fn handle_started_stage(&self, task: &TaskControl<Self>, state: &StateOf<Self>) {
        match state.task_sub_stage {
            Some(FanOutSubStage::Created) => {
                let count = state.body.child_count.unwrap_or(1).max(1);
                let Some(callback) = task
                    .create_counter_subtask_callback(count, false, FanOutSubStage::Collected, true)
                    .await
                else {
                    return;
                };
                for _ in 0..count {
                    let child = json!({ "serviceTaskCallback": callback });
                    if let Err(e) = task.send(Operation::post(CHILD_LINK, child)).await {
                        task.fail_task("Failure starting child task", Some(&e));
                        return;
                    }
                }
                info!(task = %task.link(), count, "Children started");
            }
            Some(FanOutSubStage::Collected) => task.complete(),
            Some(FanOutSubStage::Error) => {
                task.fail_task("Child task failed", None);
            }
            _ => {}
        }
    }
}

/// Does one step of pretend work and finishes.
struct ChildTask;

#[async_trait]
impl TaskHandler for ChildTask {
    type SubStage = ChildSubStage;
    type Body = EmptyBody;
    const KIND: &'static str = "ChildTask";

    async fn handle_started_stage(&self, task: &TaskControl<Self>, state: &StateOf<Self>) {
        match state.task_sub_stage {
            Some(ChildSubStage::Created) => task.proceed_to_sub_stage(ChildSubStage::Working),
            Some(ChildSubStage::Working) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                task.complete();
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("orchestra_core=info".parse()?),
        )
        .init();

    info!("Starting Orchestra Core demo");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    let child_count: u64 = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 3,
    };

    let runtime = OrchestraRuntime::builder()
        .config(config)
        .build()?
        .start()
        .await?;
    runtime.register_task_factory(FAN_OUT_LINK, TaskFactory::new(FanOutTask));
    runtime.register_task_factory(CHILD_LINK, TaskFactory::new(ChildTask).self_delete());

    let parent = runtime
        .host()
        .send(Operation::post(
            FAN_OUT_LINK,
            json!({ "documentSelfLink": "demo", "childCount": child_count }),
        ))
        .await?;
    let parent_link = parent["documentSelfLink"]
        .as_str()
        .unwrap_or(FAN_OUT_LINK)
        .to_string();
    info!(task = %parent_link, child_count, "Parent task created");

    let outcome = wait_for_terminal(&runtime, &parent_link).await;
    runtime.shutdown().await?;

    let doc = outcome?;
    info!(
        task = %parent_link,
        stage = %doc["taskInfo"]["stage"],
        sub_stage = %doc["taskSubStage"],
        "Demo complete"
    );
    Ok(())
}

async fn wait_for_terminal(runtime: &OrchestraRuntime, link: &str) -> Result<Value> {
    for _ in 0..600 {
        let doc = runtime.host().send(Operation::get(link)).await?;
        match doc["taskInfo"]["stage"].as_str() {
            Some("FINISHED") | Some("FAILED") | Some("CANCELLED") => return Ok(doc),
            _ => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    bail!("{} did not reach a terminal stage", link)
}
