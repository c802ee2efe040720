// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for orchestra-core integration tests.
//!
//! Provides TestContext with a host over an in-memory store and a mock
//! notifier, a couple of demo task kinds and a recording service that stands
//! in for parents and request trackers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use orchestra_core::config::Config;
use orchestra_core::error::{CoreError, Result};
use orchestra_core::host::{Action, Host, Operation, Request, Service, ServiceContext};
use orchestra_core::notifier::MockNotifier;
use orchestra_core::store::MemoryDocumentStore;
use orchestra_core::task::service::StateOf;
use orchestra_core::task::{TaskControl, TaskFactory, TaskHandler};

pub const PROVISION_LINK: &str = "/provisions";
pub const PARKED_LINK: &str = "/parked";

/// Config with short waits so retries and timeouts finish quickly.
pub fn fast_config() -> Config {
    Config {
        public_uri: "http://orchestra.test".to_string(),
        tracker_retry_interval: Duration::from_millis(10),
        notification_retry_count: 2,
        notification_retry_wait: Duration::from_millis(10),
        resume_retry_count: 2,
        resume_retry_wait: Duration::from_millis(10),
        availability_timeout: Duration::from_millis(200),
        ..Config::default()
    }
}

/// Test context holding a host and the mock behind its notifier.
pub struct TestContext {
    pub host: Host,
    pub notifier: MockNotifier,
    pub store: Arc<MemoryDocumentStore>,
}

impl TestContext {
    /// Host with [`fast_config`] and the demo task kinds registered.
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: Config) -> Self {
        let notifier = MockNotifier::new();
        let store = Arc::new(MemoryDocumentStore::new());
        let host = Host::new(config, store.clone(), Arc::new(notifier.clone()));
        host.register_factory(PROVISION_LINK, Arc::new(TaskFactory::new(ProvisionTask)));
        host.register_factory(PARKED_LINK, Arc::new(TaskFactory::new(ParkedTask)));
        Self {
            host,
            notifier,
            store,
        }
    }

    /// Create a task through `factory` and return its address.
    pub async fn create_task(&self, factory: &str, body: Value) -> String {
        let doc = self
            .host
            .send(Operation::post(factory, body))
            .await
            .expect("task creation failed");
        doc["documentSelfLink"]
            .as_str()
            .expect("created task has no link")
            .to_string()
    }

    /// Start a recorder at `link`.
    pub async fn recorder(&self, link: &str) -> Recorder {
        Recorder::start(&self.host, link).await
    }

    pub async fn get(&self, link: &str) -> Result<Value> {
        self.host.send(Operation::get(link)).await
    }

    pub async fn patch(&self, link: &str, body: Value) -> Result<Value> {
        self.host.send(Operation::patch(link, body)).await
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Wait for `link` to report `stage` and return the document.
pub async fn wait_for_stage(host: &Host, link: &str, stage: &str) -> Value {
    for _ in 0..400 {
        if let Ok(doc) = host.send(Operation::get(link)).await {
            if doc["taskInfo"]["stage"] == stage {
                return doc;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{} never reached {}", link, stage);
}

// ============================================================================
// Demo task kinds
// ============================================================================

orchestra_core::sub_stages! {
    pub enum ProvisionSubStage {
        Created => "CREATED",
        Allocating => "ALLOCATING",
        Polling => "POLLING",
        ChildrenDone => "CHILDREN_DONE",
        Completed => "COMPLETED",
        Error => "ERROR",
    }
    created = Created;
    completed = Completed;
    error = Error;
    transient = [Polling];
}

orchestra_core::task_body! {
    pub struct ProvisionBody {
        #[merge(first_write_wins)]
        /// Fail in ALLOCATING with this message.
        pub fail_with: Option<String>,
    }
}

/// CREATED → ALLOCATING → FINISHED, or FAILED when `failWith` is set.
pub struct ProvisionTask;

#[async_trait]
impl TaskHandler for ProvisionTask {
    type SubStage = ProvisionSubStage;
    type Body = ProvisionBody;
    const KIND: &'static str = "ProvisionTask";

    async fn handle_started_stage(&self, task: &TaskControl<Self>, state: &StateOf<Self>) {
        match state.task_sub_stage {
            Some(ProvisionSubStage::Created) => {
                task.proceed_to_sub_stage(ProvisionSubStage::Allocating)
            }
            Some(ProvisionSubStage::Allocating) => match &state.body.fail_with {
                Some(message) => task.fail_task(message, None),
                None => task.complete(),
            },
            Some(ProvisionSubStage::ChildrenDone) => task.complete(),
            Some(ProvisionSubStage::Error) => task.fail_task("Subtask failed", None),
            _ => {}
        }
    }
}

/// Never moves on its own; tests drive it with PATCHes.
pub struct ParkedTask;

#[async_trait]
impl TaskHandler for ParkedTask {
    type SubStage = ProvisionSubStage;
    type Body = ProvisionBody;
    const KIND: &'static str = "ParkedTask";

    async fn handle_started_stage(&self, _task: &TaskControl<Self>, _state: &StateOf<Self>) {}
}

// ============================================================================
// Recorder
// ============================================================================

/// One operation received by a [`Recorder`].
#[derive(Debug, Clone)]
pub struct Received {
    pub action: Action,
    pub body: Value,
    pub locale: Option<String>,
    pub referer: Option<String>,
}

/// Stand-in for a parent task or a request tracker: accepts and records every
/// PATCH and POST.
#[derive(Clone)]
pub struct Recorder {
    pub link: String,
    received: Arc<Mutex<Vec<Received>>>,
}

impl Recorder {
    pub async fn start(host: &Host, link: &str) -> Self {
        let recorder = Self {
            link: link.to_string(),
            received: Arc::new(Mutex::new(Vec::new())),
        };
        host.start_service(
            link,
            Box::new(RecorderService {
                received: recorder.received.clone(),
            }),
            json!({}),
        )
        .await
        .expect("recorder start failed");
        recorder
    }

    pub async fn received(&self) -> Vec<Received> {
        self.received.lock().await.clone()
    }

    /// Wait until at least `count` operations arrived.
    pub async fn wait_for(&self, count: usize) -> Vec<Received> {
        let received = self.received.clone();
        let arrived = wait_until(|| {
            let received = received.clone();
            async move { received.lock().await.len() >= count }
        })
        .await;
        assert!(arrived, "{} did not receive {} operations", self.link, count);
        self.received().await
    }
}

struct RecorderService {
    received: Arc<Mutex<Vec<Received>>>,
}

impl RecorderService {
    async fn record(&self, request: Request) {
        let Request { op, responder } = request;
        self.received.lock().await.push(Received {
            action: op.action,
            locale: op.header("accept-language").map(str::to_string),
            referer: op.referer.clone(),
            body: op.body,
        });
        responder.complete(json!({}));
    }
}

#[async_trait]
impl Service for RecorderService {
    fn kind(&self) -> &'static str {
        "test-recorder"
    }

    fn document(&self) -> Value {
        json!({})
    }

    async fn handle_create(&mut self, ctx: &ServiceContext, _op: &Operation) -> Result<()> {
        ctx.create_document(self.kind(), self.document(), None)
            .await
            .map(|_| ())
    }

    async fn handle_patch(&mut self, _ctx: &ServiceContext, request: Request) {
        self.record(request).await;
    }

    async fn handle_post(&mut self, _ctx: &ServiceContext, request: Request) {
        self.record(request).await;
    }
}

// ============================================================================
// Flaky tracker
// ============================================================================

/// Request tracker that rejects the first `failures` PATCHes of every
/// `STAGE/subStage` status it is sent, and counts the attempts.
#[derive(Clone)]
pub struct FlakyTracker {
    pub link: String,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
}

impl FlakyTracker {
    pub async fn start(host: &Host, link: &str, failures: u32) -> Self {
        let tracker = Self {
            link: link.to_string(),
            attempts: Arc::new(Mutex::new(HashMap::new())),
        };
        host.start_service(
            link,
            Box::new(FlakyTrackerService {
                failures,
                attempts: tracker.attempts.clone(),
            }),
            json!({}),
        )
        .await
        .expect("tracker start failed");
        tracker
    }

    /// Attempts so far for `key` (`STAGE/subStage`).
    pub async fn attempts(&self, key: &str) -> u32 {
        self.attempts.lock().await.get(key).copied().unwrap_or(0)
    }

    pub async fn all_attempts(&self) -> HashMap<String, u32> {
        self.attempts.lock().await.clone()
    }
}

struct FlakyTrackerService {
    failures: u32,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
}

#[async_trait]
impl Service for FlakyTrackerService {
    fn kind(&self) -> &'static str {
        "test-flaky-tracker"
    }

    fn document(&self) -> Value {
        json!({})
    }

    async fn handle_create(&mut self, ctx: &ServiceContext, _op: &Operation) -> Result<()> {
        ctx.create_document(self.kind(), self.document(), None)
            .await
            .map(|_| ())
    }

    async fn handle_patch(&mut self, ctx: &ServiceContext, request: Request) {
        let Request { op, responder } = request;
        let key = format!(
            "{}/{}",
            op.body["taskInfo"]["stage"].as_str().unwrap_or(""),
            op.body["subStage"].as_str().unwrap_or("")
        );
        let attempt = {
            let mut attempts = self.attempts.lock().await;
            let count = attempts.entry(key).or_insert(0);
            *count += 1;
            *count
        };
        if attempt <= self.failures {
            responder.fail(CoreError::ServiceUnavailable {
                link: ctx.link().to_string(),
            });
        } else {
            responder.complete(json!({}));
        }
    }
}
