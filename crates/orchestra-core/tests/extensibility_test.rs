// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Extensibility checkpoint tests through a full runtime: async and blocking
//! subscriptions, resume, timeout and the subscription registry.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use common::{
    PROVISION_LINK, ProvisionSubStage, ProvisionTask, Recorder, fast_config, wait_for_stage,
    wait_until,
};
use orchestra_core::config::Config;
use orchestra_core::extensibility::{ExtensibilitySubscription, SubscriptionRegistry};
use orchestra_core::host::Operation;
use orchestra_core::notifier::MockNotifier;
use orchestra_core::runtime::OrchestraRuntime;
use orchestra_core::store::MemoryDocumentStore;
use orchestra_core::task::{TaskCallback, TaskFactory, TaskStage};

const HOOK: &str = "https://hooks.test/provision";
const CHECKPOINT_KEY: &str = "ProvisionTask:STARTED:ALLOCATING";

struct Harness {
    runtime: OrchestraRuntime,
    notifier: MockNotifier,
    store: Arc<MemoryDocumentStore>,
}

impl Harness {
    async fn start(subscription: Option<ExtensibilitySubscription>, config: Config) -> Self {
        let notifier = MockNotifier::new();
        let store = Arc::new(MemoryDocumentStore::new());
        if let Some(subscription) = subscription {
            SubscriptionRegistry::register(store.as_ref(), &subscription)
                .await
                .unwrap();
        }

        let runtime = OrchestraRuntime::builder()
            .config(config)
            .store(store.clone())
            .notifier(Arc::new(notifier.clone()))
            .without_reaper()
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        runtime.register_task_factory(PROVISION_LINK, TaskFactory::new(ProvisionTask));

        Self {
            runtime,
            notifier,
            store,
        }
    }

    async fn create_task(&self, body: Value) -> String {
        let doc = self
            .runtime
            .host()
            .send(Operation::post(PROVISION_LINK, body))
            .await
            .unwrap();
        doc["documentSelfLink"].as_str().unwrap().to_string()
    }

    /// Wait for `count` notifications to the hook and return them.
    async fn hook_calls(&self, count: usize) -> Vec<Value> {
        let notifier = self.notifier.clone();
        assert!(
            wait_until(|| {
                let notifier = notifier.clone();
                async move { notifier.deliveries_to(HOOK).await.len() >= count }
            })
            .await,
            "subscriber was not notified"
        );
        self.notifier
            .deliveries_to(HOOK)
            .await
            .into_iter()
            .map(|d| d.body)
            .collect()
    }

    /// Record address from the `serviceCallback` of a blocking notification.
    fn record_link(&self, envelope: &Value) -> String {
        let callback = envelope["serviceCallback"].as_str().unwrap();
        callback
            .strip_prefix(&self.runtime.host().config().public_uri)
            .unwrap()
            .to_string()
    }

    async fn get(&self, link: &str) -> Value {
        self.runtime
            .host()
            .send(Operation::get(link))
            .await
            .unwrap()
    }
}

fn subscription(blocking: bool) -> ExtensibilitySubscription {
    ExtensibilitySubscription {
        task: "ProvisionTask".to_string(),
        stage: TaskStage::Started,
        sub_stage: "ALLOCATING".to_string(),
        callback_reference: HOOK.to_string(),
        blocking,
        topic_id: None,
    }
}

#[tokio::test]
async fn test_async_subscriber_is_notified_and_task_continues() {
    let h = Harness::start(Some(subscription(false)), fast_config()).await;
    let link = h
        .create_task(json!({ "customProperties": { "_secret": "s", "visible": "v" } }))
        .await;

    let doc = wait_for_stage(h.runtime.host(), &link, "FINISHED").await;
    assert!(doc["customProperties"][CHECKPOINT_KEY].is_string());

    let calls = h.hook_calls(1).await;
    assert_eq!(calls[0]["documentSelfLink"], link.as_str());
    assert_eq!(calls[0]["taskInfo"]["stage"], "STARTED");
    assert_eq!(calls[0]["taskSubStage"], "ALLOCATING");
    assert_eq!(calls[0]["customProperties"]["visible"], "v");
    assert!(calls[0]["customProperties"].get("_secret").is_none());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.notifier.deliveries_to(HOOK).await.len(), 1);
    h.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_blocking_checkpoint_waits_for_resume() {
    let h = Harness::start(Some(subscription(true)), fast_config()).await;
    let link = h.create_task(json!({})).await;

    let calls = h.hook_calls(1).await;
    let envelope = &calls[0];
    assert_eq!(envelope["taskStateClassName"], "ProvisionTask");
    assert_eq!(envelope["notificationPayload"]["taskSubStage"], "ALLOCATING");
    assert!(envelope["replyPayload"]["customProperties"].is_object());
    let record = h.record_link(envelope);

    // Suspended: the ALLOCATING hook has not run
    tokio::time::sleep(Duration::from_millis(30)).await;
    let doc = h.get(&link).await;
    assert_eq!(doc["taskInfo"]["stage"], "STARTED");
    assert_eq!(doc["taskSubStage"], "ALLOCATING");
    assert_eq!(h.get(&record).await["status"], "BLOCKED");

    let resumed = h
        .runtime
        .host()
        .send(Operation::post(
            record.clone(),
            json!({ "replyPayload": { "customProperties": { "approved": "yes" } } }),
        ))
        .await
        .unwrap();
    assert_eq!(resumed["status"], "RESUME");

    let doc = wait_for_stage(h.runtime.host(), &link, "FINISHED").await;
    assert_eq!(doc["customProperties"]["approved"], "yes");

    let host = h.runtime.host().clone();
    let done = record.clone();
    assert!(wait_until(|| {
        let host = host.clone();
        let record = done.clone();
        async move {
            host.send(Operation::get(record))
                .await
                .is_ok_and(|doc| doc["status"] == "DONE")
        }
    })
    .await);

    // The checkpoint fired once, though the task passed ALLOCATING again
    assert_eq!(h.notifier.deliveries_to(HOOK).await.len(), 1);
    h.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_processed_record_rejects_changes() {
    let h = Harness::start(Some(subscription(true)), fast_config()).await;
    let link = h.create_task(json!({})).await;
    let record = h.record_link(&h.hook_calls(1).await[0]);

    let other = json!({
        "serviceTaskCallback": {
            "serviceSelfLink": "/somewhere/else",
            "taskStageComplete": "STARTED",
            "taskStageFailed": "FAILED"
        }
    });
    let err = h
        .runtime
        .host()
        .send(Operation::patch(record.clone(), other))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    h.runtime
        .host()
        .send(Operation::post(record.clone(), json!({})))
        .await
        .unwrap();
    wait_for_stage(h.runtime.host(), &link, "FINISHED").await;

    let host = h.runtime.host().clone();
    let done = record.clone();
    assert!(wait_until(|| {
        let host = host.clone();
        let record = done.clone();
        async move {
            host.send(Operation::get(record))
                .await
                .is_ok_and(|doc| doc["status"] == "DONE")
        }
    })
    .await);

    let err = h
        .runtime
        .host()
        .send(Operation::post(
            record.clone(),
            json!({ "replyPayload": { "late": true } }),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 409);
    assert_eq!(err.to_string(), "Notification has already been processed.");

    // Re-marking DONE is absorbed
    h.runtime
        .host()
        .send(Operation::patch(record, json!({ "status": "DONE" })))
        .await
        .unwrap();
    h.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_blocking_checkpoint_times_out() {
    let config = Config {
        extensibility_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let h = Harness::start(Some(subscription(true)), config).await;
    let link = h.create_task(json!({})).await;
    let record = h.record_link(&h.hook_calls(1).await[0]);

    let doc = wait_for_stage(h.runtime.host(), &link, "FAILED").await;
    assert_eq!(doc["taskSubStage"], "ERROR");
    assert!(
        doc["taskInfo"]["failure"]["message"]
            .as_str()
            .unwrap()
            .contains("timed out")
    );

    let record_doc = h.get(&record).await;
    assert_eq!(record_doc["status"], "DONE");

    // A resume arriving after the timeout loses
    let err = h
        .runtime
        .host()
        .send(Operation::post(record, json!({ "replyPayload": {} })))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 409);
    h.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_timeout_flag_in_patch_body_is_ignored() {
    let h = Harness::start(Some(subscription(true)), fast_config()).await;
    let link = h.create_task(json!({})).await;
    let record = h.record_link(&h.hook_calls(1).await[0]);

    h.runtime
        .host()
        .send(Operation::patch(record.clone(), json!({ "timedOut": true })))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.get(&record).await["status"], "BLOCKED");
    let doc = h.get(&link).await;
    assert_eq!(doc["taskInfo"]["stage"], "STARTED");
    assert_eq!(doc["taskSubStage"], "ALLOCATING");
    h.runtime.shutdown().await.unwrap();
}

fn terminal_subscription(stage: TaskStage, sub_stage: &str) -> ExtensibilitySubscription {
    ExtensibilitySubscription {
        stage,
        sub_stage: sub_stage.to_string(),
        ..subscription(true)
    }
}

#[tokio::test]
async fn test_blocking_subscription_on_failure_only_notifies() {
    let h = Harness::start(
        Some(terminal_subscription(TaskStage::Failed, "ERROR")),
        fast_config(),
    )
    .await;
    let parent = Recorder::start(h.runtime.host(), "/parents/x").await;
    let callback = TaskCallback::create(
        &parent.link,
        TaskStage::Started,
        ProvisionSubStage::ChildrenDone,
        TaskStage::Started,
        ProvisionSubStage::Error,
    )
    .unwrap();
    let link = h
        .create_task(json!({ "serviceTaskCallback": callback, "failWith": "no capacity" }))
        .await;

    let received = parent.wait_for(1).await;
    assert_eq!(received[0].body["taskSubStage"], "ERROR");
    assert_eq!(received[0].body["taskInfo"]["failure"]["message"], "no capacity");

    let calls = h.hook_calls(1).await;
    assert!(calls[0].get("serviceCallback").is_none());
    assert_eq!(calls[0]["taskInfo"]["stage"], "FAILED");

    let doc = wait_for_stage(h.runtime.host(), &link, "FAILED").await;
    assert_eq!(doc["taskSubStage"], "ERROR");

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(parent.received().await.len(), 1);
    assert_eq!(h.notifier.deliveries_to(HOOK).await.len(), 1);
    h.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_undeliverable_notification_leaves_finished_task_alone() {
    let h = Harness::start(
        Some(terminal_subscription(TaskStage::Finished, "COMPLETED")),
        fast_config(),
    )
    .await;
    h.notifier.fail_next(2);
    let link = h.create_task(json!({})).await;

    wait_for_stage(h.runtime.host(), &link, "FINISHED").await;
    let notifier = h.notifier.clone();
    assert!(wait_until(|| {
        let notifier = notifier.clone();
        async move { notifier.deliveries_to(HOOK).await.len() == 2 }
    })
    .await);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let doc = h.get(&link).await;
    assert_eq!(doc["taskInfo"]["stage"], "FINISHED");
    assert_eq!(doc["taskSubStage"], "COMPLETED");
    h.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_topic_timeout_from_custom_property() {
    let mut blocking = subscription(true);
    blocking.topic_id = Some("provision.requested".to_string());
    let h = Harness::start(Some(blocking), fast_config()).await;
    let link = h
        .create_task(json!({ "customProperties": { "provision.requested.timeout": "0" } }))
        .await;

    let doc = wait_for_stage(h.runtime.host(), &link, "FAILED").await;
    assert_eq!(doc["taskSubStage"], "ERROR");
    h.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_undeliverable_blocking_notification_fails_task() {
    let h = Harness::start(Some(subscription(true)), fast_config()).await;
    h.notifier.fail_next(2);
    let link = h.create_task(json!({})).await;

    let doc = wait_for_stage(h.runtime.host(), &link, "FAILED").await;
    assert_eq!(doc["taskSubStage"], "ERROR");
    assert_eq!(doc["taskInfo"]["failure"]["errorCode"], "DELIVERY_FAILED");

    let attempts = h.notifier.deliveries_to(HOOK).await;
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|d| !d.succeeded));
    h.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_opted_out_tasks_and_removed_subscriptions_skip_the_gate() {
    let h = Harness::start(None, fast_config()).await;
    let registry = h.runtime.registry().unwrap().clone();

    let link = SubscriptionRegistry::register(h.store.as_ref(), &subscription(true))
        .await
        .unwrap();
    let watched = registry.clone();
    assert!(wait_until(|| {
        let registry = watched.clone();
        async move { registry.len() == 1 }
    })
    .await);

    assert!(SubscriptionRegistry::unregister(h.store.as_ref(), &link).await.unwrap());
    let watched = registry.clone();
    assert!(wait_until(|| {
        let registry = watched.clone();
        async move { registry.is_empty() }
    })
    .await);

    // No subscription left: the task runs straight through
    let task = h.create_task(json!({})).await;
    let doc = wait_for_stage(h.runtime.host(), &task, "FINISHED").await;
    assert!(doc["customProperties"].get(CHECKPOINT_KEY).is_none());
    assert!(h.notifier.deliveries().await.is_empty());
    h.runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_default_timeout_elapses_on_paused_clock() {
    let h = Harness::start(Some(subscription(true)), fast_config()).await;
    let link = h.create_task(json!({})).await;
    let record = h.record_link(&h.hook_calls(1).await[0]);

    // Just short of the default timeout the task is still waiting
    tokio::time::sleep(h.runtime.host().config().extensibility_timeout - Duration::from_secs(60))
        .await;
    assert_eq!(h.get(&link).await["taskInfo"]["stage"], "STARTED");
    assert_eq!(h.get(&record).await["status"], "BLOCKED");

    tokio::time::sleep(Duration::from_secs(120)).await;
    let doc = wait_for_stage(h.runtime.host(), &link, "FAILED").await;
    assert_eq!(doc["taskSubStage"], "ERROR");
    assert_eq!(h.get(&record).await["status"], "DONE");
    h.runtime.shutdown().await.unwrap();
}
