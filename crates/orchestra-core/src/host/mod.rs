// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Document service host.
//!
//! Every document address is owned by exactly one service actor: a tokio task
//! that drains its inbox one [`Operation`] at a time. This gives each
//! document a single writer, so services mutate their state without locks.
//!
//! ```text
//!   Host::send(op) ──► services[link] ──► inbox (mpsc) ──► actor loop
//!        ▲                                                    │
//!        └──────────────── oneshot reply ◄──── Responder ◄────┘
//! ```
//!
//! A POST to a registered factory link creates a new actor. Operations sent
//! to an address that is not (yet) registered fail with `DocumentNotFound`
//! unless the sender asked to wait for availability.

pub mod reaper;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::notifier::{Notifier, is_external};
use crate::store::{Document, DocumentStore};

pub use self::reaper::{ExpirationReaper, ExpirationReaperConfig};

/// Header carrying the caller's locale.
pub const ACCEPT_LANGUAGE: &str = "accept-language";

// ============================================================================
// Operations
// ============================================================================

/// Operation verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Read the current document.
    Get,
    /// Create through a factory, or service-specific action.
    Post,
    /// Partial update.
    Patch,
    /// Remove the document and stop its service.
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        })
    }
}

/// A request addressed to a document service.
#[derive(Debug, Clone)]
pub struct Operation {
    /// The verb.
    pub action: Action,
    /// Target address.
    pub link: String,
    /// JSON body (`Null` when absent).
    pub body: Value,
    /// Request headers, keys lower-cased.
    pub headers: HashMap<String, String>,
    /// Address of the sender, when sent by another service.
    pub referer: Option<String>,
    /// Wait for the target to be registered instead of failing fast.
    pub wait_for_availability: bool,
}

impl Operation {
    /// Create an operation.
    pub fn new(action: Action, link: impl Into<String>, body: Value) -> Self {
        Self {
            action,
            link: link.into(),
            body,
            headers: HashMap::new(),
            referer: None,
            wait_for_availability: false,
        }
    }

    /// GET `link`.
    pub fn get(link: impl Into<String>) -> Self {
        Self::new(Action::Get, link, Value::Null)
    }

    /// POST `body` to `link`.
    pub fn post(link: impl Into<String>, body: Value) -> Self {
        Self::new(Action::Post, link, body)
    }

    /// PATCH `body` to `link`.
    pub fn patch(link: impl Into<String>, body: Value) -> Self {
        Self::new(Action::Patch, link, body)
    }

    /// DELETE `link`.
    pub fn delete(link: impl Into<String>) -> Self {
        Self::new(Action::Delete, link, Value::Null)
    }

    /// Set a header (the name is lower-cased).
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Copy every header from `headers`.
    pub fn with_headers(mut self, headers: &HashMap<String, String>) -> Self {
        for (name, value) in headers {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    /// Set the sender address.
    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    /// Queue the operation until the target address is registered.
    pub fn wait_for_availability(mut self) -> Self {
        self.wait_for_availability = true;
        self
    }

    /// Look up a header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Deserialize the body.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Answers an operation exactly once.
///
/// Dropping a responder without answering reports [`CoreError::Cancelled`]
/// to the sender.
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<Result<Value>>,
}

impl Responder {
    fn new(tx: oneshot::Sender<Result<Value>>) -> Self {
        Self { tx }
    }

    /// Complete the operation with a response body.
    pub fn complete(self, body: Value) {
        // The sender may have stopped waiting
        let _ = self.tx.send(Ok(body));
    }

    /// Fail the operation.
    pub fn fail(self, err: CoreError) {
        let _ = self.tx.send(Err(err));
    }

    /// Complete or fail depending on `result`.
    pub fn reply(self, result: Result<Value>) {
        let _ = self.tx.send(result);
    }
}

/// An operation together with the means to answer it.
#[derive(Debug)]
pub struct Request {
    /// The operation.
    pub op: Operation,
    /// Its responder.
    pub responder: Responder,
}

// ============================================================================
// Services
// ============================================================================

/// A document service: owns one document and processes its operations
/// sequentially.
///
/// Handlers receive the [`Request`] and must answer it before running side
/// effects that may take long or address other services.
#[async_trait]
pub trait Service: Send + 'static {
    /// Document kind recorded in the store.
    fn kind(&self) -> &'static str;

    /// Current document body.
    fn document(&self) -> Value;

    /// Validate the creating POST, initialize state and persist the document.
    ///
    /// An error fails the POST and stops the service.
    async fn handle_create(&mut self, ctx: &ServiceContext, op: &Operation) -> Result<()>;

    /// Runs right after a successful create; answers the creating POST.
    async fn handle_start(&mut self, _ctx: &ServiceContext, request: Request) {
        request.responder.complete(self.document());
    }

    /// GET: answers with the current document.
    async fn handle_get(&mut self, _ctx: &ServiceContext, request: Request) {
        request.responder.complete(self.document());
    }

    /// PATCH.
    async fn handle_patch(&mut self, ctx: &ServiceContext, request: Request) {
        request.responder.fail(CoreError::validation(
            "action",
            format!("PATCH is not supported by {}", ctx.link()),
        ));
    }

    /// POST to the service's own address.
    async fn handle_post(&mut self, ctx: &ServiceContext, request: Request) {
        request.responder.fail(CoreError::validation(
            "action",
            format!("POST is not supported by {}", ctx.link()),
        ));
    }

    /// Runs before the document is removed; an error rejects the delete.
    async fn handle_delete(&mut self, _ctx: &ServiceContext, _op: &Operation) -> Result<()> {
        Ok(())
    }

    /// A timer set with [`ServiceContext::schedule_timer`] fired.
    async fn handle_timer(&mut self, _ctx: &ServiceContext) {}
}

/// Creates services for POSTs sent to a factory link.
pub trait ServiceFactory: Send + Sync + 'static {
    /// Pick the new document's link and build its service.
    fn create_service(&self, factory_link: &str, op: &Operation)
    -> Result<(String, Box<dyn Service>)>;
}

/// Link for a document created through `factory_link`.
///
/// Honors a `documentSelfLink` in the body when it lives under the factory,
/// otherwise generates one.
pub fn child_link(factory_link: &str, op: &Operation) -> Result<String> {
    match op.body.get("documentSelfLink").and_then(Value::as_str) {
        Some(link) if link.starts_with(&format!("{}/", factory_link)) => Ok(link.to_string()),
        Some(link) if !link.contains('/') && !link.is_empty() => {
            Ok(format!("{}/{}", factory_link, link))
        }
        Some(link) => Err(CoreError::validation(
            "documentSelfLink",
            format!("'{}' is not under factory '{}'", link, factory_link),
        )),
        None => Ok(format!("{}/{}", factory_link, Uuid::new_v4())),
    }
}

/// Per-actor handle onto the host.
pub struct ServiceContext {
    host: Host,
    link: String,
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("link", &self.link)
            .finish()
    }
}

impl ServiceContext {
    /// Address of the owning service.
    pub fn link(&self) -> &str {
        &self.link
    }

    /// The host.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Host configuration.
    pub fn config(&self) -> &Config {
        self.host.config()
    }

    /// Persist the initial document.
    pub async fn create_document(
        &self,
        kind: &str,
        body: Value,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<Document> {
        self.host
            .store()
            .create(&self.link, kind, body, expiration)
            .await
    }

    /// Write the document through to the store.
    pub async fn update_document(
        &self,
        expected_version: u64,
        body: Value,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<Document> {
        self.host
            .store()
            .update(&self.link, Some(expected_version), body, expiration)
            .await
    }

    /// Bump a named statistic of this service.
    pub fn adjust_stat(&self, name: &str, delta: i64) {
        self.host.stats().adjust(&self.link, name, delta);
    }

    /// Send an operation to this service's own inbox without waiting.
    pub fn send_self(&self, op: Operation) {
        self.host.spawn_send(op.with_referer(self.link.clone()));
    }

    /// Call this service's [`Service::handle_timer`] after `delay`.
    pub fn schedule_timer(&self, delay: Duration) {
        self.host.schedule_timer(self.link.clone(), delay);
    }
}

/// Absolute deadline `delay` from now.
pub fn deadline_after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ============================================================================
// Statistics
// ============================================================================

/// Named per-service counters.
#[derive(Debug, Default)]
pub struct Stats {
    counters: DashMap<(String, String), i64>,
}

impl Stats {
    /// Add `delta` to the counter `name` of `link`.
    pub fn adjust(&self, link: &str, name: &str, delta: i64) {
        *self
            .counters
            .entry((link.to_string(), name.to_string()))
            .or_insert(0) += delta;
    }

    /// Current value of the counter, 0 when never adjusted.
    pub fn get(&self, link: &str, name: &str) -> i64 {
        self.counters
            .get(&(link.to_string(), name.to_string()))
            .map(|v| *v)
            .unwrap_or(0)
    }
}

// ============================================================================
// Host
// ============================================================================

enum Envelope {
    Start(Request),
    Op(Request),
    /// Wake-up from [`Host::schedule_timer`].
    Timer,
}

#[derive(Clone)]
struct ServiceHandle {
    id: u64,
    inbox: mpsc::UnboundedSender<Envelope>,
}

struct HostInner {
    config: Config,
    store: Arc<dyn DocumentStore>,
    notifier: Arc<dyn Notifier>,
    services: DashMap<String, ServiceHandle>,
    factories: DashMap<String, Arc<dyn ServiceFactory>>,
    registered: Notify,
    next_id: AtomicU64,
    stats: Stats,
}

/// Routes operations to service actors. Cheap to clone.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("services", &self.inner.services.len())
            .field("factories", &self.inner.factories.len())
            .finish()
    }
}

impl Host {
    /// Create a host over a store and an external notifier.
    pub fn new(config: Config, store: Arc<dyn DocumentStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            inner: Arc::new(HostInner {
                config,
                store,
                notifier,
                services: DashMap::new(),
                factories: DashMap::new(),
                registered: Notify::new(),
                next_id: AtomicU64::new(1),
                stats: Stats::default(),
            }),
        }
    }

    /// Host configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The document store.
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    /// The external notifier.
    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.inner.notifier
    }

    /// Service statistics.
    pub fn stats(&self) -> &Stats {
        &self.inner.stats
    }

    /// Register a factory; POSTs to `link` create new services.
    pub fn register_factory(&self, link: impl Into<String>, factory: Arc<dyn ServiceFactory>) {
        let link = link.into();
        debug!(factory = %link, "Factory registered");
        self.inner.factories.insert(link, factory);
        self.inner.registered.notify_waiters();
    }

    /// Whether a live service owns `link`.
    pub fn is_running(&self, link: &str) -> bool {
        self.inner.services.contains_key(link)
    }

    /// Links of all live services.
    pub fn running_links(&self) -> Vec<String> {
        self.inner.services.iter().map(|e| e.key().clone()).collect()
    }

    /// Send an operation and wait for its reply.
    pub async fn send(&self, op: Operation) -> Result<Value> {
        let link = op.link.clone();
        let (tx, rx) = oneshot::channel();
        self.dispatch(op, Responder::new(tx)).await;
        rx.await
            .unwrap_or_else(|_| Err(CoreError::Cancelled { link }))
    }

    /// Send an operation without waiting; failures are logged.
    pub fn spawn_send(&self, op: Operation) {
        let host = self.clone();
        tokio::spawn(async move {
            let action = op.action;
            let link = op.link.clone();
            if let Err(e) = host.send(op).await {
                warn!(action = %action, link = %link, error = %e, "Fire-and-forget operation failed");
            }
        });
    }

    /// Run `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }

    /// Wake the service at `link` through [`Service::handle_timer`] after
    /// `delay`. Dropped if the service is gone by then.
    pub fn schedule_timer(&self, link: impl Into<String>, delay: Duration) {
        let host = self.clone();
        let link = link.into();
        self.schedule(delay, async move {
            match host.lookup(&link) {
                Some(handle) => {
                    let _ = handle.inbox.send(Envelope::Timer);
                }
                None => debug!(link = %link, "Timer fired for a stopped service"),
            }
        });
    }

    /// Deliver `body` to `address`: absolute URLs go through the notifier as
    /// a POST, internal links receive `action` through the host.
    pub async fn deliver(
        &self,
        action: Action,
        address: &str,
        body: Value,
        headers: &HashMap<String, String>,
    ) -> Result<()> {
        if is_external(address) {
            return self.inner.notifier.post(address, &body).await;
        }
        self.send(Operation::new(action, address, body).with_headers(headers))
            .await
            .map(|_| ())
    }

    /// Start `service` at `link` as if it had been POSTed with `body`.
    pub async fn start_service(
        &self,
        link: impl Into<String>,
        service: Box<dyn Service>,
        body: Value,
    ) -> Result<Value> {
        let op = Operation::post(link, body);
        let (tx, rx) = oneshot::channel();
        let link = op.link.clone();
        self.spawn_service(op.link.clone(), service, Request {
            op,
            responder: Responder::new(tx),
        });
        rx.await
            .unwrap_or_else(|_| Err(CoreError::Cancelled { link }))
    }

    /// Wait until `link` is served, up to the availability timeout.
    pub async fn wait_for_service(&self, link: &str) -> Result<()> {
        self.await_registration(link)
            .await
            .map(|_| ())
            .ok_or_else(|| CoreError::ServiceUnavailable {
                link: link.to_string(),
            })
    }

    async fn dispatch(&self, op: Operation, responder: Responder) {
        if op.action == Action::Post {
            let factory = self
                .inner
                .factories
                .get(&op.link)
                .map(|f| Arc::clone(f.value()));
            if let Some(factory) = factory {
                match factory.create_service(&op.link, &op) {
                    Ok((link, service)) => {
                        self.spawn_service(link, service, Request { op, responder })
                    }
                    Err(e) => responder.fail(e),
                }
                return;
            }
        }

        let handle = match self.lookup(&op.link) {
            Some(handle) => handle,
            None if op.wait_for_availability => match self.await_registration(&op.link).await {
                Some(handle) => handle,
                None => {
                    return responder.fail(CoreError::ServiceUnavailable { link: op.link });
                }
            },
            None => {
                return responder.fail(CoreError::DocumentNotFound { link: op.link });
            }
        };

        if let Err(mpsc::error::SendError(envelope)) =
            handle.inbox.send(Envelope::Op(Request { op, responder }))
        {
            // Actor stopped between lookup and send
            if let Envelope::Op(request) | Envelope::Start(request) = envelope {
                let link = request.op.link.clone();
                request.responder.fail(CoreError::DocumentNotFound { link });
            }
        }
    }

    fn lookup(&self, link: &str) -> Option<ServiceHandle> {
        self.inner.services.get(link).map(|h| h.value().clone())
    }

    async fn await_registration(&self, link: &str) -> Option<ServiceHandle> {
        let deadline = tokio::time::Instant::now() + self.inner.config.availability_timeout;
        loop {
            let registered = self.inner.registered.notified();
            if let Some(handle) = self.lookup(link) {
                return Some(handle);
            }
            if tokio::time::timeout_at(deadline, registered).await.is_err() {
                return self.lookup(link);
            }
        }
    }

    fn spawn_service(&self, link: String, service: Box<dyn Service>, request: Request) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        match self.inner.services.entry(link.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                request
                    .responder
                    .fail(CoreError::DocumentAlreadyExists { link });
                return;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ServiceHandle {
                    id,
                    inbox: inbox.clone(),
                });
            }
        }

        // Start is first in the inbox so it runs before anything queued later
        let _ = inbox.send(Envelope::Start(request));
        debug!(link = %link, kind = service.kind(), "Service started");
        tokio::spawn(run_service(self.clone(), link, id, service, rx));
        self.inner.registered.notify_waiters();
    }

    fn unregister(&self, link: &str, id: u64) {
        self.inner.services.remove_if(link, |_, handle| handle.id == id);
    }
}

async fn run_service(
    host: Host,
    link: String,
    id: u64,
    mut service: Box<dyn Service>,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
) {
    let ctx = ServiceContext {
        host: host.clone(),
        link: link.clone(),
    };

    while let Some(envelope) = inbox.recv().await {
        match envelope {
            Envelope::Start(Request { op, responder }) => {
                if let Err(e) = service.handle_create(&ctx, &op).await {
                    warn!(link = %link, error = %e, "Service create rejected");
                    responder.fail(e);
                    break;
                }
                service.handle_start(&ctx, Request { op, responder }).await;
            }
            Envelope::Op(request) => match request.op.action {
                Action::Get => service.handle_get(&ctx, request).await,
                Action::Patch => service.handle_patch(&ctx, request).await,
                Action::Post => service.handle_post(&ctx, request).await,
                Action::Delete => {
                    let Request { op, responder } = request;
                    match service.handle_delete(&ctx, &op).await {
                        Ok(()) => {
                            if let Err(e) = host.store().delete(&link).await {
                                warn!(link = %link, error = %e, "Failed to delete document");
                            }
                            responder.complete(Value::Null);
                            break;
                        }
                        Err(e) => responder.fail(e),
                    }
                }
            },
            Envelope::Timer => service.handle_timer(&ctx).await,
        }
    }

    host.unregister(&link, id);
    inbox.close();
    while let Ok(envelope) = inbox.try_recv() {
        if let Envelope::Op(request) | Envelope::Start(request) = envelope {
            request.responder.fail(CoreError::DocumentNotFound { link: link.clone() });
        }
    }
    debug!(link = %link, "Service stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::MockNotifier;
    use crate::store::MemoryDocumentStore;
    use serde_json::json;

    /// Counts PATCHes; used to observe serialization.
    struct CounterService {
        version: u64,
        hits: u64,
    }

    #[async_trait]
    impl Service for CounterService {
        fn kind(&self) -> &'static str {
            "test-counter"
        }

        fn document(&self) -> Value {
            json!({ "hits": self.hits })
        }

        async fn handle_create(&mut self, ctx: &ServiceContext, op: &Operation) -> Result<()> {
            if op.body.get("reject").is_some() {
                return Err(CoreError::validation("reject", "asked to"));
            }
            let doc = ctx.create_document(self.kind(), self.document(), None).await?;
            self.version = doc.version;
            Ok(())
        }

        async fn handle_patch(&mut self, ctx: &ServiceContext, request: Request) {
            // Yield inside the handler to give interleaving a chance
            tokio::task::yield_now().await;
            self.hits += 1;
            match ctx
                .update_document(self.version, self.document(), None)
                .await
            {
                Ok(doc) => {
                    self.version = doc.version;
                    ctx.adjust_stat("hits", 1);
                    request.responder.complete(self.document());
                }
                Err(e) => request.responder.fail(e),
            }
        }

        async fn handle_timer(&mut self, ctx: &ServiceContext) {
            ctx.adjust_stat("timers", 1);
        }
    }

    struct CounterFactory;

    impl ServiceFactory for CounterFactory {
        fn create_service(
            &self,
            factory_link: &str,
            op: &Operation,
        ) -> Result<(String, Box<dyn Service>)> {
            Ok((
                child_link(factory_link, op)?,
                Box::new(CounterService {
                    version: 0,
                    hits: 0,
                }),
            ))
        }
    }

    fn test_host() -> Host {
        Host::new(
            Config::default(),
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MockNotifier::new()),
        )
    }

    #[tokio::test]
    async fn test_factory_post_creates_service() {
        let host = test_host();
        host.register_factory("/counters", Arc::new(CounterFactory));

        host.send(Operation::post(
            "/counters",
            json!({ "documentSelfLink": "one" }),
        ))
        .await
        .unwrap();

        assert!(host.is_running("/counters/one"));
        assert!(host.store().get("/counters/one").await.unwrap().is_some());

        let err = host
            .send(Operation::post(
                "/counters",
                json!({ "documentSelfLink": "/counters/one" }),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DocumentAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_rejected_create_stops_service() {
        let host = test_host();
        host.register_factory("/counters", Arc::new(CounterFactory));

        let err = host
            .send(Operation::post(
                "/counters",
                json!({ "documentSelfLink": "bad", "reject": true }),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationError { .. }));

        // Unregistration happens right after the reply
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!host.is_running("/counters/bad"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_patches_are_serialized_per_document() {
        let host = test_host();
        host.register_factory("/counters", Arc::new(CounterFactory));
        host.send(Operation::post(
            "/counters",
            json!({ "documentSelfLink": "c" }),
        ))
        .await
        .unwrap();

        let sends = (0..50).map(|_| host.send(Operation::patch("/counters/c", json!({}))));
        let results = futures::future::join_all(sends).await;

        // Every versioned write succeeded, so no two handlers overlapped
        assert!(results.iter().all(|r| r.is_ok()));
        let doc = host.store().get("/counters/c").await.unwrap().unwrap();
        assert_eq!(doc.body["hits"], 50);
        assert_eq!(doc.version, 50);
        assert_eq!(host.stats().get("/counters/c", "hits"), 50);
    }

    #[tokio::test]
    async fn test_timer_wakes_running_service_only() {
        let host = test_host();
        host.register_factory("/counters", Arc::new(CounterFactory));
        host.send(Operation::post(
            "/counters",
            json!({ "documentSelfLink": "t" }),
        ))
        .await
        .unwrap();

        host.schedule_timer("/counters/t", Duration::from_millis(5));
        host.schedule_timer("/counters/gone", Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(host.stats().get("/counters/t", "timers"), 1);
        assert_eq!(host.stats().get("/counters/gone", "timers"), 0);
        // A timer is not an operation and leaves the document alone
        let doc = host.send(Operation::get("/counters/t")).await.unwrap();
        assert_eq!(doc["hits"], 0);
    }

    #[tokio::test]
    async fn test_unknown_link_is_not_found() {
        let host = test_host();
        let err = host.send(Operation::get("/missing")).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_wait_for_availability_queues_until_started() {
        let host = test_host();
        host.register_factory("/counters", Arc::new(CounterFactory));

        let waiting = {
            let host = host.clone();
            tokio::spawn(async move {
                host.send(Operation::patch("/counters/late", json!({})).wait_for_availability())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        host.send(Operation::post(
            "/counters",
            json!({ "documentSelfLink": "late" }),
        ))
        .await
        .unwrap();

        let reply = waiting.await.unwrap().unwrap();
        assert_eq!(reply["hits"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_availability_times_out() {
        let host = test_host();
        let err = host
            .send(Operation::get("/never").wait_for_availability())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_delete_stops_service_and_removes_document() {
        let host = test_host();
        host.start_service(
            "/things/x",
            Box::new(CounterService {
                version: 0,
                hits: 0,
            }),
            json!({}),
        )
        .await
        .unwrap();

        host.send(Operation::delete("/things/x")).await.unwrap();

        assert!(host.store().get("/things/x").await.unwrap().is_none());
        let err = host.send(Operation::get("/things/x")).await.unwrap_err();
        assert!(matches!(err, CoreError::DocumentNotFound { .. }));
    }

    #[test]
    fn test_child_link_rules() {
        let op = Operation::post("/tasks/p", json!({}));
        assert!(child_link("/tasks/p", &op).unwrap().starts_with("/tasks/p/"));

        let op = Operation::post("/tasks/p", json!({ "documentSelfLink": "abc" }));
        assert_eq!(child_link("/tasks/p", &op).unwrap(), "/tasks/p/abc");

        let op = Operation::post("/tasks/p", json!({ "documentSelfLink": "/other/abc" }));
        assert!(child_link("/tasks/p", &op).is_err());
    }

    #[test]
    fn test_operation_headers_are_case_insensitive() {
        let op = Operation::get("/x").with_header("Accept-Language", "fr");
        assert_eq!(op.header(ACCEPT_LANGUAGE), Some("fr"));
        assert_eq!(op.header("ACCEPT-LANGUAGE"), Some("fr"));
    }
}
