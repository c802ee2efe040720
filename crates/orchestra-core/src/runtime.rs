// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for orchestra-core.
//!
//! [`OrchestraRuntime`] wires a [`Host`] to a document store and a notifier,
//! loads extensibility subscriptions and starts the background tasks (the
//! subscription watcher and the expiration reaper).
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use orchestra_core::config::Config;
//! use orchestra_core::runtime::OrchestraRuntime;
//! use orchestra_core::task::TaskFactory;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = OrchestraRuntime::builder()
//!         .config(Config::from_env()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.register_task_factory("/tasks/provision", TaskFactory::new(ProvisionTask));
//!
//!     // ... run your application ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::extensibility::{Extensibility, ExtensibilityGate, SubscriptionRegistry};
use crate::host::{ExpirationReaper, ExpirationReaperConfig, Host};
use crate::notifier::Notifier;
use crate::store::{DocumentStore, MemoryDocumentStore};
use crate::task::{TaskFactory, TaskHandler};

/// Builder for creating an [`OrchestraRuntime`].
pub struct OrchestraRuntimeBuilder {
    config: Config,
    store: Option<Arc<dyn DocumentStore>>,
    notifier: Option<Arc<dyn Notifier>>,
    extensibility: bool,
    reaper: bool,
}

impl std::fmt::Debug for OrchestraRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestraRuntimeBuilder")
            .field("config", &self.config)
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("notifier", &self.notifier.as_ref().map(|_| "..."))
            .field("extensibility", &self.extensibility)
            .field("reaper", &self.reaper)
            .finish()
    }
}

impl Default for OrchestraRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            store: None,
            notifier: None,
            extensibility: true,
            reaper: true,
        }
    }
}

impl OrchestraRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the document store.
    ///
    /// Default: an in-memory store.
    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the notifier used for absolute-URL deliveries.
    ///
    /// Default: [`DisabledNotifier`](crate::notifier::DisabledNotifier), or an HTTP notifier with the `http`
    /// feature.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Disable extensibility checkpoints.
    pub fn without_extensibility(mut self) -> Self {
        self.extensibility = false;
        self
    }

    /// Do not run the expiration reaper.
    pub fn without_reaper(mut self) -> Self {
        self.reaper = false;
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<OrchestraRuntimeConfig> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryDocumentStore::new()));
        let notifier = match self.notifier {
            Some(notifier) => notifier,
            None => default_notifier(&self.config)?,
        };

        Ok(OrchestraRuntimeConfig {
            config: self.config,
            store,
            notifier,
            extensibility: self.extensibility,
            reaper: self.reaper,
        })
    }
}

#[cfg(feature = "http")]
fn default_notifier(config: &Config) -> Result<Arc<dyn Notifier>> {
    let notifier = crate::notifier::HttpNotifier::new(std::time::Duration::from_secs(30))?
        .with_signing_key(config.callback_signing_key.clone());
    Ok(Arc::new(notifier))
}

#[cfg(not(feature = "http"))]
fn default_notifier(_config: &Config) -> Result<Arc<dyn Notifier>> {
    Ok(Arc::new(crate::notifier::DisabledNotifier))
}

/// Configuration for an [`OrchestraRuntime`].
pub struct OrchestraRuntimeConfig {
    config: Config,
    store: Arc<dyn DocumentStore>,
    notifier: Arc<dyn Notifier>,
    extensibility: bool,
    reaper: bool,
}

impl std::fmt::Debug for OrchestraRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestraRuntimeConfig")
            .field("config", &self.config)
            .field("store", &"...")
            .field("notifier", &"...")
            .field("extensibility", &self.extensibility)
            .field("reaper", &self.reaper)
            .finish()
    }
}

impl OrchestraRuntimeConfig {
    /// Start the runtime: create the host, load subscriptions and spawn the
    /// background tasks.
    pub async fn start(self) -> Result<OrchestraRuntime> {
        let reaper_config = ExpirationReaperConfig {
            poll_interval: self.config.reaper_poll_interval,
            batch_size: self.config.reaper_batch_size,
        };
        let host = Host::new(self.config, self.store.clone(), self.notifier);
        let mut background = Vec::new();
        let mut shutdown = Vec::new();

        let (registry, gate) = if self.extensibility {
            let registry = Arc::new(SubscriptionRegistry::new(self.store));
            let stop = Arc::new(Notify::new());
            background.push(Arc::clone(&registry).load_and_watch(stop.clone()).await?);
            shutdown.push(stop);
            let gate: Arc<dyn Extensibility> =
                Arc::new(ExtensibilityGate::new(Arc::clone(&registry)));
            (Some(registry), Some(gate))
        } else {
            (None, None)
        };

        if self.reaper {
            let reaper = ExpirationReaper::new(host.clone(), reaper_config);
            shutdown.push(reaper.shutdown_handle());
            background.push(tokio::spawn(reaper.run()));
        }

        info!(
            extensibility = gate.is_some(),
            reaper = self.reaper,
            "OrchestraRuntime started"
        );

        Ok(OrchestraRuntime {
            host,
            registry,
            gate,
            background,
            shutdown,
        })
    }
}

/// A running orchestra-core instance.
///
/// The runtime manages:
/// - the document service host
/// - the extensibility subscription watcher
/// - the expiration reaper
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct OrchestraRuntime {
    host: Host,
    registry: Option<Arc<SubscriptionRegistry>>,
    gate: Option<Arc<dyn Extensibility>>,
    background: Vec<JoinHandle<()>>,
    shutdown: Vec<Arc<Notify>>,
}

impl std::fmt::Debug for OrchestraRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestraRuntime")
            .field("host", &self.host)
            .field("registry", &self.registry)
            .field("background", &self.background.len())
            .finish()
    }
}

impl OrchestraRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> OrchestraRuntimeBuilder {
        OrchestraRuntimeBuilder::new()
    }

    /// The document service host.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// The extensibility capability handed to task factories.
    pub fn gate(&self) -> Option<Arc<dyn Extensibility>> {
        self.gate.clone()
    }

    /// The subscription registry, when extensibility is enabled.
    pub fn registry(&self) -> Option<&Arc<SubscriptionRegistry>> {
        self.registry.as_ref()
    }

    /// Register a task kind at `link`, with extensibility when enabled.
    pub fn register_task_factory<H: TaskHandler>(&self, link: &str, factory: TaskFactory<H>) {
        let factory = factory.with_extensibility(self.gate());
        self.host.register_factory(link, Arc::new(factory));
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the background tasks and waits for them to stop. Document
    /// actors are left to finish their current operation.
    pub async fn shutdown(self) -> Result<()> {
        info!("OrchestraRuntime shutting down...");

        for stop in &self.shutdown {
            stop.notify_one();
        }

        for handle in self.background {
            if let Err(e) = handle.await {
                error!("OrchestraRuntime background task failed: {}", e);
                return Err(e.into());
            }
        }

        info!("OrchestraRuntime shutdown complete");
        Ok(())
    }
}
