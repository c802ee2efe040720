// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestra Core - Task Orchestration Engine
//!
//! This crate provides resumable, multi-stage tasks hosted as addressable
//! documents. Tasks advance by PATCHing themselves, fan out to children,
//! gather their outcomes through counter barriers, and can be paused at
//! checkpoints that external subscribers registered interest in.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           OrchestraRuntime                              │
//! │        (Host, SubscriptionRegistry watcher, ExpirationReaper)           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                 Host                                    │
//! │     one actor per document address, FIFO operations, factories          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!        │                    │                         │
//!        ▼                    ▼                         ▼
//! ┌───────────────┐   ┌──────────────────┐   ┌───────────────────────────┐
//! │  TaskService  │   │  CounterSubTask  │   │ ExtensibilityCallback-    │
//! │ (stage machine│◄──│  (fan-in barrier)│   │ Service (blocking resume) │
//! │  per kind)    │   └──────────────────┘   └───────────────────────────┘
//! └───────────────┘            ▲                         ▲
//!        │  children report    │                         │
//!        └─────────────────────┘          ExtensibilityGate (checkpoints)
//!        │
//!        ▼
//! ┌───────────────────────┐          ┌──────────────────────────────────┐
//! │     DocumentStore     │          │ Notifier (absolute URL delivery) │
//! └───────────────────────┘          └──────────────────────────────────┘
//! ```
//!
//! # Task lifecycle
//!
//! | Stage | Meaning |
//! |-------|---------|
//! | `CREATED` | Accepted; promoted to `STARTED` when the actor starts |
//! | `STARTED` | Running; the kind's substages carry the detail |
//! | `FINISHED` | Done; the parent callback gets the success response |
//! | `FAILED` | Done with failure; the parent gets the failure response |
//! | `CANCELLED` | Abandoned; nobody is notified |
//!
//! Every transition is validated by [`task::transition::validate`]: stages
//! only move forward, a repeated failure is absorbed, and substages only move
//! forward within a stage unless marked transient.
//!
//! # Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`host`] | Document actors, operations, the expiration reaper |
//! | [`store`] | Versioned document storage with change feeds |
//! | [`task`] | Task documents, callbacks and the generic state machine |
//! | [`counter`] | Fan-in barrier over N child completions |
//! | [`extensibility`] | Subscriptions, checkpoint gate and resume records |
//! | [`notifier`] | Delivery to absolute URLs |
//! | [`runtime`] | Wiring everything together |

#![deny(missing_docs)]

pub mod config;
pub mod counter;
pub mod error;
pub mod extensibility;
pub mod host;
pub mod notifier;
pub mod runtime;
pub mod store;
pub mod task;

pub use config::Config;
pub use error::{CoreError, ErrorResponse, Result};
pub use runtime::{OrchestraRuntime, OrchestraRuntimeBuilder};
