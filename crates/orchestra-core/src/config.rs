// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::collections::HashMap;
use std::time::Duration;

/// Orchestra Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URI prepended to links when a callback must be absolute
    pub public_uri: String,
    /// Expiration horizon applied to tasks created without one
    pub default_task_expiration: Duration,
    /// Attempts for terminal request-tracker updates
    pub task_retries: u32,
    /// Wait between request-tracker update attempts
    pub tracker_retry_interval: Duration,
    /// Default time a blocking extensibility checkpoint waits for a resume
    pub extensibility_timeout: Duration,
    /// Per-topic overrides of the blocking timeout
    pub topic_timeouts: HashMap<String, Duration>,
    /// Attempts to deliver a notification to a subscriber
    pub notification_retry_count: u32,
    /// Wait between notification attempts
    pub notification_retry_wait: Duration,
    /// Attempts to deliver a resume to the paused task
    pub resume_retry_count: u32,
    /// Wait between resume attempts
    pub resume_retry_wait: Duration,
    /// Grace period a processed extensibility callback is retained for
    pub processed_notification_expiry: Duration,
    /// How long a send waits for an address to become available
    pub availability_timeout: Duration,
    /// How often the reaper looks for expired documents
    pub reaper_poll_interval: Duration,
    /// Maximum expired documents removed per reaper pass
    pub reaper_batch_size: usize,
    /// Key used to sign external deliveries (HMAC-SHA256)
    pub callback_signing_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            public_uri: "http://127.0.0.1:8282".to_string(),
            default_task_expiration: Duration::from_secs(5 * 60 * 60),
            task_retries: 3,
            tracker_retry_interval: Duration::from_millis(1000),
            extensibility_timeout: Duration::from_secs(30 * 60),
            topic_timeouts: HashMap::new(),
            notification_retry_count: 3,
            notification_retry_wait: Duration::from_secs(15),
            resume_retry_count: 3,
            resume_retry_wait: Duration::from_secs(15),
            processed_notification_expiry: Duration::from_secs(60 * 60),
            availability_timeout: Duration::from_millis(5000),
            reaper_poll_interval: Duration::from_millis(1000),
            reaper_batch_size: 100,
            callback_signing_key: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional; unset ones keep the `Default` value:
    /// - `ORCHESTRA_PUBLIC_URI` (default: `http://127.0.0.1:8282`)
    /// - `ORCHESTRA_TASK_EXPIRATION_SECS` (default: 18000)
    /// - `ORCHESTRA_TASK_RETRIES` (default: 3)
    /// - `ORCHESTRA_TRACKER_RETRY_INTERVAL_MS` (default: 1000)
    /// - `ORCHESTRA_EXTENSIBILITY_TIMEOUT_SECS` (default: 1800)
    /// - `ORCHESTRA_TOPIC_TIMEOUTS`: `topic=secs,topic=secs` (default: empty)
    /// - `ORCHESTRA_NOTIFICATION_RETRY_COUNT` (default: 3)
    /// - `ORCHESTRA_NOTIFICATION_RETRY_WAIT_SECS` (default: 15)
    /// - `ORCHESTRA_RESUME_RETRY_COUNT` (default: 3)
    /// - `ORCHESTRA_RESUME_RETRY_WAIT_SECS` (default: 15)
    /// - `ORCHESTRA_PROCESSED_EXPIRY_SECS` (default: 3600)
    /// - `ORCHESTRA_AVAILABILITY_TIMEOUT_MS` (default: 5000)
    /// - `ORCHESTRA_REAPER_POLL_INTERVAL_MS` (default: 1000)
    /// - `ORCHESTRA_REAPER_BATCH_SIZE` (default: 100)
    /// - `ORCHESTRA_CALLBACK_SIGNING_KEY` (default: unset)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let public_uri = std::env::var("ORCHESTRA_PUBLIC_URI")
            .map(|uri| uri.trim_end_matches('/').to_string())
            .unwrap_or(defaults.public_uri);
        if !public_uri.contains("://") {
            return Err(ConfigError::Invalid(
                "ORCHESTRA_PUBLIC_URI",
                "must be an absolute URI",
            ));
        }

        let topic_timeouts = match std::env::var("ORCHESTRA_TOPIC_TIMEOUTS") {
            Ok(raw) => parse_topic_timeouts(&raw)?,
            Err(_) => defaults.topic_timeouts,
        };

        let callback_signing_key = std::env::var("ORCHESTRA_CALLBACK_SIGNING_KEY")
            .ok()
            .filter(|key| !key.is_empty());

        Ok(Self {
            public_uri,
            default_task_expiration: secs_var(
                "ORCHESTRA_TASK_EXPIRATION_SECS",
                defaults.default_task_expiration,
            )?,
            task_retries: number_var("ORCHESTRA_TASK_RETRIES", defaults.task_retries)?,
            tracker_retry_interval: millis_var(
                "ORCHESTRA_TRACKER_RETRY_INTERVAL_MS",
                defaults.tracker_retry_interval,
            )?,
            extensibility_timeout: secs_var(
                "ORCHESTRA_EXTENSIBILITY_TIMEOUT_SECS",
                defaults.extensibility_timeout,
            )?,
            topic_timeouts,
            notification_retry_count: number_var(
                "ORCHESTRA_NOTIFICATION_RETRY_COUNT",
                defaults.notification_retry_count,
            )?,
            notification_retry_wait: secs_var(
                "ORCHESTRA_NOTIFICATION_RETRY_WAIT_SECS",
                defaults.notification_retry_wait,
            )?,
            resume_retry_count: number_var(
                "ORCHESTRA_RESUME_RETRY_COUNT",
                defaults.resume_retry_count,
            )?,
            resume_retry_wait: secs_var(
                "ORCHESTRA_RESUME_RETRY_WAIT_SECS",
                defaults.resume_retry_wait,
            )?,
            processed_notification_expiry: secs_var(
                "ORCHESTRA_PROCESSED_EXPIRY_SECS",
                defaults.processed_notification_expiry,
            )?,
            availability_timeout: millis_var(
                "ORCHESTRA_AVAILABILITY_TIMEOUT_MS",
                defaults.availability_timeout,
            )?,
            reaper_poll_interval: millis_var(
                "ORCHESTRA_REAPER_POLL_INTERVAL_MS",
                defaults.reaper_poll_interval,
            )?,
            reaper_batch_size: number_var(
                "ORCHESTRA_REAPER_BATCH_SIZE",
                defaults.reaper_batch_size,
            )?,
            callback_signing_key,
        })
    }

    /// Absolute form of an internal link.
    pub fn absolute_uri(&self, link: &str) -> String {
        format!("{}{}", self.public_uri, link)
    }
}

fn number_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    number_var(name, default.as_secs()).map(Duration::from_secs)
}

fn millis_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    number_var(name, default.as_millis() as u64).map(Duration::from_millis)
}

fn parse_topic_timeouts(raw: &str) -> Result<HashMap<String, Duration>, ConfigError> {
    let mut timeouts = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (topic, secs) = entry.split_once('=').ok_or(ConfigError::Invalid(
            "ORCHESTRA_TOPIC_TIMEOUTS",
            "entries must look like topic=seconds",
        ))?;
        let secs: u64 = secs.trim().parse().map_err(|_| {
            ConfigError::Invalid("ORCHESTRA_TOPIC_TIMEOUTS", "timeout must be whole seconds")
        })?;
        timeouts.insert(topic.trim().to_string(), Duration::from_secs(secs));
    }
    Ok(timeouts)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
