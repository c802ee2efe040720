// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delivery to external (absolute URL) addresses.
//!
//! Internal addresses are reached through the host. Callbacks and
//! extensibility subscribers living outside the process are reached through
//! a [`Notifier`].

#[cfg(feature = "http")]
pub mod http;
pub mod mock;

#[cfg(feature = "http")]
pub use self::http::HttpNotifier;
pub use self::mock::{Delivery, MockNotifier};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::error::CoreError;

/// Header carrying the body signature of an external delivery.
pub const SIGNATURE_HEADER: &str = "x-orchestra-signature";

/// POSTs JSON bodies to absolute URLs.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `body` to `url`. Any non-success outcome is an error.
    async fn post(&self, url: &str, body: &Value) -> Result<(), CoreError>;
}

/// Whether an address is an absolute URL rather than an internal link.
pub fn is_external(address: &str) -> bool {
    address.starts_with("http://") || address.starts_with("https://")
}

/// Base64 HMAC-SHA256 of `body` under `key`.
pub fn sign(key: &str, body: &[u8]) -> Result<String, CoreError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).map_err(|e| {
        CoreError::validation("callbackSigningKey", e.to_string())
    })?;
    mac.update(body);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Notifier used when no external transport is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn post(&self, url: &str, _body: &Value) -> Result<(), CoreError> {
        Err(CoreError::DeliveryFailed {
            target: url.to_string(),
            reason: "no external transport configured".to_string(),
        })
    }
}
