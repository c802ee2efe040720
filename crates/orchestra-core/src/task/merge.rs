// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Field merge policies applied when a patch is accepted.
//!
//! Each field of a task body declares one policy:
//!
//! | Policy | Function | Effect |
//! |--------|----------|--------|
//! | overwrite-if-present | [`overwrite_if_present`] | a `Some` in the patch replaces the value |
//! | additive map | [`additive_map`] | patch entries are inserted into the map |
//! | first-write-wins | [`first_write_wins`] | the patch only fills an empty field |
//!
//! [`task_body!`](crate::task_body) wires the per-field policy into a
//! [`TaskBody::merge`] implementation at compile time.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Kind-specific fields of a task document.
///
/// Every field should be an `Option` so that the same type can describe a
/// partial patch.
pub trait TaskBody:
    Serialize + DeserializeOwned + Default + Clone + fmt::Debug + Send + Sync + 'static
{
    /// Merge the fields of an accepted patch into `self`.
    fn merge(&mut self, patch: Self);
}

/// Replace `current` when `incoming` is set.
pub fn overwrite_if_present<T>(current: &mut Option<T>, incoming: Option<T>) {
    if incoming.is_some() {
        *current = incoming;
    }
}

/// Set `current` only if it is still empty.
pub fn first_write_wins<T>(current: &mut Option<T>, incoming: Option<T>) {
    if current.is_none() {
        *current = incoming;
    }
}

/// Insert every entry of `incoming` into `current`.
pub fn additive_map<K: Eq + Hash, V>(
    current: &mut Option<HashMap<K, V>>,
    incoming: Option<HashMap<K, V>>,
) {
    if let Some(incoming) = incoming {
        current.get_or_insert_with(HashMap::new).extend(incoming);
    }
}

/// Declare a task body struct with a merge policy per field.
///
/// Policies: `overwrite_if_present`, `additive_map`, `first_write_wins`.
///
/// ```
/// use std::collections::HashMap;
///
/// orchestra_core::task_body! {
///     /// Fields of a provisioning task.
///     pub struct ProvisionBody {
///         #[merge(overwrite_if_present)]
///         /// How many resources to allocate.
///         pub resource_count: Option<u32>,
///         #[merge(first_write_wins)]
///         pub placement_link: Option<String>,
///         #[merge(additive_map)]
///         pub labels: Option<HashMap<String, String>>,
///     }
/// }
///
/// use orchestra_core::task::TaskBody;
/// let mut body = ProvisionBody { placement_link: Some("/p/1".into()), ..Default::default() };
/// body.merge(ProvisionBody {
///     resource_count: Some(3),
///     placement_link: Some("/p/2".into()),
///     ..Default::default()
/// });
/// assert_eq!(body.resource_count, Some(3));
/// assert_eq!(body.placement_link.as_deref(), Some("/p/1"));
/// ```
#[macro_export]
macro_rules! task_body {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                #[merge($policy:ident)]
                $(#[$fmeta:meta])*
                $fvis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, ::serde::Serialize, ::serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        $vis struct $name {
            $(
                $(#[$fmeta])*
                #[serde(default, skip_serializing_if = "Option::is_none")]
                $fvis $field: $ty,
            )*
        }

        impl $crate::task::TaskBody for $name {
            fn merge(&mut self, patch: Self) {
                $( $crate::task::merge::$policy(&mut self.$field, patch.$field); )*
            }
        }
    };
}
