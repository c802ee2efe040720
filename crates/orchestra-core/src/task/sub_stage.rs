// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kind-specific substages.
//!
//! Substages are ordered by declaration. A substage marked transient may be
//! re-entered after later substages; every other substage is forward-only
//! within a stage.

use std::fmt;
use std::hash::Hash;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Ordered substage type of a task kind.
///
/// Usually declared with [`sub_stages!`](crate::sub_stages).
pub trait SubStage:
    Copy + Eq + Ord + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Initial substage.
    const CREATED: Self;
    /// Conventional substage of a successful completion.
    const COMPLETED: Self;
    /// Conventional substage of a failure.
    const ERROR: Self;
    /// Number of declared substages.
    const COUNT: usize;

    /// Declaration index, starting at 0.
    fn ordinal(&self) -> usize;

    /// Wire name, identical to the serialized form.
    fn name(&self) -> &'static str;

    /// Whether ordering is not enforced for this substage.
    fn is_transient(&self) -> bool;

    /// Whether this is the failure substage.
    fn is_error(&self) -> bool {
        *self == Self::ERROR
    }
}

/// Declare a substage enum and its [`SubStage`] implementation.
///
/// ```
/// orchestra_core::sub_stages! {
///     /// Substages of a provisioning task.
///     pub enum ProvisionSubStage {
///         Created => "CREATED",
///         Allocating => "ALLOCATING",
///         Processing => "PROCESSING",
///         Completed => "COMPLETED",
///         Error => "ERROR",
///     }
///     created = Created;
///     completed = Completed;
///     error = Error;
///     transient = [Processing];
/// }
///
/// use orchestra_core::task::SubStage;
/// assert!(ProvisionSubStage::Allocating < ProvisionSubStage::Completed);
/// assert!(ProvisionSubStage::Processing.is_transient());
/// assert_eq!(ProvisionSubStage::ERROR.name(), "ERROR");
/// ```
#[macro_export]
macro_rules! sub_stages {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $wire:literal ),+ $(,)?
        }
        created = $created:ident;
        completed = $completed:ident;
        error = $error:ident;
        $( transient = [ $($transient:ident),+ $(,)? ]; )?
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            ::serde::Serialize, ::serde::Deserialize,
        )]
        $vis enum $name {
            $( $(#[$vmeta])* #[serde(rename = $wire)] $variant, )+
        }

        impl $crate::task::SubStage for $name {
            const CREATED: Self = Self::$created;
            const COMPLETED: Self = Self::$completed;
            const ERROR: Self = Self::$error;
            const COUNT: usize = [$( stringify!($variant) ),+].len();

            fn ordinal(&self) -> usize {
                *self as usize
            }

            fn name(&self) -> &'static str {
                match self {
                    $( Self::$variant => $wire, )+
                }
            }

            fn is_transient(&self) -> bool {
                $( if matches!(self, $( Self::$transient )|+) { return true; } )?
                false
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str($crate::task::SubStage::name(self))
            }
        }
    };
}
