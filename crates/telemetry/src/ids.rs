//! Entity identifiers
//!
//! Identifiers are handed out in creation order starting at 1. The raw value 0
//! (or anything negative coming from a foreign integer) never addresses storage.

use serde::{Deserialize, Serialize};

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Build an identifier from a raw integer.
            ///
            /// Values outside `1..=u32::MAX` produce an identifier that no
            /// registry will ever resolve.
            pub fn from_raw(raw: i64) -> Self {
                Self(u32::try_from(raw).unwrap_or(0))
            }

            pub(crate) fn from_index(index: usize) -> Self {
                Self(u32::try_from(index + 1).unwrap_or(0))
            }

            /// Raw 1-based value
            pub fn get(self) -> u32 {
                self.0
            }

            /// Storage index, if the identifier is not the reserved zero value
            pub(crate) fn index(self) -> Option<usize> {
                self.0.checked_sub(1).map(|i| i as usize)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Handle of a property
    PropertyId
);

entity_id!(
    /// Handle of a property group
    GroupId
);

entity_id!(
    /// Handle of a notification
    NotificationId
);
