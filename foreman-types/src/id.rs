//! Typed id wrappers for runs, jobs, threads, owners, and workers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer-backed typed ids prevent mixing up run ids, job ids, etc.
/// These mirror database row ids - allocation order is an implementation
/// detail of the store, the protocol only requires uniqueness.
macro_rules! typed_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);

        impl $name {
            /// Create a new typed id from a raw integer.
            #[must_use]
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            /// The raw integer value.
            #[must_use]
            pub fn as_i64(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

/// String-backed typed ids for identifiers minted outside the store
/// (worker bundle ids, trace correlators).
macro_rules! typed_str_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new typed id from anything that converts to String.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the inner string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

typed_id!(OwnerId, "Unique identifier for the owning user.");
typed_id!(RunId, "Unique identifier for one supervisor run.");
typed_id!(ThreadId, "Unique identifier for a message thread.");
typed_id!(MessageId, "Unique identifier for a persisted message.");
typed_id!(JobId, "Unique identifier for a worker job.");
typed_id!(BarrierId, "Unique identifier for a worker barrier.");

typed_str_id!(WorkerId, "Identifier for one worker's artifact bundle.");
typed_str_id!(TraceId, "End-to-end trace correlator, inherited supervisor → workers.");
