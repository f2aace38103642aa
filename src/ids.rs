//! Opaque identifiers shared across the sync stack.
//!
//! All of these wrap a byte string rather than a native Rust type because
//! the mesh transport, the application namespace scheme, and the local
//! storage engine each mint their own identifiers; this crate never
//! constructs one, only compares, orders and routes on them.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! opaque_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
        pub struct $name(pub Vec<u8>);

        impl $name {
            pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
                Self(bytes.into())
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(&self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(&self.0))
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.as_bytes().to_vec())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s.into_bytes())
            }
        }
    };
}

opaque_id!(
    DeviceId,
    "Names a device within the mesh. Ordered so the provider can apply a \
     deterministic tie-break rule when two devices become mutually visible \
     at once (see [`crate::provider`])."
);
opaque_id!(
    UserId,
    "Identifies the user that owns a set of devices. Two devices only form \
     a sync connection if their `UserId`s match."
);
opaque_id!(NamespaceId, "Identifies an application sharing the mesh transport.");
opaque_id!(PageId, "Identifies a page within a namespace.");
opaque_id!(CommitId, "Content address of a commit.");
opaque_id!(ObjectId, "Content address of a referenced object (tree node or blob).");

/// Monotonic generation number along a page's commit graph.
pub type Generation = u64;
