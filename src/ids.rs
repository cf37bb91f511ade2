//! Opaque id newtypes.
//!
//! Cross-references between entities (cases, tokens, work items) are ids,
//! never direct references, so the engine can own everything in flat arenas
//! without cyclic `Rc`/`RefCell` graphs.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(#[serde(with = "uuid::serde::compact")] pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(CaseId);
uuid_id!(TokenId);
uuid_id!(WorkItemId);
uuid_id!(TxId);

/// Task/condition ids are stable strings from the specification, not uuids:
/// they are authored, not generated.
pub type NodeId = String;

/// Opaque reference to an externally-selected worklet. Selection and
/// execution of the substitute sub-workflow are an external collaborator's
/// responsibility; the engine only carries the id around.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkletId(pub String);

impl fmt::Display for WorkletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `(identifier, major.minor, uri)` — identifies a workflow specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpecId {
    pub identifier: String,
    pub major: u32,
    pub minor: u32,
    pub uri: String,
}

impl SpecId {
    pub fn new(identifier: impl Into<String>, major: u32, minor: u32, uri: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            major,
            minor,
            uri: uri.into(),
        }
    }
}

impl fmt::Display for SpecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}.{} ({})", self.identifier, self.major, self.minor, self.uri)
    }
}

impl PartialOrd for SpecId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SpecId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.identifier
            .cmp(&other.identifier)
            .then((self.major, self.minor).cmp(&(other.major, other.minor)))
    }
}
