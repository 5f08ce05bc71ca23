//! Core identifier types for the scheduler.
//!
//! Jobs and triggers are addressed by a `(name, group)` pair. Keys order
//! structurally: group first, then name.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Group used when a key is created without an explicit group.
pub const DEFAULT_GROUP: &str = "DEFAULT";

macro_rules! define_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            // Field order matters: derived Ord compares group before name.
            group: String,
            name: String,
        }

        impl $name {
            /// Create a key in the given group.
            pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
                Self {
                    group: group.into(),
                    name: name.into(),
                }
            }

            /// Create a key in the default group.
            pub fn with_default_group(name: impl Into<String>) -> Self {
                Self::new(name, DEFAULT_GROUP)
            }

            /// Get the name component.
            pub fn name(&self) -> &str {
                &self.name
            }

            /// Get the group component.
            pub fn group(&self) -> &str {
                &self.group
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::with_default_group(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::with_default_group(s)
            }
        }

        impl From<(&str, &str)> for $name {
            fn from((name, group): (&str, &str)) -> Self {
                Self::new(name, group)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}", self.group, self.name)
            }
        }
    };
}

define_key!(
    /// Identity of a job definition.
    JobKey
);

define_key!(
    /// Identity of a trigger.
    TriggerKey
);

/// Unique identifier for one concrete firing of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FireInstanceId(Uuid);

impl FireInstanceId {
    /// Generate a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an id from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FireInstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FireInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for FireInstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identity of one scheduler instance within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Create an instance id from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate an id from the host name and the current time.
    ///
    /// Used when the configured id is `AUTO`.
    pub fn generate() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self(format!("{}-{}", host, chrono::Utc::now().timestamp_millis()))
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
