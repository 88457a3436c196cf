//! Branded ID newtypes.
//!
//! Crosses, systems, subscribers and retransmission tasks each get their own
//! string newtype so one cannot be passed where another is expected. Only
//! [`TaskId`] is generated locally (UUID v7); the rest arrive from peers or
//! configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the id is empty or whitespace only.
            #[must_use]
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Intersection identifier (e.g. `11010000100001`).
    CrossId
}

branded_id! {
    /// Identifier of a platform or signal-control system.
    SystemId
}

branded_id! {
    /// Identifier of a push recipient (a logged-in peer connection).
    SubscriberId
}

branded_id! {
    /// Identifier of a retransmission task.
    TaskId
}

impl TaskId {
    /// Create a new time-ordered task id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn task_ids_are_unique() {
        let ids: HashSet<TaskId> = (0..100).map(|_| TaskId::new()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn task_id_is_uuid_v7() {
        let id = TaskId::new();
        let parsed = Uuid::parse_str(id.as_str()).unwrap();
        assert_eq!(parsed.get_version_num(), 7);
    }

    #[test]
    fn cross_id_serde_transparent() {
        let id = CrossId::from("11010000100001");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"11010000100001\"");
        let back: CrossId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn blank_detection() {
        assert!(CrossId::from("  ").is_blank());
        assert!(CrossId::from("").is_blank());
        assert!(!CrossId::from("c1").is_blank());
    }

    #[test]
    fn display_and_deref() {
        let id = SubscriberId::from("platform-1");
        assert_eq!(id.to_string(), "platform-1");
        assert_eq!(id.len(), 10);
        assert_eq!(String::from(id), "platform-1");
    }
}
