//! NewType wrappers for strong typing throughout the gateway.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a tenant id where a backend id is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Identifier of a configured backend (e.g., "github").
    ///
    /// This is also the first path segment of hierarchical routes and the
    /// prefix of every tool name the backend contributes.
    BackendId
);

newtype_string!(
    /// Globally unique tool name, always `<backend>_<original>`.
    ToolName
);

newtype_string!(
    /// Tenant identifier used to own credentials and endpoint overrides
    /// (e.g., "Tenant-Google").
    TenantId
);

newtype_string!(
    /// Group name asserted for a user (e.g., "MCP-Admin").
    GroupName
);

newtype_string!(
    /// Session identifier issued by a streamable protocol backend.
    SessionId
);

impl ToolName {
    /// Build the prefixed catalog name for a backend's operation.
    pub fn prefixed(backend: &BackendId, original: &str) -> Self {
        Self(format!("{}_{}", backend, original))
    }
}
