//! Structured names for addressable robot components.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a physical or virtual subsystem, e.g. a base or an arm.
///
/// Names are equality-comparable and hashable; the execution state store is
/// keyed by them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentName {
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

impl ComponentName {
    pub fn new(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// A base component in the platform namespace.
    pub fn base(name: impl Into<String>) -> Self {
        Self::new("caravel", "base", name)
    }

    /// The name without namespace or kind.
    pub fn short_name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.namespace, self.kind, self.name)
    }
}
