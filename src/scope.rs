use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one isolated execution context (for example one browser tab).
///
/// Sessions are keyed by `(ExecutionScope, FeatureKind)`. Hosts with a single
/// context use [`ExecutionScope::DEFAULT`]; hosts with several create and
/// destroy scopes explicitly through the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionScope(u64);

impl ExecutionScope {
    pub const DEFAULT: ExecutionScope = ExecutionScope(0);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }

    pub fn is_default(self) -> bool {
        self == Self::DEFAULT
    }
}

impl Default for ExecutionScope {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ExecutionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}
