//! Namespace isolation policy.
//!
//! Every operation carries a namespace, defaulted when omitted. Queries resolve
//! to a [`NamespaceScope`]; reaching across namespaces requires the explicit
//! wildcard flag, and every result set leaving the coordinator is filtered
//! through [`NamespaceManager::retain_visible`].

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// Reserved name that denotes every namespace.
pub const WILDCARD: &str = "*";

/// Longest accepted namespace name, in bytes.
pub const MAX_NAMESPACE_LEN: usize = 128;

/// The set of namespaces a query may observe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceScope {
    Single(String),
    All,
}

impl NamespaceScope {
    pub fn contains(&self, namespace: &str) -> bool {
        match self {
            NamespaceScope::Single(name) => name == namespace,
            NamespaceScope::All => true,
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, NamespaceScope::All)
    }

    /// Namespace name for a single scope.
    pub fn single(&self) -> Option<&str> {
        match self {
            NamespaceScope::Single(name) => Some(name),
            NamespaceScope::All => None,
        }
    }
}

impl std::fmt::Display for NamespaceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NamespaceScope::Single(name) => write!(f, "{name}"),
            NamespaceScope::All => write!(f, "{WILDCARD}"),
        }
    }
}

/// Resolves and validates namespaces for the coordinator.
#[derive(Debug, Clone)]
pub struct NamespaceManager {
    default_namespace: String,
}

impl NamespaceManager {
    pub fn new(default_namespace: impl Into<String>) -> Result<Self> {
        let default_namespace = default_namespace.into();
        Self::validate_name(&default_namespace)
            .map_err(|e| MemoryError::invalid_config(format!("default namespace: {e}")))?;
        Ok(NamespaceManager { default_namespace })
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Check that `name` is usable as a concrete namespace.
    pub fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(MemoryError::validation("namespace must not be empty"));
        }
        if name == WILDCARD {
            return Err(MemoryError::validation(
                "the wildcard namespace requires the all_namespaces flag",
            ));
        }
        if name.len() > MAX_NAMESPACE_LEN {
            return Err(MemoryError::validation(format!(
                "namespace exceeds {MAX_NAMESPACE_LEN} bytes"
            )));
        }
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(MemoryError::validation(format!(
                "namespace contains whitespace or control characters: {name:?}"
            )));
        }
        Ok(())
    }

    /// Resolve the namespace for a write or point lookup.
    pub fn resolve(&self, namespace: Option<&str>) -> Result<String> {
        match namespace {
            Some(name) => {
                Self::validate_name(name)?;
                Ok(name.to_string())
            }
            None => Ok(self.default_namespace.clone()),
        }
    }

    /// Resolve the scope of a query.
    pub fn scope(&self, namespace: Option<&str>, all_namespaces: bool) -> Result<NamespaceScope> {
        if all_namespaces {
            return match namespace {
                None | Some(WILDCARD) => Ok(NamespaceScope::All),
                Some(name) => Err(MemoryError::validation(format!(
                    "all_namespaces conflicts with namespace {name:?}"
                ))),
            };
        }
        Ok(NamespaceScope::Single(self.resolve(namespace)?))
    }

    /// Drop every item outside `scope`. Returns how many were dropped.
    pub fn retain_visible<T, F>(
        &self,
        scope: &NamespaceScope,
        items: &mut Vec<T>,
        namespace_of: F,
    ) -> usize
    where
        F: Fn(&T) -> &str,
    {
        let before = items.len();
        items.retain(|item| scope.contains(namespace_of(item)));
        let dropped = before - items.len();
        if dropped > 0 {
            warn!("Dropped {dropped} results outside namespace scope {scope}");
        }
        dropped
    }
}

impl Default for NamespaceManager {
    fn default() -> Self {
        NamespaceManager {
            default_namespace: "default".to_string(),
        }
    }
}
