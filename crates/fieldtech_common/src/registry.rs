//! Tool Registry - named operations and their category
//!
//! The registry is the single source of truth for whether an operation is a
//! read-only audit or a state-mutating repair. The executor asks it before
//! consulting the workflow state machine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{FieldtechError, Result};
use crate::transport::CommandRunner;

/// Whether an operation reads or changes the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationCategory {
    /// Read-only diagnostics, always allowed
    Audit,
    /// State-mutating, gated by the approval workflow
    Repair,
}

impl OperationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationCategory::Audit => "audit",
            OperationCategory::Repair => "repair",
        }
    }
}

/// A named system operation.
///
/// Operations receive the runner rather than spawning processes themselves,
/// so the same operation works locally and against remote targets.
#[async_trait]
pub trait Operation: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn category(&self) -> OperationCategory;

    /// Run with the given input. `Err` is an execution failure, not a panic.
    async fn execute(&self, input: &Map<String, Value>, runner: &CommandRunner)
        -> anyhow::Result<String>;
}

/// Registered operations by name
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Operation>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation; names are unique
    pub fn register(&mut self, operation: Arc<dyn Operation>) -> Result<()> {
        let name = operation.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(FieldtechError::ToolExists(name));
        }
        self.tools.insert(name, operation);
        Ok(())
    }

    /// Remove an operation; false if it was not registered
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Operation>> {
        self.tools.get(name).cloned()
    }

    pub fn is_repair_tool(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .map(|op| op.category() == OperationCategory::Repair)
            .unwrap_or(false)
    }

    /// Names in a category, sorted
    pub fn names(&self, category: OperationCategory) -> Vec<&str> {
        self.tools
            .values()
            .filter(|op| op.category() == category)
            .map(|op| op.name())
            .collect()
    }

    /// (name, category, description) for every operation, sorted by name
    pub fn describe(&self) -> Vec<(&str, OperationCategory, &str)> {
        self.tools
            .values()
            .map(|op| (op.name(), op.category(), op.description()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("audit", &self.names(OperationCategory::Audit))
            .field("repair", &self.names(OperationCategory::Repair))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, OperationCategory);

    #[async_trait]
    impl Operation for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "test operation"
        }

        fn category(&self) -> OperationCategory {
            self.1
        }

        async fn execute(
            &self,
            _input: &Map<String, Value>,
            _runner: &CommandRunner,
        ) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(Named("get_system_info", OperationCategory::Audit)))
            .unwrap();
        registry
            .register(Arc::new(Named("cleanup_disk", OperationCategory::Repair)))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.lookup("get_system_info").is_some());
        assert!(registry.lookup("missing").is_none());
        assert!(registry.is_repair_tool("cleanup_disk"));
        assert!(!registry.is_repair_tool("get_system_info"));
        assert!(!registry.is_repair_tool("missing"));
        assert_eq!(registry.names(OperationCategory::Repair), vec!["cleanup_disk"]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(Named("cleanup_disk", OperationCategory::Repair)))
            .unwrap();
        let err = registry
            .register(Arc::new(Named("cleanup_disk", OperationCategory::Audit)))
            .unwrap_err();
        assert!(matches!(err, FieldtechError::ToolExists(ref n) if n == "cleanup_disk"));
        assert!(registry.is_repair_tool("cleanup_disk"));
    }

    #[test]
    fn test_unregister() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(Named("flush_dns", OperationCategory::Repair)))
            .unwrap();
        assert!(registry.unregister("flush_dns"));
        assert!(!registry.unregister("flush_dns"));
        assert!(registry.is_empty());
    }
}
