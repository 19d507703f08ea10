//! Built-in operations
//!
//! - `read_file` / `search_file`: audit operations over the runner's file access
//! - [`CommandOperation`]: a fixed argv template, `{key}` placeholders are
//!   filled from string fields of the input

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::Result;
use crate::registry::{Operation, OperationCategory, ToolRegistry};
use crate::transport::{CommandResult, CommandRunner};

/// Registry holding the built-in file operations
pub fn builtin_registry() -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFileOperation))?;
    registry.register(Arc::new(SearchFileOperation))?;
    Ok(registry)
}

fn required_str<'a>(input: &'a Map<String, Value>, key: &str) -> anyhow::Result<&'a str> {
    input
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("missing required string field '{}'", key))
}

/// Turn a failed command into an operation error
fn into_output(result: CommandResult) -> anyhow::Result<String> {
    if result.success {
        Ok(result.stdout)
    } else {
        bail!(
            "{} (exit {}): {}",
            result.status.as_str(),
            result.exit_code,
            result.output()
        )
    }
}

/// `read_file {path}` - first lines of a file on the active target
pub struct ReadFileOperation;

#[async_trait]
impl Operation for ReadFileOperation {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the beginning of a file (line and byte capped)"
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Audit
    }

    async fn execute(
        &self,
        input: &Map<String, Value>,
        runner: &CommandRunner,
    ) -> anyhow::Result<String> {
        let path = required_str(input, "path")?;
        into_output(runner.read_file(path).await)
    }
}

/// `search_file {path, pattern}` - case-insensitive matches with line numbers
pub struct SearchFileOperation;

#[async_trait]
impl Operation for SearchFileOperation {
    fn name(&self) -> &str {
        "search_file"
    }

    fn description(&self) -> &str {
        "Search a file for a pattern (case-insensitive, capped)"
    }

    fn category(&self) -> OperationCategory {
        OperationCategory::Audit
    }

    async fn execute(
        &self,
        input: &Map<String, Value>,
        runner: &CommandRunner,
    ) -> anyhow::Result<String> {
        let path = required_str(input, "path")?;
        let pattern = required_str(input, "pattern")?;
        let output = into_output(runner.search_file(path, pattern).await)?;
        if output.is_empty() {
            Ok(format!("No matches for '{}' in {}", pattern, path))
        } else {
            Ok(output)
        }
    }
}

/// An operation that runs one argv template through the runner
#[derive(Debug, Clone)]
pub struct CommandOperation {
    name: String,
    description: String,
    category: OperationCategory,
    argv: Vec<String>,
}

impl CommandOperation {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: OperationCategory,
        argv: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category,
            argv,
        }
    }

    /// Resolve `{key}` placeholders against the input
    pub fn render(&self, input: &Map<String, Value>) -> anyhow::Result<Vec<String>> {
        if self.argv.is_empty() {
            bail!("operation '{}' has an empty command", self.name);
        }

        self.argv
            .iter()
            .map(|arg| match arg.strip_prefix('{').and_then(|a| a.strip_suffix('}')) {
                Some(key) if !key.is_empty() => required_str(input, key)
                    .map(str::to_string)
                    .with_context(|| format!("rendering '{}'", self.name)),
                _ => Ok(arg.clone()),
            })
            .collect()
    }
}

#[async_trait]
impl Operation for CommandOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn category(&self) -> OperationCategory {
        self.category
    }

    async fn execute(
        &self,
        input: &Map<String, Value>,
        runner: &CommandRunner,
    ) -> anyhow::Result<String> {
        let argv = self.render(input)?;
        let result = runner.run(argv.as_slice()).await;
        into_output(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn input(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_render_placeholders() {
        let op = CommandOperation::new(
            "restart_service",
            "Restart a service",
            OperationCategory::Repair,
            argv(&["systemctl", "restart", "{service}"]),
        );
        let rendered = op.render(&input(json!({"service": "cups"}))).unwrap();
        assert_eq!(rendered, argv(&["systemctl", "restart", "cups"]));

        let err = op.render(&Map::new()).unwrap_err();
        assert!(format!("{:#}", err).contains("service"));
    }

    #[test]
    fn test_render_keeps_literal_braces() {
        let op = CommandOperation::new("x", "", OperationCategory::Audit, argv(&["echo", "{}"]));
        assert_eq!(op.render(&Map::new()).unwrap(), argv(&["echo", "{}"]));
    }

    #[tokio::test]
    async fn test_command_operation_runs_locally() {
        let op = CommandOperation::new(
            "say",
            "",
            OperationCategory::Audit,
            argv(&["echo", "{word}"]),
        );
        let runner = CommandRunner::new();
        let out = op.execute(&input(json!({"word": "hello"})), &runner).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn test_failed_command_is_error() {
        let op = CommandOperation::new("fail", "", OperationCategory::Repair, argv(&["false"]));
        let err = op.execute(&Map::new(), &CommandRunner::new()).await.unwrap_err();
        assert!(err.to_string().contains("non-zero exit"));
    }

    #[test]
    fn test_builtin_registry() {
        let registry = builtin_registry().unwrap();
        assert_eq!(registry.names(OperationCategory::Audit), vec!["read_file", "search_file"]);
        assert!(registry.names(OperationCategory::Repair).is_empty());
    }

    #[tokio::test]
    async fn test_read_and_search_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "boot ok").unwrap();
        writeln!(file, "disk ERROR").unwrap();
        let path = file.path().to_str().unwrap();
        let runner = CommandRunner::new();

        let content = ReadFileOperation
            .execute(&input(json!({"path": path})), &runner)
            .await
            .unwrap();
        assert_eq!(content, "boot ok\ndisk ERROR");

        let found = SearchFileOperation
            .execute(&input(json!({"path": path, "pattern": "error"})), &runner)
            .await
            .unwrap();
        assert_eq!(found, "2: disk ERROR");

        let none = SearchFileOperation
            .execute(&input(json!({"path": path, "pattern": "kernel"})), &runner)
            .await
            .unwrap();
        assert!(none.starts_with("No matches"));

        assert!(ReadFileOperation.execute(&Map::new(), &runner).await.is_err());
    }
}
