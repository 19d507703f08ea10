//! Command Executor - the single gate every operation passes through
//!
//! Order of checks for `execute(name, input)`:
//! 1. registry lookup (unknown name is a failure)
//! 2. workflow phase check (`can_execute`); denial runs no hooks, logs nothing
//! 3. approved plan step and repair quota (repairs only)
//! 4. pre hooks: `PreTool`, then `PreRepair` for repairs; a veto stops here
//! 5. the operation itself, with remote annotation when a remote target is active
//! 6. repairs: changelog entry (success or failure), quota count, step marked
//! 7. post hooks: `PostTool`, then `PostRepair`, whatever the outcome
//!
//! Nothing escapes `execute`. Errors and panics from operations, hooks and
//! the changelog all resolve to an [`ExecutionOutcome`].

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::changelog::{ChangelogEntry, ChangelogWriter, SystemSnapshot};
use crate::hooks::{panic_message, HookContext, HookEvent, HookManager};
use crate::registry::{OperationCategory, ToolRegistry};
use crate::snapshot::SnapshotProvider;
use crate::transport::CommandRunner;
use crate::usage::UsageTracker;
use crate::workflow::{Verdict, WorkflowStateMachine};

/// Input key holding the plan step an operation belongs to
pub const STEP_KEY: &str = "step";

/// Input key added when the operation runs against a remote target
pub const REMOTE_HOST_KEY: &str = "_remote_host";

/// Separates the operation output from post-hook messages
pub const HOOK_DIVIDER: &str = "\n\n---\n";

/// Result of one `execute` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
}

impl ExecutionOutcome {
    fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    fn fail(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Owns every per-session collaborator of the execution path
pub struct CommandExecutor {
    registry: ToolRegistry,
    workflow: WorkflowStateMachine,
    hooks: HookManager,
    changelog: ChangelogWriter,
    runner: CommandRunner,
    usage: Option<Box<dyn UsageTracker>>,
    snapshots: Option<Box<dyn SnapshotProvider>>,
}

impl CommandExecutor {
    pub fn new(registry: ToolRegistry, changelog: ChangelogWriter) -> Self {
        Self {
            registry,
            workflow: WorkflowStateMachine::new(),
            hooks: HookManager::new(),
            changelog,
            runner: CommandRunner::new(),
            usage: None,
            snapshots: None,
        }
    }

    pub fn with_hooks(mut self, hooks: HookManager) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_runner(mut self, runner: CommandRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_usage(mut self, usage: Box<dyn UsageTracker>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_snapshots(mut self, provider: Box<dyn SnapshotProvider>) -> Self {
        self.snapshots = Some(provider);
        self
    }

    pub fn session_id(&self) -> &str {
        self.changelog.session_id()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ToolRegistry {
        &mut self.registry
    }

    pub fn workflow(&self) -> &WorkflowStateMachine {
        &self.workflow
    }

    pub fn workflow_mut(&mut self) -> &mut WorkflowStateMachine {
        &mut self.workflow
    }

    pub fn hooks_mut(&mut self) -> &mut HookManager {
        &mut self.hooks
    }

    pub fn changelog(&self) -> &ChangelogWriter {
        &self.changelog
    }

    pub fn runner(&self) -> &CommandRunner {
        &self.runner
    }

    pub fn runner_mut(&mut self) -> &mut CommandRunner {
        &mut self.runner
    }

    /// Run one operation through the full gate
    pub async fn execute(&mut self, name: &str, mut input: Map<String, Value>) -> ExecutionOutcome {
        let Some(operation) = self.registry.lookup(name) else {
            return ExecutionOutcome::fail(format!("Tool '{}' not found", name));
        };
        let is_repair = operation.category() == OperationCategory::Repair;

        if let Verdict::Denied(reason) = self.workflow.can_execute(name, is_repair) {
            debug!("Denied {}: {}", name, reason);
            return ExecutionOutcome::fail(reason);
        }

        let mut step = None;
        if is_repair {
            step = match requested_step(&input) {
                Some(n) if !self.workflow.is_step_approved(n) => {
                    return ExecutionOutcome::fail(format!(
                        "Step {} of the repair plan was not approved. Ask for GO REPAIR: {} first.",
                        n, n
                    ));
                }
                Some(n) => Some(n),
                None => self.workflow.next_pending_step(),
            };

            if let Some(usage) = &self.usage {
                if !usage.can_run_repair() {
                    return ExecutionOutcome::fail(usage.limit_message());
                }
            }
        }

        // Pre hooks
        let remote_host = self.runner.remote_host().map(str::to_string);
        let mut notes: Vec<String> = Vec::new();
        let mut pre_events = vec![HookEvent::PreTool];
        if is_repair {
            pre_events.push(HookEvent::PreRepair);
        }
        for event in pre_events {
            let context = HookContext::tool(event, self.session_id(), name, input.clone())
                .with_remote_host(remote_host.clone());
            let result = self.hooks.run(event, context).await;
            if !result.message.is_empty() {
                notes.push(result.message);
            }
            if !result.proceed {
                info!("{} blocked by {} hooks", name, event);
                return ExecutionOutcome::fail(notes.join("\n"));
            }
            if let Some(modified) = result.modified_input {
                input = modified;
            }
        }

        // Operation
        let mut call_input = input.clone();
        if let Some(host) = &remote_host {
            call_input.insert(REMOTE_HOST_KEY.to_string(), Value::String(host.clone()));
        }

        let snapshot_before = if is_repair { self.snapshot().await } else { None };

        let start = Instant::now();
        let outcome = AssertUnwindSafe(operation.execute(&call_input, &self.runner))
            .catch_unwind()
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (success, result_text) = match outcome {
            Ok(Ok(output)) => (true, output),
            Ok(Err(e)) => (false, format!("Error executing '{}': {:#}", name, e)),
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                warn!("Operation {} panicked: {}", name, detail);
                (false, format!("Error executing '{}': {}", name, detail))
            }
        };
        info!("{} finished in {} ms (success={})", name, duration_ms, success);

        // Audit trail, quota, plan progress
        if is_repair {
            let snapshot_after = self.snapshot().await;
            let logged_name = match &remote_host {
                Some(host) => format!("{} [{}]", name, host),
                None => name.to_string(),
            };
            let entry = ChangelogEntry::new(logged_name, &call_input, result_text.clone(), success)
                .with_duration(duration_ms)
                .with_snapshots(snapshot_before, snapshot_after);
            if let Err(e) = self.changelog.append(entry) {
                warn!("Changelog append failed for {}: {}", name, e);
            }

            if success {
                if let Some(usage) = self.usage.as_mut() {
                    usage.increment();
                }
            }

            if let Some(n) = step {
                self.workflow.mark_step_executed(n);
            }
        }

        // Post hooks
        let mut post_events = vec![HookEvent::PostTool];
        if is_repair {
            post_events.push(HookEvent::PostRepair);
        }
        let mut post_messages: Vec<String> = Vec::new();
        for event in post_events {
            let context = HookContext::tool(event, self.session_id(), name, input.clone())
                .with_outcome(success, result_text.clone())
                .with_remote_host(remote_host.clone());
            let result = self.hooks.run(event, context).await;
            if !result.message.is_empty() {
                post_messages.push(result.message);
            }
        }

        let mut output = String::new();
        if !notes.is_empty() {
            output.push_str(&notes.join("\n"));
            output.push_str("\n\n");
        }
        output.push_str(&result_text);
        if !post_messages.is_empty() {
            output.push_str(HOOK_DIVIDER);
            output.push_str(&post_messages.join("\n"));
        }

        if success {
            ExecutionOutcome::ok(output)
        } else {
            ExecutionOutcome::fail(output)
        }
    }

    async fn snapshot(&self) -> Option<SystemSnapshot> {
        let provider = self.snapshots.as_ref()?;
        match provider.capture(&self.runner).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("System snapshot failed: {:#}", e);
                None
            }
        }
    }
}

/// Plan step named by the input, if any
fn requested_step(input: &Map<String, Value>) -> Option<u32> {
    let value = input.get(STEP_KEY)?;
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .and_then(|n| u32::try_from(n).ok())
}
