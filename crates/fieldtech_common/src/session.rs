//! Session - the front-end facing wrapper around one executor
//!
//! Routes raw human text through the approval parser, fires the session
//! lifecycle hooks and closes the workflow at the end.

use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::approval::{self, ApprovedSteps};
use crate::changelog::ChangelogWriter;
use crate::config::FieldtechConfig;
use crate::error::Result;
use crate::executor::{CommandExecutor, ExecutionOutcome};
use crate::hooks::{
    BackupCheckHook, HookContext, HookEvent, HookManager, SessionReportHook,
    SystemBackupProvider, VerifyRepairHook,
};
use crate::redaction::PatternRedactor;
use crate::registry::ToolRegistry;
use crate::snapshot::TargetSnapshotProvider;
use crate::transport::{CommandRunner, RunnerLimits};
use crate::usage::FileUsageTracker;
use crate::workflow::{WorkflowState, WorkflowStatus};

/// Fresh random session id
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// What happened to a piece of human text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// Ordinary conversation, pass it on
    NotAnApproval,
    /// A GO command arrived while no plan was waiting for approval
    WrongState(WorkflowState),
    /// Execution lock is now active
    Locked(ApprovedSteps),
}

impl ApprovalOutcome {
    /// Text for the human, empty for ordinary conversation
    pub fn message(&self) -> String {
        match self {
            ApprovalOutcome::NotAnApproval => String::new(),
            ApprovalOutcome::WrongState(state) => format!(
                "GO REPAIR is only accepted while a repair plan is waiting (current state: {}).\n\
                 Workflow: Audit -> Analysis -> Plan -> GO REPAIR",
                state
            ),
            ApprovalOutcome::Locked(steps) if !steps.free_text.is_empty() => format!(
                "Execution lock active for: {}",
                steps.free_text
            ),
            ApprovalOutcome::Locked(steps) => format!(
                "Execution lock active for steps: {}",
                approval::format_steps(&steps.steps)
            ),
        }
    }
}

pub struct Session {
    executor: CommandExecutor,
    started: bool,
}

impl Session {
    pub fn new(executor: CommandExecutor) -> Self {
        Self {
            executor,
            started: false,
        }
    }

    /// Wire up a session from configuration.
    ///
    /// Built-in hooks: BackupCheck (when enabled), VerifyRepair, SessionReport.
    /// Changelog inputs and results are redacted before they are stored.
    pub fn from_config(config: &FieldtechConfig, registry: ToolRegistry) -> Self {
        let session_id = new_session_id();

        let changelog = ChangelogWriter::new(&session_id, config.changelog_dir()).with_redactor(
            Box::new(PatternRedactor::new()),
            config.changelog.redaction_fail_closed,
        );

        let mut hooks = HookManager::new();
        hooks.set_enabled(config.hooks.enabled);
        if config.hooks.backup_check {
            hooks.register(Box::new(BackupCheckHook::new(Box::new(
                SystemBackupProvider::default(),
            ))));
        }
        hooks.register(Box::new(VerifyRepairHook));
        hooks.register(Box::new(SessionReportHook::new()));

        let mut usage = FileUsageTracker::load(config.usage_path(), &config.usage);
        usage.record_session();

        let executor = CommandExecutor::new(registry, changelog)
            .with_hooks(hooks)
            .with_runner(CommandRunner::with_limits(RunnerLimits::from(&config.transport)))
            .with_usage(Box::new(usage))
            .with_snapshots(Box::new(TargetSnapshotProvider::new()));

        info!("Session {} created", session_id);
        Self::new(executor)
    }

    pub fn id(&self) -> &str {
        self.executor.session_id()
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut CommandExecutor {
        &mut self.executor
    }

    pub fn runner_mut(&mut self) -> &mut CommandRunner {
        self.executor.runner_mut()
    }

    pub fn status(&self) -> WorkflowStatus {
        self.executor.workflow().status()
    }

    /// Fire `SessionStart` once; returns the hook messages
    pub async fn start(&mut self) -> String {
        if self.started {
            return String::new();
        }
        self.started = true;

        let context = HookContext::session(HookEvent::SessionStart, self.id());
        self.executor
            .hooks_mut()
            .run(HookEvent::SessionStart, context)
            .await
            .message
    }

    /// Audit is done, findings are being analysed
    pub fn begin_analysis(&mut self) {
        self.executor.workflow_mut().begin_analysis();
    }

    /// Present a repair plan and wait for GO REPAIR
    pub fn propose_plan(&mut self, plan: impl Into<String>) -> Result<()> {
        self.executor.workflow_mut().transition_to_plan_ready(plan)
    }

    /// Check human text for a GO command and lock execution when it is one
    pub fn handle_input(&mut self, text: &str) -> Result<ApprovalOutcome> {
        let Some(steps) = approval::parse(text) else {
            return Ok(ApprovalOutcome::NotAnApproval);
        };

        let state = self.executor.workflow().state();
        if state != WorkflowState::PlanReady {
            info!("GO command ignored in state {}", state);
            return Ok(ApprovalOutcome::WrongState(state));
        }

        self.executor.workflow_mut().lock_execution(steps.clone())?;
        Ok(ApprovalOutcome::Locked(steps))
    }

    pub async fn execute(&mut self, name: &str, input: Map<String, Value>) -> ExecutionOutcome {
        self.executor.execute(name, input).await
    }

    /// Close the session: `SessionEnd` hooks, workflow completion, disconnect.
    ///
    /// Returns the hook messages followed by the changelog summary.
    pub async fn end(&mut self) -> String {
        let context = HookContext::session(HookEvent::SessionEnd, self.id());
        let report = self
            .executor
            .hooks_mut()
            .run(HookEvent::SessionEnd, context)
            .await
            .message;

        self.executor.workflow_mut().complete_session();
        self.executor.runner_mut().disconnect().await;
        info!("Session {} ended", self.id());

        let summary = self.executor.changelog().summary();
        if report.is_empty() {
            summary
        } else {
            format!("{}\n\n{}", report, summary)
        }
    }
}
