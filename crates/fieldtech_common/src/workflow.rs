//! Workflow State Machine - the approval gate for repair operations
//!
//! Session phases:
//! Idle -> Audit -> Analysis -> PlanReady -> Locked -> Executing -> Completed
//!
//! Rules:
//! - Audit (read-only) operations: always allowed, except after completion
//! - Repair (mutating) operations: only in Locked / Executing
//! - GO REPAIR: PlanReady -> Locked
//!
//! A repair attempt before approval moves the session to PlanReady and is
//! denied, so the caller learns a plan now needs explicit approval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::approval::ApprovedSteps;
use crate::error::{FieldtechError, Result};

/// Workflow phase of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Nothing has happened yet
    Idle,
    /// Read-only diagnosis in progress
    Audit,
    /// Findings are being analysed
    Analysis,
    /// A repair plan exists and waits for GO REPAIR
    PlanReady,
    /// GO REPAIR received, repair operations unlocked
    Locked,
    /// At least one approved step has run
    Executing,
    /// Session closed, nothing runs any more
    Completed,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Audit => "audit",
            Self::Analysis => "analysis",
            Self::PlanReady => "plan_ready",
            Self::Locked => "locked",
            Self::Executing => "executing",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Answer to "may this operation run now?"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied(String),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }

    /// Denial reason, empty when allowed
    pub fn reason(&self) -> &str {
        match self {
            Verdict::Allowed => "",
            Verdict::Denied(reason) => reason,
        }
    }
}

/// Serializable view of the machine for status displays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub state: WorkflowState,
    pub has_plan: bool,
    pub approved_steps: Vec<u32>,
    pub approval_text: String,
    pub executed_steps: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct WorkflowStateMachine {
    state: WorkflowState,
    repair_plan: Option<String>,
    approval: Option<ApprovedSteps>,
    executed_steps: BTreeSet<u32>,
    history: Vec<(WorkflowState, DateTime<Utc>)>,
}

impl Default for WorkflowStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowStateMachine {
    pub fn new() -> Self {
        Self {
            state: WorkflowState::Idle,
            repair_plan: None,
            approval: None,
            executed_steps: BTreeSet::new(),
            history: vec![(WorkflowState::Idle, Utc::now())],
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn repair_plan(&self) -> Option<&str> {
        self.repair_plan.as_deref()
    }

    pub fn approval(&self) -> Option<&ApprovedSteps> {
        self.approval.as_ref()
    }

    pub fn executed_steps(&self) -> &BTreeSet<u32> {
        &self.executed_steps
    }

    /// Transition log, oldest first. Diagnostics only.
    pub fn history(&self) -> &[(WorkflowState, DateTime<Utc>)] {
        &self.history
    }

    fn transition_to(&mut self, next: WorkflowState) {
        debug!("Workflow transition {} -> {}", self.state, next);
        self.state = next;
        self.history.push((next, Utc::now()));
    }

    /// Decide whether `tool_name` may run in the current phase.
    ///
    /// Side effects: the first audit call moves Idle to Audit, and an early
    /// repair call moves Idle/Audit/Analysis to PlanReady.
    pub fn can_execute(&mut self, tool_name: &str, is_repair: bool) -> Verdict {
        if self.state == WorkflowState::Completed {
            return Verdict::Denied(
                "Session already completed. Start a new session.".to_string(),
            );
        }

        if !is_repair {
            if self.state == WorkflowState::Idle {
                self.transition_to(WorkflowState::Audit);
            }
            return Verdict::Allowed;
        }

        match self.state {
            WorkflowState::Locked | WorkflowState::Executing => Verdict::Allowed,
            WorkflowState::Idle | WorkflowState::Audit | WorkflowState::Analysis => {
                self.transition_to(WorkflowState::PlanReady);
                info!("Repair tool '{}' requested before approval, plan now pending", tool_name);
                Verdict::Denied(repair_denied_message(tool_name))
            }
            WorkflowState::PlanReady => Verdict::Denied(repair_denied_message(tool_name)),
            WorkflowState::Completed => Verdict::Denied(
                "Session already completed. Start a new session.".to_string(),
            ),
        }
    }

    /// Audit -> Analysis. No-op in any other phase.
    pub fn begin_analysis(&mut self) {
        if self.state == WorkflowState::Audit {
            self.transition_to(WorkflowState::Analysis);
        }
    }

    /// Attach the repair plan and wait for approval
    pub fn transition_to_plan_ready(&mut self, plan: impl Into<String>) -> Result<()> {
        if self.state == WorkflowState::Completed {
            return Err(FieldtechError::InvalidTransition {
                from: self.state,
                action: "transition_to_plan_ready",
            });
        }

        self.repair_plan = Some(plan.into());
        self.transition_to(WorkflowState::PlanReady);
        Ok(())
    }

    /// Activate the execution lock after GO REPAIR.
    ///
    /// Only valid in PlanReady. Any other phase means the caller skipped a
    /// step of the workflow; the error must not be retried.
    pub fn lock_execution(&mut self, approval: ApprovedSteps) -> Result<()> {
        if self.state != WorkflowState::PlanReady {
            return Err(FieldtechError::InvalidTransition {
                from: self.state,
                action: "lock_execution",
            });
        }

        info!("Execution lock activated for {} step(s)", approval.steps.len());
        self.approval = Some(approval);
        self.transition_to(WorkflowState::Locked);
        Ok(())
    }

    pub fn is_step_approved(&self, step: u32) -> bool {
        self.approval
            .as_ref()
            .map(|a| a.contains(step))
            .unwrap_or(false)
    }

    /// Record that a step ran. Repeated marks are no-ops.
    pub fn mark_step_executed(&mut self, step: u32) {
        self.executed_steps.insert(step);

        if self.state == WorkflowState::Locked {
            self.transition_to(WorkflowState::Executing);
        }
    }

    /// Lowest approved step that has not run yet
    pub fn next_pending_step(&self) -> Option<u32> {
        self.approval
            .as_ref()?
            .steps
            .iter()
            .copied()
            .find(|s| !self.executed_steps.contains(s))
    }

    pub fn complete_session(&mut self) {
        self.transition_to(WorkflowState::Completed);
    }

    /// Back to Idle with no plan, approvals or history
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn status(&self) -> WorkflowStatus {
        WorkflowStatus {
            state: self.state,
            has_plan: self.repair_plan.is_some(),
            approved_steps: self.approval.as_ref().map(|a| a.as_vec()).unwrap_or_default(),
            approval_text: self
                .approval
                .as_ref()
                .map(|a| a.free_text.clone())
                .unwrap_or_default(),
            executed_steps: self.executed_steps.iter().copied().collect(),
        }
    }
}

fn repair_denied_message(tool_name: &str) -> String {
    format!(
        "Tool '{}' is a repair tool and can only run after GO REPAIR approval.\n\
         Workflow: Audit -> Analysis -> Plan -> Approval -> Execute",
        tool_name
    )
}
