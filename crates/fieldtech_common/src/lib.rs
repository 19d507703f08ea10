//! Fieldtech Common - execution-authorization core for maintenance sessions
//!
//! Every operation requested in a session passes through one gate:
//! registry lookup, workflow phase check, pre hooks, execution on the active
//! transport (local, SSH or WinRM), changelog, post hooks. Mutating
//! operations only run after an explicit "GO REPAIR" from a human.

pub mod approval;
pub mod changelog;
pub mod config;
pub mod error;
pub mod executor;
pub mod fsutil;
pub mod hooks;
pub mod operations;
pub mod redaction;
pub mod registry;
pub mod session;
pub mod snapshot;
pub mod transport;
pub mod usage;
pub mod workflow;

pub use approval::ApprovedSteps;
pub use changelog::{ChangelogEntry, ChangelogWriter};
pub use config::FieldtechConfig;
pub use error::{FieldtechError, Result};
pub use executor::{CommandExecutor, ExecutionOutcome};
pub use hooks::{Hook, HookContext, HookEvent, HookManager, HookResult};
pub use registry::{Operation, OperationCategory, ToolRegistry};
pub use session::{ApprovalOutcome, Session};
pub use transport::{CommandResult, CommandRunner, ExecutionStatus, TransportKind};
pub use workflow::{Verdict, WorkflowState, WorkflowStateMachine};
