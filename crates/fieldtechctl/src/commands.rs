//! Command implementations
//!
//! Every command returns the text to print; `main` only prints and picks the
//! exit code.

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;

use fieldtech_common::approval;
use fieldtech_common::changelog::{format_summary, list_changelogs, ChangelogDocument};
use fieldtech_common::config::{config_path, FieldtechConfig};
use fieldtech_common::operations::{builtin_registry, CommandOperation};
use fieldtech_common::usage::{FileUsageTracker, UsageTracker};
use fieldtech_common::{ApprovalOutcome, OperationCategory, Session, ToolRegistry};

use crate::target::Target;

/// Name under which `run` registers the ad-hoc command
pub const RUN_OPERATION: &str = "run_command";

/// What one command produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub success: bool,
    pub text: String,
}

impl Report {
    fn ok(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: text.into(),
        }
    }
}

/// `approve <text>` - show how a message would be read
pub fn approve(text: &str) -> Report {
    match approval::parse(text) {
        None => Report {
            success: false,
            text: "Not a GO command. Expected e.g. \"GO REPAIR: 1,2\" or \"GO REPAIR: 1-3\"."
                .to_string(),
        },
        Some(steps) if !steps.free_text.is_empty() => Report::ok(format!(
            "Approved: all steps (\"{}\")",
            steps.free_text
        )),
        Some(steps) if steps == approval::ApprovedSteps::all("") => {
            Report::ok("Approved: all steps")
        }
        Some(steps) => Report::ok(format!(
            "Approved steps: {}",
            approval::format_steps(&steps.steps)
        )),
    }
}

/// Options for `run`
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub target: Target,
    pub argv: Vec<String>,
    /// Treat the command as state-changing (needs approval, gets logged)
    pub repair: bool,
    /// Approval text for repairs, e.g. "GO REPAIR"
    pub approval: Option<String>,
}

/// `run [--repair --approve TEXT] -- <cmd...>` through a full session
pub async fn run(config: &FieldtechConfig, request: RunRequest) -> Result<Report> {
    if request.argv.is_empty() {
        bail!("no command given");
    }

    let category = if request.repair {
        OperationCategory::Repair
    } else {
        OperationCategory::Audit
    };
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(CommandOperation::new(
        RUN_OPERATION,
        "Ad-hoc command from the command line",
        category,
        request.argv.clone(),
    )))?;

    let mut session = Session::from_config(config, registry);
    let mut lines = Vec::new();
    push_nonempty(&mut lines, session.start().await);

    request
        .target
        .connect(session.runner_mut(), config)
        .await
        .with_context(|| format!("connecting to {}", request.target.describe()))?;

    if request.repair {
        let Some(text) = request.approval.as_deref() else {
            bail!("repair commands need explicit approval, e.g. --approve \"GO REPAIR\"");
        };
        session.propose_plan(format!("1. {}", request.argv.join(" ")))?;
        match session.handle_input(text)? {
            ApprovalOutcome::Locked(_) => {}
            ApprovalOutcome::NotAnApproval => bail!("'{}' is not a GO command", text),
            other => bail!("{}", other.message()),
        }
    }

    let outcome = session.execute(RUN_OPERATION, Map::new()).await;
    push_nonempty(&mut lines, outcome.output);

    let summary = session.end().await;
    if request.repair {
        push_nonempty(&mut lines, summary);
    }

    Ok(Report {
        success: outcome.success,
        text: lines.join("\n\n"),
    })
}

/// `read <path>` on the selected target
pub async fn read(config: &FieldtechConfig, target: &Target, path: &str) -> Result<Report> {
    file_operation(config, target, "read_file", json!({ "path": path })).await
}

/// `search <path> <pattern>` on the selected target
pub async fn search(
    config: &FieldtechConfig,
    target: &Target,
    path: &str,
    pattern: &str,
) -> Result<Report> {
    file_operation(
        config,
        target,
        "search_file",
        json!({ "path": path, "pattern": pattern }),
    )
    .await
}

async fn file_operation(
    config: &FieldtechConfig,
    target: &Target,
    name: &str,
    input: Value,
) -> Result<Report> {
    let mut session = Session::from_config(config, builtin_registry()?);
    target
        .connect(session.runner_mut(), config)
        .await
        .with_context(|| format!("connecting to {}", target.describe()))?;

    let input = match input {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let outcome = session.execute(name, input).await;
    session.end().await;

    Ok(Report {
        success: outcome.success,
        text: outcome.output,
    })
}

/// `changelog list`
pub fn changelog_list(config: &FieldtechConfig) -> Result<Report> {
    let dir = config.changelog_dir();
    let infos = list_changelogs(&dir)?;
    if infos.is_empty() {
        return Ok(Report::ok(format!("No changelogs in {}", dir.display())));
    }

    let mut lines = vec![format!(
        "{:<38} {:<20} {:>7} {:>8}",
        "SESSION", "CREATED", "ENTRIES", "FAILURES"
    )];
    for info in infos {
        lines.push(format!(
            "{:<38} {:<20} {:>7} {:>8}",
            info.session_id,
            info.created_at.format("%Y-%m-%d %H:%M:%S"),
            info.entries,
            info.failures
        ));
    }
    Ok(Report::ok(lines.join("\n")))
}

/// `changelog show <session>`
pub fn changelog_show(config: &FieldtechConfig, session_id: &str) -> Result<Report> {
    if session_id.contains(['/', '\\']) || session_id.starts_with('.') {
        bail!("invalid session id '{}'", session_id);
    }
    let path = config.changelog_dir().join(format!("{}.json", session_id));
    if !path.exists() {
        bail!("no changelog for session '{}' in {}", session_id, config.changelog_dir().display());
    }

    let document = ChangelogDocument::load(&path)?;
    Ok(Report::ok(format!(
        "Session {} (started {})\n\n{}",
        document.session_id,
        document.created_at.format("%Y-%m-%d %H:%M:%S"),
        format_summary(&document)
    )))
}

/// `usage` - this month's counters
pub fn usage(config: &FieldtechConfig) -> Report {
    let tracker = FileUsageTracker::load(config.usage_path(), &config.usage);
    Report::ok(format!(
        "Edition: {}\n{}\nSessions this month: {}",
        tracker.edition().as_str(),
        tracker.limit_message(),
        tracker.session_count()
    ))
}

/// `config [--init]` - effective configuration, optionally written out
pub fn config(config: &FieldtechConfig, init: bool) -> Result<Report> {
    let path = config_path();
    config_at(config, &path, init)
}

fn config_at(config: &FieldtechConfig, path: &Path, init: bool) -> Result<Report> {
    let mut lines = Vec::new();
    if init {
        if path.exists() {
            bail!("{} already exists", path.display());
        }
        config.save_to(path)?;
        lines.push(format!("Wrote {}", path.display()));
    } else if path.exists() {
        lines.push(format!("Config file: {}", path.display()));
    } else {
        lines.push(format!(
            "Config file: {} (using defaults, file not created yet)",
            path.display()
        ));
    }

    lines.push(String::new());
    lines.push(toml::to_string_pretty(config).context("rendering config")?);
    Ok(Report::ok(lines.join("\n")))
}

fn push_nonempty(lines: &mut Vec<String>, text: String) {
    if !text.trim().is_empty() {
        lines.push(text);
    }
}
