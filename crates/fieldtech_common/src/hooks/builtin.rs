//! Built-in hooks
//!
//! - [`BackupCheckHook`]: before the first repair of a session, warn when no
//!   backup or restore point exists. Never blocks.
//! - [`VerifyRepairHook`]: after each repair, confirm or ask for manual checks.
//! - [`SessionReportHook`]: tally operations and summarize at session end.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

use super::{Hook, HookContext, HookEvent, HookResult};
use crate::transport::local::run_local;

/// Answers "is there a recent backup?"
#[async_trait]
pub trait BackupStatusProvider: Send + Sync {
    /// `Some(description)` of the newest backup, `None` when there is none
    async fn latest_backup(&self) -> anyhow::Result<Option<String>>;
}

/// Platform backup detection on this machine.
///
/// macOS: Time Machine (`tmutil latestbackup`). Windows: the newest system
/// restore point. Linux: timeshift, then snapper.
#[derive(Debug, Clone)]
pub struct SystemBackupProvider {
    timeout: Duration,
}

impl Default for SystemBackupProvider {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl SystemBackupProvider {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn probe(&self, argv: &[&str]) -> Option<String> {
        let cmd: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        let result = run_local(&cmd, self.timeout).await;
        if result.success && !result.stdout.trim().is_empty() {
            Some(result.stdout)
        } else {
            None
        }
    }
}

#[async_trait]
impl BackupStatusProvider for SystemBackupProvider {
    async fn latest_backup(&self) -> anyhow::Result<Option<String>> {
        if cfg!(target_os = "macos") {
            let latest = self.probe(&["tmutil", "latestbackup"]).await;
            return Ok(latest.map(|path| {
                let name = path.trim().rsplit('/').next().unwrap_or("").to_string();
                format!("Time Machine backup {}", name)
            }));
        }

        if cfg!(target_os = "windows") {
            let latest = self
                .probe(&[
                    "powershell",
                    "-NoProfile",
                    "-Command",
                    "Get-ComputerRestorePoint | Sort-Object SequenceNumber -Descending | \
                     Select-Object -First 1 -ExpandProperty Description",
                ])
                .await;
            return Ok(latest.map(|desc| {
                let desc: String = desc.trim().chars().take(60).collect();
                format!("restore point '{}'", desc)
            }));
        }

        if let Some(list) = self.probe(&["timeshift", "--list", "--scripted"]).await {
            let newest = list
                .lines()
                .filter(|l| l.trim_start().starts_with(|c: char| c.is_ascii_digit()))
                .last();
            if let Some(line) = newest {
                return Ok(Some(format!("timeshift snapshot {}", line.trim())));
            }
        }

        if let Some(list) = self.probe(&["snapper", "list"]).await {
            // header, separator, then snapshot 0 ("current") is not a backup
            if let Some(line) = list.lines().skip(3).last() {
                return Ok(Some(format!("snapper snapshot {}", line.trim())));
            }
        }

        Ok(None)
    }
}

/// Warns once per session when no backup is found
pub struct BackupCheckHook {
    provider: Box<dyn BackupStatusProvider>,
    cached: Option<HookResult>,
}

impl BackupCheckHook {
    pub fn new(provider: Box<dyn BackupStatusProvider>) -> Self {
        Self {
            provider,
            cached: None,
        }
    }

    /// Forget the cached verdict (new session)
    pub fn reset(&mut self) {
        self.cached = None;
    }
}

#[async_trait]
impl Hook for BackupCheckHook {
    fn name(&self) -> &str {
        "BackupCheck"
    }

    fn description(&self) -> &str {
        "Warns before repairs when no recent backup exists"
    }

    fn events(&self) -> &[HookEvent] {
        &[HookEvent::PreRepair]
    }

    async fn execute(&mut self, _context: &HookContext) -> anyhow::Result<HookResult> {
        if let Some(cached) = &self.cached {
            return Ok(cached.clone());
        }

        let verdict = match self.provider.latest_backup().await {
            Ok(Some(backup)) => {
                info!("Backup check: {}", backup);
                HookResult::note(format!("Backup found: {}", backup))
            }
            Ok(None) => HookResult::note(
                "WARNING: no recent backup or restore point found. \
                 Create one before running repairs.",
            ),
            Err(e) => {
                warn!("Backup check failed: {:#}", e);
                HookResult::note(format!("WARNING: could not verify backups ({})", e))
            }
        };

        self.cached = Some(verdict.clone());
        Ok(verdict)
    }
}

/// Reports on each repair's outcome
#[derive(Debug, Default)]
pub struct VerifyRepairHook;

#[async_trait]
impl Hook for VerifyRepairHook {
    fn name(&self) -> &str {
        "VerifyRepair"
    }

    fn description(&self) -> &str {
        "Reports whether a repair completed"
    }

    fn events(&self) -> &[HookEvent] {
        &[HookEvent::PostRepair]
    }

    async fn execute(&mut self, context: &HookContext) -> anyhow::Result<HookResult> {
        let message = if context.tool_success {
            format!("Repair '{}' completed", context.tool_name)
        } else {
            format!(
                "WARNING: repair '{}' may have failed - verify manually",
                context.tool_name
            )
        };
        Ok(HookResult::note(message))
    }
}

/// Collects `(operation, success)` and summarizes at session end
#[derive(Debug, Default)]
pub struct SessionReportHook {
    actions: Vec<(String, bool)>,
}

impl SessionReportHook {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Hook for SessionReportHook {
    fn name(&self) -> &str {
        "SessionReport"
    }

    fn description(&self) -> &str {
        "Summarizes the session's operations at session end"
    }

    fn events(&self) -> &[HookEvent] {
        &[HookEvent::PostTool, HookEvent::SessionEnd]
    }

    async fn execute(&mut self, context: &HookContext) -> anyhow::Result<HookResult> {
        match context.event {
            HookEvent::PostTool => {
                self.actions
                    .push((context.tool_name.clone(), context.tool_success));
                Ok(HookResult::neutral())
            }
            HookEvent::SessionEnd if !self.actions.is_empty() => {
                let total = self.actions.len();
                let succeeded = self.actions.iter().filter(|(_, ok)| *ok).count();
                let tools: BTreeSet<&str> =
                    self.actions.iter().map(|(name, _)| name.as_str()).collect();
                let message = format!(
                    "Session summary: {} operations ({} succeeded). Tools: {}",
                    total,
                    succeeded,
                    tools.into_iter().collect::<Vec<_>>().join(", ")
                );
                self.actions.clear();
                Ok(HookResult::note(message))
            }
            _ => Ok(HookResult::neutral()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookManager;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedProvider {
        answer: Option<&'static str>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BackupStatusProvider for FixedProvider {
        async fn latest_backup(&self) -> anyhow::Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.map(str::to_string))
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl BackupStatusProvider for FailingProvider {
        async fn latest_backup(&self) -> anyhow::Result<Option<String>> {
            anyhow::bail!("tmutil not permitted")
        }
    }

    fn repair_ctx(event: HookEvent, success: bool) -> HookContext {
        HookContext::tool(event, "s1", "cleanup_disk", Map::new()).with_outcome(success, "")
    }

    #[tokio::test]
    async fn test_backup_check_warns_but_proceeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut hook = BackupCheckHook::new(Box::new(FixedProvider {
            answer: None,
            calls: calls.clone(),
        }));

        let result = hook.execute(&repair_ctx(HookEvent::PreRepair, true)).await.unwrap();
        assert!(result.proceed);
        assert!(result.message.contains("no recent backup"));
    }

    #[tokio::test]
    async fn test_backup_check_runs_once_per_session() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut hook = BackupCheckHook::new(Box::new(FixedProvider {
            answer: Some("2026-03-01-101500"),
            calls: calls.clone(),
        }));

        let first = hook.execute(&repair_ctx(HookEvent::PreRepair, true)).await.unwrap();
        let second = hook.execute(&repair_ctx(HookEvent::PreRepair, true)).await.unwrap();
        assert_eq!(first, second);
        assert!(first.message.contains("2026-03-01-101500"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        hook.reset();
        hook.execute(&repair_ctx(HookEvent::PreRepair, true)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_backup_provider_error_is_a_warning() {
        let mut hook = BackupCheckHook::new(Box::new(FailingProvider));
        let result = hook.execute(&repair_ctx(HookEvent::PreRepair, true)).await.unwrap();
        assert!(result.proceed);
        assert!(result.message.contains("could not verify backups"));
    }

    #[tokio::test]
    async fn test_verify_repair_messages() {
        let mut hook = VerifyRepairHook;
        let ok = hook.execute(&repair_ctx(HookEvent::PostRepair, true)).await.unwrap();
        assert_eq!(ok.message, "Repair 'cleanup_disk' completed");

        let failed = hook.execute(&repair_ctx(HookEvent::PostRepair, false)).await.unwrap();
        assert!(failed.message.contains("verify manually"));
    }

    #[tokio::test]
    async fn test_session_report_through_manager() {
        let mut manager = HookManager::new();
        manager.register(Box::new(SessionReportHook::new()));

        let calls = [
            ("get_system_info", true),
            ("cleanup_disk", false),
            ("get_system_info", true),
        ];
        for (name, ok) in calls {
            let ctx =
                HookContext::tool(HookEvent::PostTool, "s1", name, Map::new()).with_outcome(ok, "");
            let result = manager.run(HookEvent::PostTool, ctx).await;
            assert_eq!(result.message, "");
        }

        let end = manager
            .run(HookEvent::SessionEnd, HookContext::session(HookEvent::SessionEnd, "s1"))
            .await;
        assert_eq!(
            end.message,
            "[SessionReport] Session summary: 3 operations (2 succeeded). Tools: cleanup_disk, get_system_info"
        );
    }

    #[tokio::test]
    async fn test_session_report_silent_without_actions() {
        let mut hook = SessionReportHook::new();
        let result = hook
            .execute(&HookContext::session(HookEvent::SessionEnd, "s1"))
            .await
            .unwrap();
        assert_eq!(result, HookResult::neutral());
    }
}
