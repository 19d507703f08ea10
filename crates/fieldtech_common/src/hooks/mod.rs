//! Hook Manager - named handlers around operations and sessions
//!
//! Each hook declares the events it reacts to. The manager runs them in
//! registration order:
//! - pre-events (`PreTool`, `PreRepair`): the first hook answering
//!   `proceed = false` stops the chain, and the caller must not run the
//!   operation. A hook may rewrite the input; later hooks and the operation
//!   see the rewritten input.
//! - post-events (`PostTool`, `PostRepair`, `SessionStart`, `SessionEnd`):
//!   every hook runs, messages are concatenated.
//!
//! A hook that returns an error or panics becomes a message line
//! `"[<name>] hook error: <detail>"` and the pipeline continues.

pub mod builtin;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use tracing::{debug, warn};

pub use builtin::{
    BackupCheckHook, BackupStatusProvider, SessionReportHook, SystemBackupProvider,
    VerifyRepairHook,
};

/// Points in the operation and session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    PreTool,
    PostTool,
    PreRepair,
    PostRepair,
    SessionStart,
    SessionEnd,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::PreTool => "pre_tool",
            HookEvent::PostTool => "post_tool",
            HookEvent::PreRepair => "pre_repair",
            HookEvent::PostRepair => "post_repair",
            HookEvent::SessionStart => "session_start",
            HookEvent::SessionEnd => "session_end",
        }
    }

    /// Pre-events can veto the operation
    pub fn is_pre(&self) -> bool {
        matches!(self, HookEvent::PreTool | HookEvent::PreRepair)
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a hook sees
#[derive(Debug, Clone, PartialEq)]
pub struct HookContext {
    pub event: HookEvent,
    pub session_id: String,
    pub tool_name: String,
    pub tool_input: Map<String, Value>,
    /// Empty before the operation ran
    pub tool_result: String,
    pub tool_success: bool,
    /// Remote target, when one is active
    pub remote_host: Option<String>,
}

impl HookContext {
    /// Context for a session event
    pub fn session(event: HookEvent, session_id: impl Into<String>) -> Self {
        Self {
            event,
            session_id: session_id.into(),
            tool_name: String::new(),
            tool_input: Map::new(),
            tool_result: String::new(),
            tool_success: true,
            remote_host: None,
        }
    }

    /// Context for an operation event
    pub fn tool(
        event: HookEvent,
        session_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_input: Map<String, Value>,
    ) -> Self {
        Self {
            tool_name: tool_name.into(),
            tool_input,
            ..Self::session(event, session_id)
        }
    }

    pub fn with_outcome(mut self, success: bool, result: impl Into<String>) -> Self {
        self.tool_success = success;
        self.tool_result = result.into();
        self
    }

    pub fn with_remote_host(mut self, host: Option<String>) -> Self {
        self.remote_host = host;
        self
    }
}

/// What a hook answers
#[derive(Debug, Clone, PartialEq)]
pub struct HookResult {
    /// Only meaningful for pre-events
    pub proceed: bool,
    pub message: String,
    pub modified_input: Option<Map<String, Value>>,
}

impl Default for HookResult {
    fn default() -> Self {
        Self::neutral()
    }
}

impl HookResult {
    /// Proceed, nothing to say
    pub fn neutral() -> Self {
        Self {
            proceed: true,
            message: String::new(),
            modified_input: None,
        }
    }

    /// Proceed with a message for the user
    pub fn note(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::neutral()
        }
    }

    /// Veto the operation
    pub fn block(message: impl Into<String>) -> Self {
        Self {
            proceed: false,
            message: message.into(),
            modified_input: None,
        }
    }

    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.modified_input = Some(input);
        self
    }
}

/// A named handler for one or more events
#[async_trait]
pub trait Hook: Send {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn events(&self) -> &[HookEvent];

    async fn execute(&mut self, context: &HookContext) -> anyhow::Result<HookResult>;
}

/// Listing entry for `registered_hooks`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookInfo {
    pub name: String,
    pub description: String,
    pub events: Vec<HookEvent>,
}

/// Ordered hook pipeline
pub struct HookManager {
    hooks: Vec<Box<dyn Hook>>,
    enabled: bool,
}

impl Default for HookManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HookManager {
    pub fn new() -> Self {
        Self {
            hooks: Vec::new(),
            enabled: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Disabled managers return the neutral result without running any hook
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Append a hook. Returns false (and keeps the existing one) on a duplicate name.
    pub fn register(&mut self, hook: Box<dyn Hook>) -> bool {
        if self.hooks.iter().any(|h| h.name() == hook.name()) {
            warn!("Hook '{}' already registered, ignoring", hook.name());
            return false;
        }
        self.hooks.push(hook);
        true
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|h| h.name() != name);
        self.hooks.len() < before
    }

    pub fn registered_hooks(&self) -> Vec<HookInfo> {
        self.hooks
            .iter()
            .map(|h| HookInfo {
                name: h.name().to_string(),
                description: h.description().to_string(),
                events: h.events().to_vec(),
            })
            .collect()
    }

    /// Run every hook registered for `event`
    pub async fn run(&mut self, event: HookEvent, mut context: HookContext) -> HookResult {
        if !self.enabled {
            return HookResult::neutral();
        }

        context.event = event;
        let is_pre = event.is_pre();
        let mut messages: Vec<String> = Vec::new();
        let mut modified: Option<Map<String, Value>> = None;

        for hook in self.hooks.iter_mut() {
            if !hook.events().contains(&event) {
                continue;
            }

            let name = hook.name().to_string();
            let outcome = AssertUnwindSafe(hook.execute(&context)).catch_unwind().await;

            let result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    warn!("Hook {} failed on {}: {:#}", name, event, e);
                    messages.push(format!("[{}] hook error: {:#}", name, e));
                    continue;
                }
                Err(panic) => {
                    let detail = panic_message(panic.as_ref());
                    warn!("Hook {} panicked on {}: {}", name, event, detail);
                    messages.push(format!("[{}] hook error: {}", name, detail));
                    continue;
                }
            };

            if !result.message.is_empty() {
                messages.push(format!("[{}] {}", name, result.message));
            }

            if let Some(input) = result.modified_input {
                debug!("Hook {} rewrote input for {}", name, context.tool_name);
                context.tool_input = input.clone();
                modified = Some(input);
            }

            if is_pre && !result.proceed {
                debug!("Hook {} blocked {}", name, context.tool_name);
                return HookResult {
                    proceed: false,
                    message: messages.join("\n"),
                    modified_input: modified,
                };
            }
        }

        HookResult {
            proceed: true,
            message: messages.join("\n"),
            modified_input: if is_pre { modified } else { None },
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Records calls into a shared log and answers with a fixed result
    struct Scripted {
        name: &'static str,
        events: Vec<HookEvent>,
        answer: fn(&HookContext) -> anyhow::Result<HookResult>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Scripted {
        fn new(
            name: &'static str,
            events: &[HookEvent],
            answer: fn(&HookContext) -> anyhow::Result<HookResult>,
            log: &Arc<Mutex<Vec<String>>>,
        ) -> Box<Self> {
            Box::new(Self {
                name,
                events: events.to_vec(),
                answer,
                log: log.clone(),
            })
        }
    }

    #[async_trait]
    impl Hook for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn events(&self) -> &[HookEvent] {
            &self.events
        }

        async fn execute(&mut self, context: &HookContext) -> anyhow::Result<HookResult> {
            self.log.lock().unwrap().push(self.name.to_string());
            (self.answer)(context)
        }
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn ctx(event: HookEvent) -> HookContext {
        HookContext::tool(event, "s1", "cleanup_disk", Map::new())
    }

    #[tokio::test]
    async fn test_no_hooks_is_neutral() {
        let mut manager = HookManager::new();
        let result = manager.run(HookEvent::PreTool, ctx(HookEvent::PreTool)).await;
        assert_eq!(result, HookResult::neutral());
    }

    #[tokio::test]
    async fn test_pre_block_short_circuits() {
        let calls = log();
        let mut manager = HookManager::new();
        manager.register(Scripted::new(
            "A",
            &[HookEvent::PreRepair],
            |_| Ok(HookResult::note("checked")),
            &calls,
        ));
        manager.register(Scripted::new(
            "B",
            &[HookEvent::PreRepair],
            |_| Ok(HookResult::block("no")),
            &calls,
        ));
        manager.register(Scripted::new(
            "C",
            &[HookEvent::PreRepair],
            |_| Ok(HookResult::note("never")),
            &calls,
        ));

        let result = manager.run(HookEvent::PreRepair, ctx(HookEvent::PreRepair)).await;
        assert!(!result.proceed);
        assert_eq!(result.message, "[A] checked\n[B] no");
        assert_eq!(*calls.lock().unwrap(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_post_events_run_everything() {
        let calls = log();
        let mut manager = HookManager::new();
        manager.register(Scripted::new(
            "A",
            &[HookEvent::PostTool],
            |_| Ok(HookResult::block("ignored veto")),
            &calls,
        ));
        manager.register(Scripted::new(
            "B",
            &[HookEvent::PostTool],
            |_| Ok(HookResult::note("second")),
            &calls,
        ));

        let result = manager.run(HookEvent::PostTool, ctx(HookEvent::PostTool)).await;
        assert!(result.proceed);
        assert_eq!(result.message, "[A] ignored veto\n[B] second");
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_errors_become_messages() {
        let calls = log();
        let mut manager = HookManager::new();
        manager.register(Scripted::new(
            "Broken",
            &[HookEvent::PreTool],
            |_| Err(anyhow::anyhow!("disk probe failed")),
            &calls,
        ));
        manager.register(Scripted::new(
            "Next",
            &[HookEvent::PreTool],
            |_| Ok(HookResult::neutral()),
            &calls,
        ));

        let result = manager.run(HookEvent::PreTool, ctx(HookEvent::PreTool)).await;
        assert!(result.proceed);
        assert_eq!(result.message, "[Broken] hook error: disk probe failed");
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_panics_become_messages() {
        let calls = log();
        let mut manager = HookManager::new();
        manager.register(Scripted::new(
            "Panicky",
            &[HookEvent::PostRepair],
            |_| panic!("boom"),
            &calls,
        ));
        manager.register(Scripted::new(
            "After",
            &[HookEvent::PostRepair],
            |_| Ok(HookResult::note("still here")),
            &calls,
        ));

        let result = manager.run(HookEvent::PostRepair, ctx(HookEvent::PostRepair)).await;
        assert_eq!(result.message, "[Panicky] hook error: panic: boom\n[After] still here");
    }

    #[tokio::test]
    async fn test_modified_input_threads_through() {
        let calls = log();
        let mut manager = HookManager::new();
        manager.register(Scripted::new(
            "Rewrite",
            &[HookEvent::PreTool],
            |_| {
                let input = json!({"path": "/safe"}).as_object().cloned().unwrap();
                Ok(HookResult::neutral().with_input(input))
            },
            &calls,
        ));
        manager.register(Scripted::new(
            "Check",
            &[HookEvent::PreTool],
            |c| {
                if c.tool_input.get("path") == Some(&json!("/safe")) {
                    Ok(HookResult::note("saw rewrite"))
                } else {
                    Ok(HookResult::block("original input leaked"))
                }
            },
            &calls,
        ));

        let result = manager.run(HookEvent::PreTool, ctx(HookEvent::PreTool)).await;
        assert!(result.proceed);
        assert_eq!(result.message, "[Check] saw rewrite");
        assert_eq!(result.modified_input.unwrap().get("path"), Some(&json!("/safe")));
    }

    #[tokio::test]
    async fn test_disabled_manager_skips_hooks() {
        let calls = log();
        let mut manager = HookManager::new();
        manager.register(Scripted::new(
            "A",
            &[HookEvent::PreTool],
            |_| Ok(HookResult::block("no")),
            &calls,
        ));
        manager.set_enabled(false);

        let result = manager.run(HookEvent::PreTool, ctx(HookEvent::PreTool)).await;
        assert_eq!(result, HookResult::neutral());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_subscribed_hooks_run() {
        let calls = log();
        let mut manager = HookManager::new();
        manager.register(Scripted::new(
            "Pre",
            &[HookEvent::PreTool],
            |_| Ok(HookResult::note("pre")),
            &calls,
        ));
        manager.register(Scripted::new(
            "End",
            &[HookEvent::SessionEnd],
            |_| Ok(HookResult::note("end")),
            &calls,
        ));

        let result = manager
            .run(HookEvent::SessionEnd, HookContext::session(HookEvent::SessionEnd, "s1"))
            .await;
        assert_eq!(result.message, "[End] end");
        assert_eq!(*calls.lock().unwrap(), vec!["End"]);
    }

    #[test]
    fn test_register_unregister_and_listing() {
        let calls = log();
        let mut manager = HookManager::new();
        assert!(manager.register(Scripted::new(
            "A",
            &[HookEvent::PreTool, HookEvent::PostTool],
            |_| Ok(HookResult::neutral()),
            &calls,
        )));
        assert!(!manager.register(Scripted::new(
            "A",
            &[HookEvent::PreTool],
            |_| Ok(HookResult::neutral()),
            &calls,
        )));

        let listed = manager.registered_hooks();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].events, vec![HookEvent::PreTool, HookEvent::PostTool]);

        assert!(manager.unregister("A"));
        assert!(!manager.unregister("A"));
        assert!(manager.registered_hooks().is_empty());
    }
}
