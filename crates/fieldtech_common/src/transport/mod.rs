//! Transport Router - one entry point for every system command
//!
//! Operations never spawn processes themselves. They hand argv lists to the
//! [`CommandRunner`], which routes to exactly one of:
//! - local: child process on this machine
//! - ssh: an established SSH session (macOS/Linux targets)
//! - winrm: PowerShell remoting (Windows targets)
//!
//! Every path returns the same [`CommandResult`] shape. Failures of any kind
//! (timeout, missing binary, dropped connection) are results, not errors.
//!
//! The runner owns at most one remote connection. Attaching a new target
//! always tears the previous one down first.

pub mod local;
pub mod ssh;
pub mod winrm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::TransportSettings;
use crate::error::Result;

pub use ssh::{SshConfig, SshConnection};
pub use winrm::{WinrmConfig, WinrmConnection};

/// Which transport produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Local,
    Ssh,
    Winrm,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Ssh => "ssh",
            Self::Winrm => "winrm",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Command ran successfully (exit code 0)
    Success,
    /// Command ran but returned non-zero exit code
    NonZeroExit,
    /// Executable not found on the target
    CommandNotFound,
    /// Permission denied
    PermissionDenied,
    /// Command timed out and was killed
    Timeout,
    /// Remote transport selected but no live connection
    NotConnected,
    /// SSH/WinRM protocol or channel failure
    TransportError,
    /// Other OS error (spawn failure, unreadable file, ...)
    OsError,
}

impl ExecutionStatus {
    /// Human-readable description
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NonZeroExit => "non-zero exit",
            Self::CommandNotFound => "command not found",
            Self::PermissionDenied => "permission denied",
            Self::Timeout => "timeout",
            Self::NotConnected => "not connected",
            Self::TransportError => "transport error",
            Self::OsError => "OS error",
        }
    }
}

/// Result of a command execution, identical for all transports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (-1 when the command never produced one)
    pub exit_code: i32,
    pub success: bool,
    pub duration_ms: u64,
    /// Transport that produced this result
    pub source: TransportKind,
    pub status: ExecutionStatus,
}

impl CommandResult {
    /// Successful result carrying `stdout`
    pub fn ok(source: TransportKind, stdout: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
            success: true,
            duration_ms,
            source,
            status: ExecutionStatus::Success,
        }
    }

    /// Failed result with an explanatory message in stderr
    pub fn failure(
        source: TransportKind,
        status: ExecutionStatus,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            exit_code: -1,
            success: false,
            duration_ms,
            source,
            status,
        }
    }

    /// Main output: stdout when present, stderr otherwise
    pub fn output(&self) -> &str {
        let stdout = self.stdout.trim();
        if stdout.is_empty() {
            self.stderr.trim()
        } else {
            stdout
        }
    }

    pub fn timed_out(&self) -> bool {
        self.status == ExecutionStatus::Timeout
    }
}

/// A live connection to one remote machine
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Target hostname
    fn host(&self) -> &str;

    /// "user@host:port" style label for displays
    fn host_display(&self) -> String;

    fn is_connected(&self) -> bool;

    async fn run_command(&self, cmd: &[String], timeout: Duration) -> CommandResult;

    /// Read at most `max_bytes` of a remote file into stdout
    async fn read_file(&self, path: &str, max_bytes: usize, timeout: Duration) -> CommandResult;

    /// Case-insensitive search, "<line>: <text>" per match in stdout
    async fn search_file(
        &self,
        path: &str,
        pattern: &str,
        max_results: usize,
        timeout: Duration,
    ) -> CommandResult;

    async fn disconnect(&mut self);
}

/// Caps applied to every command and file operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerLimits {
    pub default_timeout: Duration,
    pub max_read_lines: usize,
    pub max_read_bytes: usize,
    pub max_search_results: usize,
}

impl Default for RunnerLimits {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_read_lines: 200,
            max_read_bytes: 1_048_576,
            max_search_results: 50,
        }
    }
}

impl From<&TransportSettings> for RunnerLimits {
    fn from(settings: &TransportSettings) -> Self {
        Self {
            default_timeout: Duration::from_secs(settings.default_timeout_secs.max(1)),
            max_read_lines: settings.max_read_lines,
            max_read_bytes: settings.max_read_bytes,
            max_search_results: settings.max_search_results,
        }
    }
}

/// Routes commands to the active transport
pub struct CommandRunner {
    remote: Option<Box<dyn RemoteTransport>>,
    limits: RunnerLimits,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner {
    /// Local runner with default limits
    pub fn new() -> Self {
        Self::with_limits(RunnerLimits::default())
    }

    pub fn with_limits(limits: RunnerLimits) -> Self {
        Self {
            remote: None,
            limits,
        }
    }

    pub fn limits(&self) -> RunnerLimits {
        self.limits
    }

    /// Active transport
    pub fn mode(&self) -> TransportKind {
        self.remote
            .as_ref()
            .map(|r| r.kind())
            .unwrap_or(TransportKind::Local)
    }

    /// True when a remote transport is attached and connected
    pub fn is_remote(&self) -> bool {
        self.remote.as_ref().map(|r| r.is_connected()).unwrap_or(false)
    }

    /// Hostname of the attached remote target
    pub fn remote_host(&self) -> Option<&str> {
        self.remote.as_ref().map(|r| r.host())
    }

    pub fn host_display(&self) -> String {
        match &self.remote {
            Some(remote) => format!("{} ({})", remote.host_display(), remote.kind()),
            None => "localhost (local)".to_string(),
        }
    }

    /// Make `transport` the single active target.
    ///
    /// Any previously attached connection is disconnected first.
    pub async fn attach(&mut self, transport: Box<dyn RemoteTransport>) {
        self.disconnect().await;
        info!("Remote target attached: {} via {}", transport.host_display(), transport.kind());
        self.remote = Some(transport);
    }

    /// Connect to an SSH target, replacing any active connection.
    ///
    /// On failure the runner is left in local mode.
    pub async fn connect_ssh(&mut self, config: SshConfig) -> Result<()> {
        self.disconnect().await;
        let connection = SshConnection::connect(config).await?;
        self.attach(Box::new(connection)).await;
        Ok(())
    }

    /// Connect to a WinRM target, replacing any active connection
    pub async fn connect_winrm(&mut self, config: WinrmConfig) -> Result<()> {
        self.disconnect().await;
        let connection = WinrmConnection::connect(config).await?;
        self.attach(Box::new(connection)).await;
        Ok(())
    }

    /// Drop the remote target and fall back to local execution
    pub async fn disconnect(&mut self) {
        if let Some(mut remote) = self.remote.take() {
            info!("Disconnecting from {}", remote.host_display());
            remote.disconnect().await;
        }
    }

    /// Run a command on the active transport with the default timeout
    pub async fn run<S: AsRef<str>>(&self, cmd: &[S]) -> CommandResult {
        self.run_with_timeout(cmd, self.limits.default_timeout).await
    }

    pub async fn run_with_timeout<S: AsRef<str>>(
        &self,
        cmd: &[S],
        timeout: Duration,
    ) -> CommandResult {
        let argv: Vec<String> = cmd.iter().map(|s| s.as_ref().to_string()).collect();
        let result = match &self.remote {
            Some(remote) => remote.run_command(&argv, timeout).await,
            None => local::run_local(&argv, timeout).await,
        };

        if !result.success {
            warn!(
                "Command {:?} failed on {} ({}): {}",
                argv.first(),
                result.source,
                result.status.as_str(),
                truncate_for_log(result.output())
            );
        }
        result
    }

    /// Read a file on the active target, capped to the configured lines/bytes
    pub async fn read_file(&self, path: &str) -> CommandResult {
        let limits = self.limits;
        let mut result = match &self.remote {
            Some(remote) => {
                remote
                    .read_file(path, limits.max_read_bytes, limits.default_timeout)
                    .await
            }
            None => local::read_file_local(path, limits.max_read_bytes).await,
        };

        if result.success {
            result.stdout = truncate_lines(&result.stdout, limits.max_read_lines);
        }
        result
    }

    /// Case-insensitive pattern search in a file on the active target
    pub async fn search_file(&self, path: &str, pattern: &str) -> CommandResult {
        let limits = self.limits;
        match &self.remote {
            Some(remote) => {
                remote
                    .search_file(path, pattern, limits.max_search_results, limits.default_timeout)
                    .await
            }
            None => local::search_file_local(path, pattern, limits.max_search_results).await,
        }
    }
}

/// Keep the first `max_lines` lines
pub fn truncate_lines(text: &str, max_lines: usize) -> String {
    text.lines().take(max_lines).collect::<Vec<_>>().join("\n")
}

fn truncate_for_log(text: &str) -> String {
    const LIMIT: usize = 200;
    if text.len() <= LIMIT {
        return text.to_string();
    }
    let mut end = LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
