//! System snapshots taken before and after repairs

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::changelog::SystemSnapshot;
use crate::transport::{CommandRunner, TransportKind};

/// Windows probes as PowerShell scripts
const WINDOWS_PROBES: &[(&str, &str)] = &[
    ("disk_c", "Get-PSDrive C | Format-List Used,Free"),
    ("last_boot", "(Get-CimInstance Win32_OperatingSystem).LastBootUpTime"),
];

/// Captures named system values on the active target
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn capture(&self, runner: &CommandRunner) -> anyhow::Result<SystemSnapshot>;
}

/// Runs one command per value and records its trimmed stdout.
///
/// A probe that fails is recorded as `"<unavailable: status>"` so one broken
/// probe does not lose the others.
#[derive(Debug, Clone, Default)]
pub struct CommandSnapshotProvider {
    probes: Vec<(String, Vec<String>)>,
}

impl CommandSnapshotProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(mut self, key: impl Into<String>, argv: &[&str]) -> Self {
        self.probes
            .push((key.into(), argv.iter().map(|s| s.to_string()).collect()));
        self
    }

    /// Disk usage of `/` and the uptime line on Unix-like targets
    pub fn unix_defaults() -> Self {
        Self::new()
            .probe("disk_root", &["df", "-h", "/"])
            .probe("uptime", &["uptime"])
    }

    /// Free space on `C:` and the last boot time.
    ///
    /// Over WinRM the script words are sent as-is; a local Windows runner
    /// spawns programs directly, so there each script goes through
    /// `powershell -Command`.
    pub fn windows_defaults(local: bool) -> Self {
        WINDOWS_PROBES
            .iter()
            .fold(Self::new(), |provider, (key, script)| {
                if local {
                    provider.probe(*key, &["powershell", "-NoProfile", "-Command", *script])
                } else {
                    let words: Vec<&str> = script.split_whitespace().collect();
                    provider.probe(*key, &words)
                }
            })
    }
}

/// Chooses the probe set by the runner's active transport at capture time
#[derive(Debug, Clone)]
pub struct TargetSnapshotProvider {
    unix: CommandSnapshotProvider,
    windows_remote: CommandSnapshotProvider,
    windows_local: CommandSnapshotProvider,
}

impl Default for TargetSnapshotProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetSnapshotProvider {
    pub fn new() -> Self {
        Self {
            unix: CommandSnapshotProvider::unix_defaults(),
            windows_remote: CommandSnapshotProvider::windows_defaults(false),
            windows_local: CommandSnapshotProvider::windows_defaults(true),
        }
    }

    pub fn probes_for(&self, mode: TransportKind) -> &CommandSnapshotProvider {
        match mode {
            TransportKind::Winrm => &self.windows_remote,
            TransportKind::Ssh => &self.unix,
            TransportKind::Local if cfg!(target_os = "windows") => &self.windows_local,
            TransportKind::Local => &self.unix,
        }
    }
}

#[async_trait]
impl SnapshotProvider for TargetSnapshotProvider {
    async fn capture(&self, runner: &CommandRunner) -> anyhow::Result<SystemSnapshot> {
        self.probes_for(runner.mode()).capture(runner).await
    }
}

#[async_trait]
impl SnapshotProvider for CommandSnapshotProvider {
    async fn capture(&self, runner: &CommandRunner) -> anyhow::Result<SystemSnapshot> {
        let mut values = BTreeMap::new();
        for (key, argv) in &self.probes {
            let result = runner.run(argv.as_slice()).await;
            let value = if result.success {
                result.stdout.trim().to_string()
            } else {
                format!("<unavailable: {}>", result.status.as_str())
            };
            values.insert(key.clone(), value);
        }
        Ok(SystemSnapshot::new(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CommandResult, RemoteTransport};
    use std::time::Duration;

    /// Answers every command with the command line it received
    struct Echo(TransportKind);

    #[async_trait]
    impl RemoteTransport for Echo {
        fn kind(&self) -> TransportKind {
            self.0
        }

        fn host(&self) -> &str {
            "target-1"
        }

        fn host_display(&self) -> String {
            "target-1".to_string()
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn run_command(&self, cmd: &[String], _timeout: Duration) -> CommandResult {
            CommandResult::ok(self.0, cmd.join(" "), 1)
        }

        async fn read_file(&self, _path: &str, _max: usize, _timeout: Duration) -> CommandResult {
            CommandResult::ok(self.0, "", 1)
        }

        async fn search_file(
            &self,
            _path: &str,
            _pattern: &str,
            _max_results: usize,
            _timeout: Duration,
        ) -> CommandResult {
            CommandResult::ok(self.0, "", 1)
        }

        async fn disconnect(&mut self) {}
    }

    #[tokio::test]
    async fn test_winrm_target_gets_windows_probes() {
        let mut runner = CommandRunner::new();
        runner.attach(Box::new(Echo(TransportKind::Winrm))).await;

        let snapshot = TargetSnapshotProvider::new().capture(&runner).await.unwrap();
        assert_eq!(snapshot.values["disk_c"], "Get-PSDrive C | Format-List Used,Free");
        assert!(!snapshot.values.contains_key("disk_root"));
    }

    #[tokio::test]
    async fn test_probe_set_follows_target_switch() {
        let provider = TargetSnapshotProvider::new();
        let mut runner = CommandRunner::new();

        runner.attach(Box::new(Echo(TransportKind::Ssh))).await;
        let snapshot = provider.capture(&runner).await.unwrap();
        assert_eq!(snapshot.values["disk_root"], "df -h /");
        assert_eq!(snapshot.values["uptime"], "uptime");

        runner.attach(Box::new(Echo(TransportKind::Winrm))).await;
        let snapshot = provider.capture(&runner).await.unwrap();
        assert!(snapshot.values.contains_key("last_boot"));
        assert!(!snapshot.values.contains_key("uptime"));
    }

    #[test]
    fn test_local_windows_probes_go_through_powershell() {
        let provider = CommandSnapshotProvider::windows_defaults(true);
        let (key, argv) = &provider.probes[0];
        assert_eq!(key, "disk_c");
        assert_eq!(argv[..3], ["powershell", "-NoProfile", "-Command"]);
        assert_eq!(argv[3], "Get-PSDrive C | Format-List Used,Free");
    }

    #[tokio::test]
    async fn test_probes_are_recorded() {
        let provider = CommandSnapshotProvider::new()
            .probe("greeting", &["echo", "hi"])
            .probe("broken", &["fieldtech-no-such-probe"]);

        let snapshot = provider.capture(&CommandRunner::new()).await.unwrap();
        assert_eq!(snapshot.values["greeting"], "hi");
        assert_eq!(snapshot.values["broken"], "<unavailable: command not found>");
    }
}
