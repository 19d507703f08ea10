//! WinRM transport - PowerShell remoting for Windows targets
//!
//! Remote scripts are run through a local PowerShell (`pwsh` by default) with
//! `Invoke-Command`. The password and the remote script travel in the child's
//! environment, never on its command line.
//!
//! Classic cmd.exe programs ("net stop wuauserv", "ipconfig /all") are wrapped
//! in `cmd /c '...'`; anything that already looks like PowerShell is sent as is.

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::info;

use super::local::capture;
use super::{CommandResult, ExecutionStatus, RemoteTransport, TransportKind};
use crate::error::{FieldtechError, Result};

const PASSWORD_ENV: &str = "FIELDTECH_WINRM_PASSWORD";
const SCRIPT_ENV: &str = "FIELDTECH_WINRM_SCRIPT";

/// Approved PowerShell verbs in Verb-Noun cmdlet names
static CMDLET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(Get|Set|New|Remove|Invoke|Start|Stop|Restart|Enable|Disable|Test|Select|Where|ForEach|Write|Import|Export|Clear|Add|Out|Format|Measure|Sort|Repair|Reset|Resolve|Update)-[A-Za-z]",
    )
    .expect("valid cmdlet regex")
});

/// Programs that belong to cmd.exe rather than PowerShell
const CMD_PROGRAMS: &[&str] = &[
    "net", "sc", "reg", "wmic", "ipconfig", "ping", "tracert", "nslookup", "netsh", "sfc",
    "dism", "chkdsk", "defrag", "schtasks", "tasklist", "taskkill", "regsvr32", "bcdedit",
    "diskpart", "robocopy", "attrib", "icacls", "certutil", "systeminfo", "hostname", "whoami",
    "gpupdate", "gpresult", "shutdown",
];

/// WinRM connection parameters
#[derive(Debug, Clone)]
pub struct WinrmConfig {
    pub host: String,
    /// 5985 (HTTP) or 5986 (HTTPS)
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_ssl: bool,
    pub skip_cert_check: bool,
    /// Local PowerShell executable that drives the remoting session
    pub powershell: String,
    pub connect_timeout: Duration,
}

impl WinrmConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 5985,
            username: "Administrator".to_string(),
            password: String::new(),
            use_ssl: false,
            skip_cert_check: false,
            powershell: "pwsh".to_string(),
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn host_display(&self) -> String {
        let proto = if self.use_ssl { "https" } else { "http" };
        format!("{}@{}:{} ({})", self.username, self.host, self.port, proto)
    }
}

/// A verified PowerShell remoting target
pub struct WinrmConnection {
    config: WinrmConfig,
    connected: bool,
}

impl WinrmConnection {
    /// Verify the target answers before accepting it
    pub async fn connect(config: WinrmConfig) -> Result<Self> {
        let mut connection = Self {
            config,
            connected: false,
        };

        let probe = connection
            .invoke("$env:COMPUTERNAME", connection.config.connect_timeout)
            .await;
        if !probe.success {
            return Err(FieldtechError::Winrm(format!(
                "connection test to {} failed: {}",
                connection.config.host,
                probe.output()
            )));
        }

        info!(
            "WinRM connected to {} (computer name {})",
            connection.config.host_display(),
            probe.stdout.trim()
        );
        connection.connected = true;
        Ok(connection)
    }

    /// Run a PowerShell script on the target
    async fn invoke(&self, script: &str, timeout: Duration) -> CommandResult {
        let wrapper = invoke_wrapper(&self.config);

        let mut command = Command::new(&self.config.powershell);
        command
            .args(["-NoProfile", "-NonInteractive", "-Command", wrapper.as_str()])
            .env(PASSWORD_ENV, &self.config.password)
            .env(SCRIPT_ENV, script);

        let mut result =
            capture(command, &self.config.powershell, timeout, TransportKind::Winrm).await;
        if result.status == ExecutionStatus::CommandNotFound {
            result.stderr = format!(
                "PowerShell '{}' not found; WinRM needs a local PowerShell",
                self.config.powershell
            );
            result.status = ExecutionStatus::TransportError;
        }
        result
    }

    fn not_connected(&self) -> CommandResult {
        CommandResult::failure(
            TransportKind::Winrm,
            ExecutionStatus::NotConnected,
            "no active WinRM connection",
            0,
        )
    }
}

#[async_trait]
impl RemoteTransport for WinrmConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Winrm
    }

    fn host(&self) -> &str {
        &self.config.host
    }

    fn host_display(&self) -> String {
        self.config.host_display()
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn run_command(&self, cmd: &[String], timeout: Duration) -> CommandResult {
        if !self.connected {
            return self.not_connected();
        }
        let script = to_powershell(&join_command(cmd));
        self.invoke(&script, timeout).await
    }

    async fn read_file(&self, path: &str, max_bytes: usize, timeout: Duration) -> CommandResult {
        if !self.connected {
            return self.not_connected();
        }
        self.invoke(&read_file_script(path, max_bytes), timeout).await
    }

    async fn search_file(
        &self,
        path: &str,
        pattern: &str,
        max_results: usize,
        timeout: Duration,
    ) -> CommandResult {
        if !self.connected {
            return self.not_connected();
        }
        self.invoke(&search_script(path, pattern, max_results), timeout)
            .await
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }
}

/// Translate a command line into a PowerShell script.
///
/// PowerShell-looking input (cmdlets, pipes, variables) is returned trimmed but
/// otherwise unchanged. Known cmd.exe programs become `cmd /c '<escaped>'`.
/// Everything else is assumed to be PowerShell.
pub fn to_powershell(cmd: &str) -> String {
    let cmd = cmd.trim();

    if cmd.contains('$') || cmd.contains('|') || CMDLET.is_match(cmd) {
        return cmd.to_string();
    }

    let program = cmd
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    let program = program.strip_suffix(".exe").unwrap_or(&program);

    if CMD_PROGRAMS.contains(&program) {
        return format!("cmd /c {}", ps_quote(cmd));
    }

    cmd.to_string()
}

/// Single-quoted PowerShell string literal
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Script that reads a file, refusing files larger than `max_bytes`
pub fn read_file_script(path: &str, max_bytes: usize) -> String {
    format!(
        "$f = {path}\n\
         if (Test-Path -LiteralPath $f -PathType Leaf) {{\n\
         \x20   $size = (Get-Item -LiteralPath $f).Length\n\
         \x20   if ($size -gt {max}) {{\n\
         \x20       Write-Error \"file too large: $size bytes (max {max})\"; exit 1\n\
         \x20   }}\n\
         \x20   Get-Content -LiteralPath $f -Raw -Encoding UTF8\n\
         }} else {{\n\
         \x20   Write-Error \"file not found: $f\"; exit 1\n\
         }}",
        path = ps_quote(path),
        max = max_bytes,
    )
}

/// Script that prints "<line>: <text>" for up to `max_results` matches
pub fn search_script(path: &str, pattern: &str, max_results: usize) -> String {
    format!(
        "$f = {path}\n\
         if (-not (Test-Path -LiteralPath $f -PathType Leaf)) {{ Write-Error \"file not found: $f\"; exit 1 }}\n\
         Select-String -LiteralPath $f -Pattern {pattern} | Select-Object -First {max} | \
         ForEach-Object {{ \"$($_.LineNumber): $($_.Line)\" }}",
        path = ps_quote(path),
        pattern = ps_quote(pattern),
        max = max_results,
    )
}

/// Local script that opens the remoting session and runs `$env:FIELDTECH_WINRM_SCRIPT`
pub fn invoke_wrapper(config: &WinrmConfig) -> String {
    let mut invoke = format!(
        "Invoke-Command -ComputerName {} -Port {} -Credential $cred",
        ps_quote(&config.host),
        config.port
    );
    if config.use_ssl {
        invoke.push_str(" -UseSSL");
    }
    if config.skip_cert_check {
        invoke.push_str(" -SessionOption (New-PSSessionOption -SkipCACheck -SkipCNCheck)");
    }
    invoke.push_str(&format!(
        " -ScriptBlock ([ScriptBlock]::Create($env:{}))",
        SCRIPT_ENV
    ));

    format!(
        "$ErrorActionPreference = 'Stop'\n\
         $secure = ConvertTo-SecureString $env:{password} -AsPlainText -Force\n\
         $cred = New-Object System.Management.Automation.PSCredential({user}, $secure)\n\
         try {{ {invoke} }} catch {{ [Console]::Error.WriteLine($_.ToString()); exit 1 }}",
        password = PASSWORD_ENV,
        user = ps_quote(&config.username),
        invoke = invoke,
    )
}

/// Rejoin argv for PowerShell, double-quoting arguments with whitespace
fn join_command(cmd: &[String]) -> String {
    cmd.iter()
        .map(|arg| {
            if arg.chars().any(char::is_whitespace) && !arg.starts_with('"') {
                format!("\"{}\"", arg)
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_programs_are_wrapped() {
        assert_eq!(to_powershell("net stop wuauserv"), "cmd /c 'net stop wuauserv'");
        assert_eq!(to_powershell("  ipconfig /all "), "cmd /c 'ipconfig /all'");
        assert_eq!(to_powershell("SFC /scannow"), "cmd /c 'SFC /scannow'");
        assert_eq!(to_powershell("whoami.exe"), "cmd /c 'whoami.exe'");
    }

    #[test]
    fn test_quotes_are_escaped_for_cmd_wrapping() {
        assert_eq!(
            to_powershell("reg query 'HKLM\\Software'"),
            "cmd /c 'reg query ''HKLM\\Software'''"
        );
    }

    #[test]
    fn test_powershell_passes_through() {
        assert_eq!(to_powershell("Get-Service wuauserv"), "Get-Service wuauserv");
        assert_eq!(to_powershell("$env:COMPUTERNAME"), "$env:COMPUTERNAME");
        assert_eq!(
            to_powershell("Get-Process | Sort-Object CPU"),
            "Get-Process | Sort-Object CPU"
        );
        // a pipe wins even when the first word is a cmd program
        assert_eq!(to_powershell("net user | more"), "net user | more");
    }

    #[test]
    fn test_unknown_commands_fall_back_to_powershell() {
        assert_eq!(to_powershell("dir C:\\"), "dir C:\\");
        // prefix match is on whole program names only
        assert_eq!(to_powershell("netstat -an"), "netstat -an");
    }

    #[test]
    fn test_read_file_script() {
        let script = read_file_script("C:\\Users\\o'brien\\log.txt", 1024);
        assert!(script.starts_with("$f = 'C:\\Users\\o''brien\\log.txt'"));
        assert!(script.contains("-gt 1024"));
        assert!(script.contains("Get-Content -LiteralPath $f -Raw"));
        assert!(script.contains("file not found"));
    }

    #[test]
    fn test_search_script() {
        let script = search_script("C:\\Windows\\Logs\\CBS\\CBS.log", "error", 25);
        assert!(script.contains("-Pattern 'error'"));
        assert!(script.contains("Select-Object -First 25"));
        assert!(script.contains("$($_.LineNumber): $($_.Line)"));
    }

    #[test]
    fn test_invoke_wrapper_keeps_secrets_out_of_argv() {
        let mut config = WinrmConfig::new("win-pc");
        config.password = "hunter2".to_string();
        config.use_ssl = true;
        config.port = 5986;
        config.skip_cert_check = true;

        let wrapper = invoke_wrapper(&config);
        assert!(!wrapper.contains("hunter2"));
        assert!(wrapper.contains("$env:FIELDTECH_WINRM_PASSWORD"));
        assert!(wrapper.contains("-ComputerName 'win-pc' -Port 5986"));
        assert!(wrapper.contains("-UseSSL"));
        assert!(wrapper.contains("-SkipCACheck"));
        assert!(wrapper.contains("[ScriptBlock]::Create($env:FIELDTECH_WINRM_SCRIPT)"));
    }

    #[test]
    fn test_host_display() {
        let mut config = WinrmConfig::new("10.0.0.5");
        assert_eq!(config.host_display(), "Administrator@10.0.0.5:5985 (http)");
        config.use_ssl = true;
        config.port = 5986;
        assert_eq!(config.host_display(), "Administrator@10.0.0.5:5986 (https)");
    }

    #[test]
    fn test_join_command() {
        let cmd = vec!["Get-Item".to_string(), "C:\\Program Files".to_string()];
        assert_eq!(join_command(&cmd), "Get-Item \"C:\\Program Files\"");
    }

    #[tokio::test]
    async fn test_missing_powershell_fails_connect() {
        let mut config = WinrmConfig::new("win-pc");
        config.powershell = "fieldtech-no-such-pwsh".to_string();
        config.connect_timeout = Duration::from_secs(5);

        let err = WinrmConnection::connect(config).await.err().unwrap();
        assert!(err.to_string().contains("connection test"));
    }
}
