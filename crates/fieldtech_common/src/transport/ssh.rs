//! SSH transport - remote maintenance of macOS/Linux machines
//!
//! Built on `ssh2` (libssh2). The library is blocking, so every network call
//! runs on tokio's blocking pool. Commands are shell-quoted into one string
//! and executed by the remote login shell.

use async_trait::async_trait;
use ssh2::{CheckResult, ErrorCode, KnownHostFileKind, Session};
use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::{CommandResult, ExecutionStatus, RemoteTransport, TransportKind};
use crate::error::{FieldtechError, Result};

/// libssh2 LIBSSH2_ERROR_TIMEOUT
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// SSH connection parameters
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Private key file (preferred over password)
    pub key_path: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub password: Option<String>,
    /// known_hosts file; defaults to ~/.ssh/known_hosts
    pub known_hosts: Option<PathBuf>,
    /// Refuse hosts missing from known_hosts (mismatches are always refused)
    pub strict_host_keys: bool,
    pub connect_timeout: Duration,
}

impl SshConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            key_path: None,
            passphrase: None,
            password: None,
            known_hosts: None,
            strict_host_keys: true,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Parse "user@host", "user@host:port" or "host" (user defaults to root)
    pub fn from_target(target: &str) -> Option<Self> {
        let (username, rest) = match target.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (user, rest),
            Some(_) => return None,
            None => ("root", target),
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().ok()?),
            None => (rest, 22),
        };

        if host.is_empty() {
            return None;
        }

        let mut config = Self::new(host, username);
        config.port = port;
        Some(config)
    }

    pub fn host_display(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// One authenticated SSH session
pub struct SshConnection {
    config: SshConfig,
    session: Option<Session>,
}

impl SshConnection {
    /// Open, verify and authenticate a session
    pub async fn connect(config: SshConfig) -> Result<Self> {
        let blocking_config = config.clone();
        let session = tokio::task::spawn_blocking(move || connect_session(&blocking_config))
            .await
            .map_err(|e| FieldtechError::Ssh(format!("connect task failed: {}", e)))??;

        info!("SSH connected to {}", config.host_display());
        Ok(Self {
            config,
            session: Some(session),
        })
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    fn not_connected(&self) -> CommandResult {
        CommandResult::failure(
            TransportKind::Ssh,
            ExecutionStatus::NotConnected,
            "no active SSH connection",
            0,
        )
    }
}

#[async_trait]
impl RemoteTransport for SshConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    fn host(&self) -> &str {
        &self.config.host
    }

    fn host_display(&self) -> String {
        self.config.host_display()
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn run_command(&self, cmd: &[String], timeout: Duration) -> CommandResult {
        let Some(session) = self.session.clone() else {
            return self.not_connected();
        };

        let command = quote_command(cmd);
        let start = Instant::now();
        match tokio::task::spawn_blocking(move || exec_blocking(&session, &command, timeout)).await
        {
            Ok(result) => result,
            Err(e) => CommandResult::failure(
                TransportKind::Ssh,
                ExecutionStatus::TransportError,
                format!("SSH task failed: {}", e),
                start.elapsed().as_millis() as u64,
            ),
        }
    }

    async fn read_file(&self, path: &str, max_bytes: usize, timeout: Duration) -> CommandResult {
        let Some(session) = self.session.clone() else {
            return self.not_connected();
        };

        let path = path.to_string();
        let start = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || {
            session.set_timeout(timeout_millis(timeout));
            let result = sftp_read(&session, &path, max_bytes);
            session.set_timeout(0);
            result
        })
        .await;

        let elapsed = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok(content)) => CommandResult::ok(TransportKind::Ssh, content, elapsed),
            Ok(Err(e)) => {
                let mut result = CommandResult::failure(
                    TransportKind::Ssh,
                    io_status(&e),
                    format!("SFTP read failed: {}", e),
                    elapsed,
                );
                result.exit_code = 1;
                result
            }
            Err(e) => CommandResult::failure(
                TransportKind::Ssh,
                ExecutionStatus::TransportError,
                format!("SFTP task failed: {}", e),
                elapsed,
            ),
        }
    }

    async fn search_file(
        &self,
        path: &str,
        pattern: &str,
        max_results: usize,
        timeout: Duration,
    ) -> CommandResult {
        let cmd = grep_command(path, pattern, max_results);
        let mut result = self.run_command(&cmd, timeout).await;
        normalize_grep_no_match(&mut result);
        if result.success {
            result.stdout = format_grep_lines(&result.stdout);
        }
        result
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let host = self.config.host_display();
            let _ = tokio::task::spawn_blocking(move || {
                if let Err(e) = session.disconnect(None, "fieldtech session closed", None) {
                    warn!("SSH disconnect from {} failed: {}", host, e);
                }
            })
            .await;
        }
    }
}

fn connect_session(config: &SshConfig) -> Result<Session> {
    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| FieldtechError::Ssh(format!("cannot resolve {}: {}", config.host, e)))?
        .next()
        .ok_or_else(|| FieldtechError::Ssh(format!("no address for {}", config.host)))?;

    let tcp = TcpStream::connect_timeout(&addr, config.connect_timeout)
        .map_err(|e| FieldtechError::Ssh(format!("TCP connect to {} failed: {}", addr, e)))?;

    let mut session =
        Session::new().map_err(|e| FieldtechError::Ssh(format!("session init: {}", e)))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout_millis(config.connect_timeout));
    session.handshake().map_err(ssh_error)?;

    verify_host_key(&session, config)?;
    authenticate(&session, config)?;

    session.set_timeout(0);
    session.set_keepalive(true, 30);
    Ok(session)
}

fn verify_host_key(session: &Session, config: &SshConfig) -> Result<()> {
    let mut known_hosts = session.known_hosts().map_err(ssh_error)?;

    let path = config
        .known_hosts
        .clone()
        .or_else(|| dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts")));
    if let Some(path) = path.filter(|p| p.exists()) {
        known_hosts
            .read_file(&path, KnownHostFileKind::OpenSSH)
            .map_err(ssh_error)?;
    }

    let (key, _) = session
        .host_key()
        .ok_or_else(|| FieldtechError::Ssh("server sent no host key".to_string()))?;

    match known_hosts.check_port(&config.host, config.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound if !config.strict_host_keys => {
            warn!("Host key for {} not in known_hosts, accepting", config.host);
            Ok(())
        }
        CheckResult::NotFound => Err(FieldtechError::Ssh(format!(
            "host key for {} is not in known_hosts",
            config.host
        ))),
        CheckResult::Mismatch => Err(FieldtechError::Ssh(format!(
            "host key mismatch for {} - refusing to connect",
            config.host
        ))),
        CheckResult::Failure => Err(FieldtechError::Ssh(format!(
            "host key check failed for {}",
            config.host
        ))),
    }
}

fn authenticate(session: &Session, config: &SshConfig) -> Result<()> {
    if let Some(key_path) = &config.key_path {
        if !key_path.exists() {
            return Err(FieldtechError::Ssh(format!(
                "SSH key not found: {}",
                key_path.display()
            )));
        }
        session
            .userauth_pubkey_file(&config.username, None, key_path, config.passphrase.as_deref())
            .map_err(ssh_error)?;
    } else if let Some(password) = &config.password {
        session
            .userauth_password(&config.username, password)
            .map_err(ssh_error)?;
    } else {
        session.userauth_agent(&config.username).map_err(ssh_error)?;
    }

    if !session.authenticated() {
        return Err(FieldtechError::Ssh("authentication failed".to_string()));
    }
    Ok(())
}

/// Cap on captured stdout and stderr, each
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Sleep between polls when neither stream had data
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Budget for closing a channel after the command finished or timed out
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Output of a channel that ran to completion
struct ChannelOutput {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

fn exec_blocking(session: &Session, command: &str, timeout: Duration) -> CommandResult {
    let start = Instant::now();
    let result = exec_channel(session, command, start + timeout);
    session.set_blocking(true);
    session.set_timeout(0);

    let elapsed = start.elapsed().as_millis() as u64;
    let timed_out = || {
        CommandResult::failure(
            TransportKind::Ssh,
            ExecutionStatus::Timeout,
            format!("SSH command timed out after {}s", timeout.as_secs_f32()),
            elapsed,
        )
    };
    match result {
        Ok(Some(output)) => CommandResult {
            stdout: output.stdout.trim_end().to_string(),
            stderr: output.stderr.trim_end().to_string(),
            exit_code: output.exit_code,
            success: output.exit_code == 0,
            duration_ms: elapsed,
            source: TransportKind::Ssh,
            status: match output.exit_code {
                0 => ExecutionStatus::Success,
                127 => ExecutionStatus::CommandNotFound,
                126 => ExecutionStatus::PermissionDenied,
                _ => ExecutionStatus::NonZeroExit,
            },
        },
        Ok(None) => timed_out(),
        Err(e) if e.kind() == ErrorKind::TimedOut => timed_out(),
        Err(e) => CommandResult::failure(
            TransportKind::Ssh,
            ExecutionStatus::TransportError,
            format!("SSH error: {}", e),
            elapsed,
        ),
    }
}

/// Run one command on a fresh channel, `None` when `deadline` passed first.
/// The channel is closed on every path.
fn exec_channel(
    session: &Session,
    command: &str,
    deadline: Instant,
) -> std::io::Result<Option<ChannelOutput>> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    session.set_timeout(timeout_millis(remaining).max(1));
    let mut channel = session.channel_session().map_err(std::io::Error::from)?;
    channel.exec(command).map_err(std::io::Error::from)?;

    session.set_blocking(false);
    let mut stdout = channel.stream(0);
    let mut stderr = channel.stderr();
    let drained = drain_streams(&mut stdout, &mut stderr, || channel.eof(), deadline);
    session.set_blocking(true);
    session.set_timeout(timeout_millis(CLOSE_GRACE));

    let drained = match drained {
        Ok(drained) if !drained.timed_out => drained,
        Ok(_) => {
            let _ = channel.close();
            return Ok(None);
        }
        Err(e) => {
            let _ = channel.close();
            return Err(e);
        }
    };

    channel.wait_close().map_err(std::io::Error::from)?;
    let exit_code = channel.exit_status().map_err(std::io::Error::from)?;
    Ok(Some(ChannelOutput {
        stdout: String::from_utf8_lossy(&drained.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&drained.stderr).into_owned(),
        exit_code,
    }))
}

/// Bytes collected from both streams of one channel
#[derive(Debug, Default)]
struct Drained {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    timed_out: bool,
}

/// Read `stdout` and `stderr` alternately until `at_eof` or `deadline`.
///
/// Both readers are non-blocking: `WouldBlock` means no data yet. Output
/// beyond [`MAX_OUTPUT_BYTES`] is read and dropped so the remote side never
/// stalls on a full window.
fn drain_streams(
    stdout: &mut impl Read,
    stderr: &mut impl Read,
    mut at_eof: impl FnMut() -> bool,
    deadline: Instant,
) -> std::io::Result<Drained> {
    let mut drained = Drained::default();
    let mut buf = [0u8; 8192];
    loop {
        let out = read_available(stdout, &mut buf, &mut drained.stdout)?;
        let err = read_available(stderr, &mut buf, &mut drained.stderr)?;
        let progressed = out || err;

        if at_eof() && !progressed {
            return Ok(drained);
        }
        if Instant::now() >= deadline {
            drained.timed_out = true;
            return Ok(drained);
        }
        if !progressed {
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

fn read_available(
    reader: &mut impl Read,
    buf: &mut [u8],
    out: &mut Vec<u8>,
) -> std::io::Result<bool> {
    match reader.read(buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            let room = MAX_OUTPUT_BYTES.saturating_sub(out.len());
            out.extend_from_slice(&buf[..n.min(room)]);
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

fn sftp_read(session: &Session, path: &str, max_bytes: usize) -> std::io::Result<String> {
    let sftp = session.sftp().map_err(std::io::Error::from)?;
    let mut file = sftp.open(Path::new(path)).map_err(std::io::Error::from)?;
    let mut buf = Vec::new();
    Read::by_ref(&mut file)
        .take(max_bytes as u64)
        .read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// `grep -n -i -m N -- PATTERN PATH`, output "<line>:<text>"
pub fn grep_command(path: &str, pattern: &str, max_results: usize) -> Vec<String> {
    vec![
        "grep".to_string(),
        "-n".to_string(),
        "-i".to_string(),
        "-m".to_string(),
        max_results.to_string(),
        "--".to_string(),
        pattern.to_string(),
        path.to_string(),
    ]
}

/// grep exits 1 with no stderr when nothing matched
fn normalize_grep_no_match(result: &mut CommandResult) {
    if result.exit_code == 1 && result.stderr.is_empty() {
        result.success = true;
        result.status = ExecutionStatus::Success;
    }
}

/// "12:text" -> "12: text"
pub(crate) fn format_grep_lines(output: &str) -> String {
    output
        .lines()
        .map(|line| match line.split_once(':') {
            Some((n, text)) if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => {
                format!("{}: {}", n, text)
            }
            _ => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Quote an argv list into one POSIX shell command string
pub fn quote_command(cmd: &[String]) -> String {
    cmd.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote one argument for a POSIX shell
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\"'\"'"))
    }
}

fn timeout_millis(timeout: Duration) -> u32 {
    timeout.as_millis().min(u32::MAX as u128) as u32
}

fn io_status(e: &std::io::Error) -> ExecutionStatus {
    match e.kind() {
        ErrorKind::TimedOut => ExecutionStatus::Timeout,
        ErrorKind::PermissionDenied => ExecutionStatus::PermissionDenied,
        _ => ExecutionStatus::TransportError,
    }
}

fn ssh_error(err: ssh2::Error) -> FieldtechError {
    if err.code() == ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) {
        FieldtechError::Ssh(format!("timed out: {}", err.message()))
    } else {
        FieldtechError::Ssh(err.message().to_string())
    }
}
