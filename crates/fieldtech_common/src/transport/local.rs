//! Local transport - child processes and file access on this machine
//!
//! Executes the argv exactly as given (no shell), captures real exit code,
//! stdout, stderr and duration, and returns them WITHOUT interpretation.
//! A command that outlives its timeout is killed.

use regex::RegexBuilder;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use super::{CommandResult, ExecutionStatus, TransportKind};

/// Maximum output length to capture per stream
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Run an argv list locally
pub async fn run_local(cmd: &[String], timeout: Duration) -> CommandResult {
    let Some((program, args)) = cmd.split_first() else {
        return CommandResult::failure(
            TransportKind::Local,
            ExecutionStatus::OsError,
            "empty command",
            0,
        );
    };

    let mut command = Command::new(program);
    command.args(args);
    capture(command, program, timeout, TransportKind::Local).await
}

/// Spawn a prepared command, wait for it within `timeout`, capture output.
///
/// The child is killed when the timeout fires or the calling task is dropped.
pub(crate) async fn capture(
    mut command: Command,
    program: &str,
    timeout: Duration,
    source: TransportKind,
) -> CommandResult {
    let start = Instant::now();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let elapsed = elapsed_ms(start);
            return match e.kind() {
                ErrorKind::NotFound => CommandResult::failure(
                    source,
                    ExecutionStatus::CommandNotFound,
                    format!("command not found: {}", program),
                    elapsed,
                ),
                ErrorKind::PermissionDenied => CommandResult::failure(
                    source,
                    ExecutionStatus::PermissionDenied,
                    format!("permission denied: {}", program),
                    elapsed,
                ),
                _ => CommandResult::failure(
                    source,
                    ExecutionStatus::OsError,
                    format!("OS error: {}", e),
                    elapsed,
                ),
            };
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let exit_code = output.status.code().unwrap_or(-1);
            let success = output.status.success();
            CommandResult {
                stdout: truncate_output(&output.stdout).trim_end().to_string(),
                stderr: truncate_output(&output.stderr).trim_end().to_string(),
                exit_code,
                success,
                duration_ms: elapsed_ms(start),
                source,
                status: if success {
                    ExecutionStatus::Success
                } else {
                    ExecutionStatus::NonZeroExit
                },
            }
        }
        Ok(Err(e)) => CommandResult::failure(
            source,
            ExecutionStatus::OsError,
            format!("OS error: {}", e),
            elapsed_ms(start),
        ),
        Err(_) => CommandResult::failure(
            source,
            ExecutionStatus::Timeout,
            format!("timed out after {}s", timeout.as_secs_f32()),
            elapsed_ms(start),
        ),
    }
}

/// Read up to `max_bytes` of a local file
pub async fn read_file_local(path: &str, max_bytes: usize) -> CommandResult {
    let start = Instant::now();

    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) => return io_failure(path, e, start),
    };

    let mut buf = Vec::new();
    if let Err(e) = file.take(max_bytes as u64).read_to_end(&mut buf).await {
        return io_failure(path, e, start);
    }

    CommandResult::ok(
        TransportKind::Local,
        String::from_utf8_lossy(&buf).into_owned(),
        elapsed_ms(start),
    )
}

/// Case-insensitive regex search in a local file.
///
/// No match is a successful, empty result.
pub async fn search_file_local(path: &str, pattern: &str, max_results: usize) -> CommandResult {
    let start = Instant::now();

    let regex = match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(regex) => regex,
        Err(e) => {
            return CommandResult::failure(
                TransportKind::Local,
                ExecutionStatus::OsError,
                format!("invalid pattern '{}': {}", pattern, e),
                elapsed_ms(start),
            )
        }
    };

    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) => return io_failure(path, e, start),
    };

    let mut reader = BufReader::new(file);
    let mut matches = Vec::new();
    let mut buf = Vec::new();
    let mut line_number = 0usize;

    while matches.len() < max_results {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                line_number += 1;
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if regex.is_match(line) {
                    matches.push(format!("{}: {}", line_number, line));
                }
            }
            Err(e) => return io_failure(path, e, start),
        }
    }

    CommandResult::ok(TransportKind::Local, matches.join("\n"), elapsed_ms(start))
}

fn io_failure(path: &str, e: std::io::Error, start: Instant) -> CommandResult {
    let status = match e.kind() {
        ErrorKind::PermissionDenied => ExecutionStatus::PermissionDenied,
        _ => ExecutionStatus::OsError,
    };
    let mut result = CommandResult::failure(
        TransportKind::Local,
        status,
        format!("{}: {}", path, e),
        elapsed_ms(start),
    );
    result.exit_code = 1;
    result
}

/// Truncate output to max bytes, converting to string
fn truncate_output(bytes: &[u8]) -> String {
    let slice = if bytes.len() > MAX_OUTPUT_BYTES {
        &bytes[..MAX_OUTPUT_BYTES]
    } else {
        bytes
    };
    String::from_utf8_lossy(slice).into_owned()
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_echo_runs_locally() {
        let result = run_local(&argv(&["echo", "fieldtech-ok"]), Duration::from_secs(10)).await;
        assert!(result.success);
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout, "fieldtech-ok");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.source, TransportKind::Local);
    }

    #[tokio::test]
    async fn test_missing_binary_is_distinct_from_nonzero_exit() {
        let missing = run_local(
            &argv(&["fieldtech-definitely-not-a-binary"]),
            Duration::from_secs(5),
        )
        .await;
        assert!(!missing.success);
        assert_eq!(missing.status, ExecutionStatus::CommandNotFound);
        assert!(missing.stderr.contains("command not found"));

        let nonzero = run_local(&argv(&["sh", "-c", "exit 3"]), Duration::from_secs(5)).await;
        assert!(!nonzero.success);
        assert_eq!(nonzero.status, ExecutionStatus::NonZeroExit);
        assert_eq!(nonzero.exit_code, 3);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let result = run_local(&argv(&["sleep", "5"]), Duration::from_millis(200)).await;
        assert!(!result.success);
        assert!(result.timed_out());
        assert!(result.duration_ms < 5000);
    }

    #[tokio::test]
    async fn test_empty_command() {
        let result = run_local(&[], Duration::from_secs(1)).await;
        assert!(!result.success);
        assert_eq!(result.status, ExecutionStatus::OsError);
    }

    #[tokio::test]
    async fn test_read_file_respects_byte_cap() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "0123456789").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let result = read_file_local(&path, 4).await;
        assert!(result.success);
        assert_eq!(result.stdout, "0123");
    }

    #[tokio::test]
    async fn test_read_missing_file_fails() {
        let result = read_file_local("/nonexistent/fieldtech/file", 100).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("/nonexistent/fieldtech/file"));
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive_and_capped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ERROR one").unwrap();
        writeln!(file, "fine").unwrap();
        writeln!(file, "error two").unwrap();
        writeln!(file, "Error three").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let result = search_file_local(&path, "error", 2).await;
        assert!(result.success);
        assert_eq!(result.stdout, "1: ERROR one\n3: error two");
    }

    #[tokio::test]
    async fn test_search_invalid_pattern() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let result = search_file_local(&path, "(unclosed", 5).await;
        assert!(!result.success);
        assert!(result.stderr.contains("invalid pattern"));
    }
}
