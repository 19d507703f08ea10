//! Changelog - durable audit trail of repair operations
//!
//! One JSON document per session at `<dir>/<session_id>.json`:
//!
//! ```json
//! {
//!   "session_id": "...",
//!   "created_at": "2026-03-01T10:00:00Z",
//!   "entries": [
//!     { "timestamp": "...", "tool_name": "cleanup_disk", "tool_input": {...},
//!       "result": "...", "success": true, "duration_ms": 812 }
//!   ]
//! }
//! ```
//!
//! Entries are only ever appended. Every append redacts input and result,
//! then rewrites the document atomically (temp file, fsync, rename, 0600), so
//! a crash loses at most the entry being written. Older files stay readable:
//! every entry field except `tool_name` has a default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{FieldtechError, Result};
use crate::fsutil::atomic_write_private;
use crate::redaction::{redact_for_storage, redact_json_for_storage, NoopRedactor, Redactor};

/// Named system values captured around a repair (free disk, service state, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

impl SystemSnapshot {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self {
            captured_at: Utc::now(),
            values,
        }
    }
}

/// One executed repair operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_before: Option<SystemSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_after: Option<SystemSnapshot>,
}

impl ChangelogEntry {
    pub fn new(
        tool_name: impl Into<String>,
        tool_input: &Map<String, Value>,
        result: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            tool_name: tool_name.into(),
            tool_input: Value::Object(tool_input.clone()),
            result: result.into(),
            success,
            duration_ms: 0,
            snapshot_before: None,
            snapshot_after: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_snapshots(
        mut self,
        before: Option<SystemSnapshot>,
        after: Option<SystemSnapshot>,
    ) -> Self {
        self.snapshot_before = before;
        self.snapshot_after = after;
        self
    }
}

/// On-disk document for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogDocument {
    pub session_id: String,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: Vec<ChangelogEntry>,
}

impl ChangelogDocument {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Summary line for listing stored changelogs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangelogInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub entries: usize,
    pub failures: usize,
    pub path: PathBuf,
}

/// Per-session changelog writer
pub struct ChangelogWriter {
    path: PathBuf,
    document: ChangelogDocument,
    redactor: Box<dyn Redactor>,
    fail_closed: bool,
}

impl ChangelogWriter {
    /// Writer for a new session; nothing touches disk until the first append
    pub fn new(session_id: impl Into<String>, dir: impl AsRef<Path>) -> Self {
        let session_id = session_id.into();
        let path = dir.as_ref().join(format!("{}.json", session_id));
        Self {
            path,
            document: ChangelogDocument {
                session_id,
                created_at: Utc::now(),
                entries: Vec::new(),
            },
            redactor: Box::new(NoopRedactor),
            fail_closed: true,
        }
    }

    /// Continue an existing session log, or start a new one if absent
    pub fn open(session_id: impl Into<String>, dir: impl AsRef<Path>) -> Result<Self> {
        let mut writer = Self::new(session_id, dir);
        if writer.path.exists() {
            let document = ChangelogDocument::load(&writer.path)?;
            if document.session_id != writer.document.session_id {
                return Err(FieldtechError::Changelog(format!(
                    "{} belongs to session {}",
                    writer.path.display(),
                    document.session_id
                )));
            }
            writer.document = document;
        }
        Ok(writer)
    }

    pub fn with_redactor(mut self, redactor: Box<dyn Redactor>, fail_closed: bool) -> Self {
        self.redactor = redactor;
        self.fail_closed = fail_closed;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.document.session_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[ChangelogEntry] {
        &self.document.entries
    }

    /// Redact and durably append one entry.
    ///
    /// On a write error the entry stays in memory and is written with the
    /// next successful append.
    pub fn append(&mut self, mut entry: ChangelogEntry) -> Result<()> {
        entry.tool_input =
            redact_json_for_storage(self.redactor.as_ref(), &entry.tool_input, self.fail_closed);
        entry.result = redact_for_storage(self.redactor.as_ref(), &entry.result, self.fail_closed);

        debug!(
            "Changelog {}: {} (success={})",
            self.document.session_id, entry.tool_name, entry.success
        );
        self.document.entries.push(entry);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.document)?;
        atomic_write_private(&self.path, &json).map_err(|e| {
            warn!("Failed to write changelog {}: {}", self.path.display(), e);
            FieldtechError::Changelog(format!("{}: {}", self.path.display(), e))
        })
    }

    /// Human-readable account of the session's changes
    pub fn summary(&self) -> String {
        format_summary(&self.document)
    }
}

/// Render a changelog document for humans
pub fn format_summary(document: &ChangelogDocument) -> String {
    if document.entries.is_empty() {
        return "No changes were made.".to_string();
    }

    let mut lines = Vec::new();
    for (i, entry) in document.entries.iter().enumerate() {
        let status = if entry.success { "OK" } else { "FAILED" };
        lines.push(format!("Step {} - {} [{}]", i + 1, entry.tool_name, status));
        lines.push(format!("  Time:     {}", entry.timestamp.format("%Y-%m-%d %H:%M:%S")));
        lines.push(format!("  Input:    {}", entry.tool_input));
        if entry.duration_ms > 0 {
            lines.push(format!("  Duration: {} ms", entry.duration_ms));
        }
        let first_line = entry.result.lines().next().unwrap_or("");
        lines.push(format!("  Output:   {}", first_line));
    }
    lines.join("\n")
}

/// All changelogs in `dir`, newest first. Unreadable files are skipped.
pub fn list_changelogs(dir: &Path) -> Result<Vec<ChangelogInfo>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut infos = Vec::new();
    for dirent in fs::read_dir(dir)? {
        let path = dirent?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match ChangelogDocument::load(&path) {
            Ok(doc) => infos.push(ChangelogInfo {
                failures: doc.entries.iter().filter(|e| !e.success).count(),
                entries: doc.entries.len(),
                session_id: doc.session_id,
                created_at: doc.created_at,
                path,
            }),
            Err(e) => warn!("Skipping unreadable changelog {}: {}", path.display(), e),
        }
    }

    infos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(infos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redaction::{
        PatternRedactor, RedactionError, REDACTION_FAILED_PLACEHOLDER, SECRET_KEY_PLACEHOLDER,
    };
    use serde_json::json;

    fn input(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_nothing_written_before_first_append() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ChangelogWriter::new("s1", dir.path());
        assert!(!writer.path().exists());
        assert_eq!(writer.summary(), "No changes were made.");
    }

    #[test]
    fn test_append_persists_each_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChangelogWriter::new("s1", dir.path());

        let path = input(json!({"path": "/tmp"}));
        let entry = ChangelogEntry::new("cleanup_disk", &path, "freed 2 GB", true);
        writer.append(entry.with_duration(40)).unwrap();
        let doc = ChangelogDocument::load(writer.path()).unwrap();
        assert_eq!(doc.session_id, "s1");
        assert_eq!(doc.entries.len(), 1);
        assert_eq!(doc.entries[0].duration_ms, 40);

        writer
            .append(ChangelogEntry::new(
                "restart_service",
                &input(json!({"name": "cups"})),
                "exit 1",
                false,
            ))
            .unwrap();
        let doc = ChangelogDocument::load(writer.path()).unwrap();
        assert_eq!(doc.entries.len(), 2);
        assert_eq!(doc.entries[0].tool_name, "cleanup_disk");
        assert!(!doc.entries[1].success);
    }

    #[test]
    fn test_input_and_result_are_redacted() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChangelogWriter::new("s2", dir.path())
            .with_redactor(Box::new(PatternRedactor::new()), true);

        writer
            .append(ChangelogEntry::new(
                "reset_password",
                &input(json!({"user": "jane@example.com"})),
                "mail sent to jane@example.com",
                true,
            ))
            .unwrap();

        let raw = fs::read_to_string(writer.path()).unwrap();
        assert!(!raw.contains("jane@example.com"));
        let doc = ChangelogDocument::load(writer.path()).unwrap();
        assert_eq!(doc.entries[0].tool_input, json!({"user": "[REDACTED:EMAIL]"}));
        assert_eq!(doc.entries[0].result, "mail sent to [REDACTED:EMAIL]");
    }

    #[test]
    fn test_fail_closed_redaction_stores_placeholder() {
        struct Broken;
        impl Redactor for Broken {
            fn anonymize(&self, _text: &str) -> std::result::Result<String, RedactionError> {
                Err(RedactionError::Failed("offline".to_string()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            ChangelogWriter::new("s3", dir.path()).with_redactor(Box::new(Broken), true);
        writer
            .append(ChangelogEntry::new("x", &input(json!({"k": "v"})), "secret", true))
            .unwrap();

        let entry = &writer.entries()[0];
        assert_eq!(entry.result, REDACTION_FAILED_PLACEHOLDER);
        assert_eq!(entry.tool_input, json!({"k": REDACTION_FAILED_PLACEHOLDER}));
    }

    #[test]
    fn test_password_key_never_reaches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChangelogWriter::new("s7", dir.path())
            .with_redactor(Box::new(PatternRedactor::new()), true);

        writer
            .append(ChangelogEntry::new(
                "set_password",
                &input(json!({"username": "admin", "password": "Hunter2Secret"})),
                "password changed",
                true,
            ))
            .unwrap();

        let raw = fs::read_to_string(writer.path()).unwrap();
        assert!(!raw.contains("Hunter2Secret"));
        let doc = ChangelogDocument::load(writer.path()).unwrap();
        assert_eq!(
            doc.entries[0].tool_input,
            json!({"username": "admin", "password": SECRET_KEY_PLACEHOLDER})
        );
    }

    #[test]
    fn test_old_entries_missing_fields_still_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.json");
        fs::write(
            &path,
            r#"{"session_id":"old","created_at":"2025-01-01T00:00:00Z",
                "entries":[{"tool_name":"cleanup_disk"}]}"#,
        )
        .unwrap();

        let doc = ChangelogDocument::load(&path).unwrap();
        let entry = &doc.entries[0];
        assert_eq!(entry.tool_name, "cleanup_disk");
        assert_eq!(entry.result, "");
        assert!(!entry.success);
        assert_eq!(entry.duration_ms, 0);
        assert!(entry.snapshot_before.is_none());
    }

    #[test]
    fn test_open_continues_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChangelogWriter::new("s4", dir.path());
        writer
            .append(ChangelogEntry::new("a", &Map::new(), "ok", true))
            .unwrap();

        let mut reopened = ChangelogWriter::open("s4", dir.path()).unwrap();
        assert_eq!(reopened.entries().len(), 1);
        reopened
            .append(ChangelogEntry::new("b", &Map::new(), "ok", true))
            .unwrap();
        assert_eq!(ChangelogDocument::load(reopened.path()).unwrap().entries.len(), 2);
    }

    #[test]
    fn test_snapshots_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChangelogWriter::new("s5", dir.path());
        let snapshot = |free: &str| {
            SystemSnapshot::new(BTreeMap::from([("disk_free".to_string(), free.to_string())]))
        };
        let before = snapshot("1G");
        let after = snapshot("9G");
        writer
            .append(
                ChangelogEntry::new("cleanup_disk", &Map::new(), "ok", true)
                    .with_snapshots(Some(before.clone()), Some(after.clone())),
            )
            .unwrap();

        let doc = ChangelogDocument::load(writer.path()).unwrap();
        assert_eq!(doc.entries[0].snapshot_before, Some(before));
        assert_eq!(doc.entries[0].snapshot_after, Some(after));
    }

    #[test]
    fn test_list_changelogs() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChangelogWriter::new("listed", dir.path());
        writer
            .append(ChangelogEntry::new("a", &Map::new(), "boom", false))
            .unwrap();
        fs::write(dir.path().join("garbage.json"), "not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let infos = list_changelogs(dir.path()).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].session_id, "listed");
        assert_eq!(infos[0].failures, 1);

        assert!(list_changelogs(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_summary_lists_steps() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChangelogWriter::new("s6", dir.path());
        writer
            .append(ChangelogEntry::new("cleanup_disk", &Map::new(), "freed 2 GB\nmore", true))
            .unwrap();
        let summary = writer.summary();
        assert!(summary.contains("Step 1 - cleanup_disk [OK]"));
        assert!(summary.contains("Output:   freed 2 GB"));
        assert!(!summary.contains("more"));
    }
}
