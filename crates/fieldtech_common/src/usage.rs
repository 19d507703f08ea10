//! Usage tracking - repair quota per edition
//!
//! Counters are kept per calendar month ("YYYY-MM") in a small JSON file
//! readable only by its owner:
//!
//! ```json
//! { "2026-03": { "repair_runs": 2, "sessions": 4 } }
//! ```
//!
//! Only limited editions are capped; a missing or corrupt file counts as zero.

use chrono::{Datelike, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::{Edition, UsageSettings};
use crate::error::Result;
use crate::fsutil::atomic_write_private;

/// Quota collaborator consulted by the executor before repairs
pub trait UsageTracker: Send + Sync {
    fn can_run_repair(&self) -> bool;

    /// Count one successful repair
    fn increment(&mut self);

    /// Shown to the user when a repair was refused
    fn limit_message(&self) -> String;
}

/// Counters for one month
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthUsage {
    #[serde(default)]
    pub repair_runs: u32,
    #[serde(default)]
    pub sessions: u32,
}

/// JSON-file backed tracker
#[derive(Debug)]
pub struct FileUsageTracker {
    path: PathBuf,
    edition: Edition,
    monthly_limit: u32,
    usage: BTreeMap<String, MonthUsage>,
}

impl FileUsageTracker {
    pub fn load(path: impl Into<PathBuf>, settings: &UsageSettings) -> Self {
        let path = path.into();
        let usage = read_usage(&path);
        Self {
            path,
            edition: settings.edition,
            monthly_limit: settings.monthly_repair_limit,
            usage,
        }
    }

    pub fn edition(&self) -> Edition {
        self.edition
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Repairs counted in the current month
    pub fn repair_count(&self) -> u32 {
        self.current().repair_runs
    }

    pub fn session_count(&self) -> u32 {
        self.current().sessions
    }

    /// Remaining repairs this month; `None` means unlimited
    pub fn remaining(&self) -> Option<u32> {
        if !self.edition.is_limited() {
            return None;
        }
        Some(self.monthly_limit.saturating_sub(self.repair_count()))
    }

    /// Count a started session
    pub fn record_session(&mut self) {
        self.current_mut().sessions += 1;
        self.save();
    }

    /// Usage per month, oldest first
    pub fn history(&self) -> &BTreeMap<String, MonthUsage> {
        &self.usage
    }

    fn current(&self) -> MonthUsage {
        self.usage.get(&month_key()).copied().unwrap_or_default()
    }

    fn current_mut(&mut self) -> &mut MonthUsage {
        self.usage.entry(month_key()).or_default()
    }

    fn save(&self) {
        if let Err(e) = write_usage(&self.path, &self.usage) {
            warn!("Failed to save usage to {}: {}", self.path.display(), e);
        }
    }
}

impl UsageTracker for FileUsageTracker {
    fn can_run_repair(&self) -> bool {
        self.remaining().map(|left| left > 0).unwrap_or(true)
    }

    fn increment(&mut self) {
        self.current_mut().repair_runs += 1;
        self.save();
    }

    fn limit_message(&self) -> String {
        match self.remaining() {
            None => format!("Repairs this month: {} (unlimited)", self.repair_count()),
            Some(0) => format!(
                "Repair limit reached ({}/{} this month on the {} edition). \
                 Upgrade to Pro for unlimited repairs.",
                self.repair_count(),
                self.monthly_limit,
                self.edition.as_str()
            ),
            Some(left) => format!(
                "Repairs this month: {}/{} ({} remaining)",
                self.repair_count(),
                self.monthly_limit,
                left
            ),
        }
    }
}

fn month_key() -> String {
    let now = Local::now();
    format!("{:04}-{:02}", now.year(), now.month())
}

fn read_usage(path: &Path) -> BTreeMap<String, MonthUsage> {
    let Ok(content) = fs::read_to_string(path) else {
        return BTreeMap::new();
    };
    serde_json::from_str(&content).unwrap_or_else(|e| {
        warn!("Ignoring corrupt usage file {}: {}", path.display(), e);
        BTreeMap::new()
    })
}

fn write_usage(path: &Path, usage: &BTreeMap<String, MonthUsage>) -> Result<()> {
    let json = serde_json::to_vec_pretty(usage)?;
    atomic_write_private(path, &json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free(limit: u32) -> UsageSettings {
        UsageSettings {
            edition: Edition::Free,
            monthly_repair_limit: limit,
        }
    }

    #[test]
    fn test_free_edition_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");
        let mut tracker = FileUsageTracker::load(&path, &free(2));

        assert!(tracker.can_run_repair());
        tracker.increment();
        assert!(tracker.can_run_repair());
        assert_eq!(tracker.remaining(), Some(1));
        tracker.increment();
        assert!(!tracker.can_run_repair());
        assert!(tracker.limit_message().contains("limit reached"));
    }

    #[test]
    fn test_pro_edition_is_unlimited() {
        let dir = tempfile::tempdir().unwrap();
        let settings = UsageSettings {
            edition: Edition::Pro,
            monthly_repair_limit: 0,
        };
        let mut tracker = FileUsageTracker::load(dir.path().join("usage.json"), &settings);
        for _ in 0..10 {
            tracker.increment();
        }
        assert!(tracker.can_run_repair());
        assert_eq!(tracker.remaining(), None);
        assert!(tracker.limit_message().contains("unlimited"));
    }

    #[test]
    fn test_counts_persist_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");

        let mut tracker = FileUsageTracker::load(&path, &free(5));
        tracker.increment();
        tracker.record_session();

        let reloaded = FileUsageTracker::load(&path, &free(5));
        assert_eq!(reloaded.repair_count(), 1);
        assert_eq!(reloaded.session_count(), 1);
        assert_eq!(reloaded.history().len(), 1);
    }

    #[test]
    fn test_corrupt_file_counts_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");
        fs::write(&path, "{not json").unwrap();

        let tracker = FileUsageTracker::load(&path, &free(5));
        assert_eq!(tracker.repair_count(), 0);
        assert!(tracker.can_run_repair());
    }

    #[test]
    fn test_month_key_format() {
        let key = month_key();
        assert_eq!(key.len(), 7);
        assert_eq!(&key[4..5], "-");
    }
}
