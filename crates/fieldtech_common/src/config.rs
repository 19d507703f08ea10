//! Fieldtech Configuration
//!
//! TOML file at `$FIELDTECH_CONFIG`, or `<config_dir>/fieldtech/config.toml`
//! (`~/.config/fieldtech/config.toml` on Linux). Every field has a default, so
//! a partial file or no file at all is a valid configuration.
//!
//! ```toml
//! log_level = "info"
//!
//! [changelog]
//! redaction_fail_closed = true
//!
//! [usage]
//! edition = "free"
//! monthly_repair_limit = 5
//!
//! [transport]
//! default_timeout_secs = 30
//! ssh_strict_host_keys = true
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::Result;

/// Environment variable that overrides the config file location
pub const CONFIG_ENV: &str = "FIELDTECH_CONFIG";
const APP_DIR: &str = "fieldtech";
const CONFIG_FILE: &str = "config.toml";

/// Product edition, decides the repair quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    #[default]
    Free,
    Pro,
}

impl Edition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Edition::Free => "free",
            Edition::Pro => "pro",
        }
    }

    pub fn is_limited(&self) -> bool {
        matches!(self, Edition::Free)
    }
}

/// Changelog settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangelogSettings {
    /// Override for the changelog directory (default: `<data_dir>/changelogs`)
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Store a placeholder instead of raw input when redaction fails
    #[serde(default = "default_true")]
    pub redaction_fail_closed: bool,
}

impl Default for ChangelogSettings {
    fn default() -> Self {
        Self {
            dir: None,
            redaction_fail_closed: true,
        }
    }
}

/// Hook pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HookSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Register the backup check before the first repair
    #[serde(default = "default_true")]
    pub backup_check: bool,
}

impl Default for HookSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backup_check: true,
        }
    }
}

/// Repair quota settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageSettings {
    #[serde(default)]
    pub edition: Edition,

    /// Successful repairs per calendar month for limited editions
    #[serde(default = "default_monthly_repair_limit")]
    pub monthly_repair_limit: u32,
}

fn default_monthly_repair_limit() -> u32 {
    5
}

impl Default for UsageSettings {
    fn default() -> Self {
        Self {
            edition: Edition::default(),
            monthly_repair_limit: default_monthly_repair_limit(),
        }
    }
}

/// Command runner settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSettings {
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    #[serde(default = "default_max_read_lines")]
    pub max_read_lines: usize,

    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: usize,

    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,

    /// Refuse SSH hosts that are not in known_hosts
    #[serde(default = "default_true")]
    pub ssh_strict_host_keys: bool,

    /// Local PowerShell used for WinRM
    #[serde(default = "default_powershell")]
    pub powershell: String,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_read_lines() -> usize {
    200
}

fn default_max_read_bytes() -> usize {
    1_048_576 // 1 MiB
}

fn default_max_search_results() -> usize {
    50
}

fn default_powershell() -> String {
    "pwsh".to_string()
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_read_lines: default_max_read_lines(),
            max_read_bytes: default_max_read_bytes(),
            max_search_results: default_max_search_results(),
            ssh_strict_host_keys: true,
            powershell: default_powershell(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Complete configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldtechConfig {
    /// Default tracing filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Override for the data directory (changelogs, usage)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub changelog: ChangelogSettings,

    #[serde(default)]
    pub hooks: HookSettings,

    #[serde(default)]
    pub usage: UsageSettings,

    #[serde(default)]
    pub transport: TransportSettings,
}

impl Default for FieldtechConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: None,
            changelog: ChangelogSettings::default(),
            hooks: HookSettings::default(),
            usage: UsageSettings::default(),
            transport: TransportSettings::default(),
        }
    }
}

impl FieldtechConfig {
    /// Load from the default location; defaults on a missing or bad file
    pub fn load() -> Self {
        let path = config_path();
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Load from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save to an explicit path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::FieldtechError::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Effective data directory
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    /// Effective changelog directory
    pub fn changelog_dir(&self) -> PathBuf {
        self.changelog
            .dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("changelogs"))
    }

    /// Usage counter file
    pub fn usage_path(&self) -> PathBuf {
        self.data_dir().join("usage.json")
    }
}

/// Config file location
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join(CONFIG_FILE)
}

/// `<data_dir>/fieldtech`, or `./.fieldtech` when the platform has none
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(".fieldtech"))
}
