//! Error types for Fieldtech.
//!
//! Only contract violations and connection setup surface as `Err`. Policy
//! denials, hook vetoes and command failures are ordinary values.

use thiserror::Error;

use crate::workflow::WorkflowState;

#[derive(Error, Debug)]
pub enum FieldtechError {
    #[error("Invalid workflow transition: {action} is not allowed in state {from}")]
    InvalidTransition {
        from: WorkflowState,
        action: &'static str,
    },

    #[error("Tool '{0}' is already registered")]
    ToolExists(String),

    #[error("SSH connection failed: {0}")]
    Ssh(String),

    #[error("WinRM connection failed: {0}")]
    Winrm(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Changelog error: {0}")]
    Changelog(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl FieldtechError {
    pub fn code(&self) -> i32 {
        match self {
            FieldtechError::InvalidTransition { .. } => -32010,
            FieldtechError::ToolExists(_) => -32011,
            FieldtechError::Ssh(_) => -32020,
            FieldtechError::Winrm(_) => -32021,
            FieldtechError::Config(_) => -32030,
            FieldtechError::Changelog(_) => -32040,
            FieldtechError::Io(_) => -32006,
            FieldtechError::Json(_) => -32700,
            FieldtechError::Toml(_) => -32701,
        }
    }

    /// True for errors that mean the caller broke the workflow contract.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, FieldtechError::InvalidTransition { .. })
    }
}

pub type Result<T> = std::result::Result<T, FieldtechError>;
