//! Remote target selection for commands that touch a machine

use anyhow::{anyhow, Result};
use fieldtech_common::config::FieldtechConfig;
use fieldtech_common::transport::{SshConfig, WinrmConfig};
use fieldtech_common::CommandRunner;
use std::path::PathBuf;

/// Password for SSH targets without a usable key
pub const SSH_PASSWORD_ENV: &str = "FIELDTECH_SSH_PASSWORD";

/// Password for WinRM targets
pub const WINRM_PASSWORD_ENV: &str = "FIELDTECH_WINRM_PASSWORD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local,
    /// "user@host[:port]"
    Ssh {
        target: String,
        identity: Option<PathBuf>,
    },
    Winrm {
        host: String,
        username: String,
        use_ssl: bool,
    },
}

impl Target {
    pub fn describe(&self) -> String {
        match self {
            Target::Local => "localhost".to_string(),
            Target::Ssh { target, .. } => format!("ssh {}", target),
            Target::Winrm { host, .. } => format!("winrm {}", host),
        }
    }

    pub fn ssh_config(&self, config: &FieldtechConfig) -> Result<Option<SshConfig>> {
        let Target::Ssh { target, identity } = self else {
            return Ok(None);
        };

        let mut ssh = SshConfig::from_target(target)
            .ok_or_else(|| anyhow!("invalid SSH target '{}' (expected user@host[:port])", target))?;
        ssh.key_path = identity.clone();
        ssh.password = std::env::var(SSH_PASSWORD_ENV).ok();
        ssh.strict_host_keys = config.transport.ssh_strict_host_keys;
        Ok(Some(ssh))
    }

    pub fn winrm_config(&self, config: &FieldtechConfig) -> Option<WinrmConfig> {
        let Target::Winrm {
            host,
            username,
            use_ssl,
        } = self
        else {
            return None;
        };

        let mut winrm = WinrmConfig::new(host.clone());
        winrm.username = username.clone();
        winrm.password = std::env::var(WINRM_PASSWORD_ENV).unwrap_or_default();
        winrm.use_ssl = *use_ssl;
        if *use_ssl {
            winrm.port = 5986;
        }
        winrm.powershell = config.transport.powershell.clone();
        Some(winrm)
    }

    /// Make this target the runner's active transport
    pub async fn connect(
        &self,
        runner: &mut CommandRunner,
        config: &FieldtechConfig,
    ) -> Result<()> {
        if let Some(ssh) = self.ssh_config(config)? {
            runner.connect_ssh(ssh).await?;
        } else if let Some(winrm) = self.winrm_config(config) {
            runner.connect_winrm(winrm).await?;
        }
        Ok(())
    }
}
