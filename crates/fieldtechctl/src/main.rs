//! Fieldtech Control - command line front end for maintenance sessions
//!
//! Runs single audit or repair commands through the authorization gate,
//! locally or on a remote target, and inspects changelogs and usage.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use fieldtech_common::config::FieldtechConfig;
use fieldtechctl::commands::{self, Report, RunRequest};
use fieldtechctl::target::Target;

#[derive(Parser)]
#[command(name = "fieldtechctl")]
#[command(about = "Fieldtech - approval-gated maintenance commands", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to $FIELDTECH_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Run on an SSH target (user@host[:port])
    #[arg(long, conflicts_with = "winrm")]
    ssh: Option<String>,

    /// SSH private key
    #[arg(long, requires = "ssh")]
    identity: Option<PathBuf>,

    /// Run on a Windows target over WinRM
    #[arg(long)]
    winrm: Option<String>,

    /// WinRM user
    #[arg(long, default_value = "Administrator")]
    winrm_user: String,

    /// Use HTTPS (port 5986) for WinRM
    #[arg(long, requires = "winrm")]
    winrm_ssl: bool,
}

impl TargetArgs {
    fn target(self) -> Target {
        if let Some(target) = self.ssh {
            Target::Ssh {
                target,
                identity: self.identity,
            }
        } else if let Some(host) = self.winrm {
            Target::Winrm {
                host,
                username: self.winrm_user,
                use_ssl: self.winrm_ssl,
            }
        } else {
            Target::Local
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show how a GO REPAIR message is understood
    Approve {
        /// The message, e.g. "GO REPAIR: 1,3-5"
        #[arg(required = true)]
        text: Vec<String>,
    },

    /// Run one command through the authorization gate
    Run {
        #[command(flatten)]
        target: TargetArgs,

        /// The command changes the system (needs --approve, is logged)
        #[arg(long)]
        repair: bool,

        /// Approval text, e.g. "GO REPAIR"
        #[arg(long, requires = "repair")]
        approve: Option<String>,

        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Read the beginning of a file
    Read {
        #[command(flatten)]
        target: TargetArgs,

        path: String,
    },

    /// Search a file (case-insensitive)
    Search {
        #[command(flatten)]
        target: TargetArgs,

        path: String,
        pattern: String,
    },

    /// Inspect recorded changelogs
    Changelog {
        #[command(subcommand)]
        action: ChangelogAction,
    },

    /// Show this month's repair quota
    Usage,

    /// Show the effective configuration
    Config {
        /// Write the defaults to the config file
        #[arg(long)]
        init: bool,
    },
}

#[derive(Subcommand)]
enum ChangelogAction {
    /// List sessions with changes, newest first
    List,
    /// Show one session's changes
    Show { session: String },
}

fn init_logging(config: &FieldtechConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => FieldtechConfig::load_from(path)?,
        None => FieldtechConfig::load(),
    };
    init_logging(&config);
    debug!("Data directory: {}", config.data_dir().display());

    let report = match cli.command {
        Commands::Approve { text } => commands::approve(&text.join(" ")),
        Commands::Run {
            target,
            repair,
            approve,
            command,
        } => {
            commands::run(
                &config,
                RunRequest {
                    target: target.target(),
                    argv: command,
                    repair,
                    approval: approve,
                },
            )
            .await?
        }
        Commands::Read { target, path } => commands::read(&config, &target.target(), &path).await?,
        Commands::Search {
            target,
            path,
            pattern,
        } => commands::search(&config, &target.target(), &path, &pattern).await?,
        Commands::Changelog { action } => match action {
            ChangelogAction::List => commands::changelog_list(&config)?,
            ChangelogAction::Show { session } => commands::changelog_show(&config, &session)?,
        },
        Commands::Usage => commands::usage(&config),
        Commands::Config { init } => commands::config(&config, init)?,
    };

    finish(report)
}

fn finish(report: Report) -> Result<()> {
    if !report.text.is_empty() {
        println!("{}", report.text);
    }
    if !report.success {
        std::process::exit(1);
    }
    Ok(())
}
