//! CLI surface: `deploy | deploy-fast | prewarm | rollback | status |
//! history`, with flags `--project-root`, `--drain-seconds`,
//! `--health-timeout` (spec.md §6.5).

use clap::{Parser, Subcommand};

use crate::config::{DEFAULT_DRAIN_SECS, DEFAULT_HEALTH_TIMEOUT_SECS};

#[derive(Parser, Debug)]
#[command(name = "bgdeploy")]
#[command(version = concat!("Ver:", env!("CARGO_PKG_VERSION")))]
#[command(about = "Blue/green deployment orchestrator for a single-instance inference server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Root of the project tree (state, nginx templates, deploy.log).
    #[arg(long = "project-root", global = true, default_value = ".")]
    pub project_root: String,

    /// Seconds to wait for in-flight connections to drain after a swap.
    #[arg(long = "drain-seconds", global = true, default_value_t = DEFAULT_DRAIN_SECS)]
    pub drain_seconds: u64,

    /// Seconds to wait for the standby to become ready during `deploy`.
    #[arg(long = "health-timeout", global = true, default_value_t = DEFAULT_HEALTH_TIMEOUT_SECS)]
    pub health_timeout: u64,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Full flow: start standby, warm it, swap, drain, verify, retire old active.
    Deploy,
    /// Swap using an already pre-warmed standby (target under 30s).
    DeployFast,
    /// Warm the standby without touching live traffic.
    Prewarm,
    /// Swap traffic back to the current standby color.
    Rollback,
    /// Print the current deployment state plus live reality.
    Status,
    /// Print the bounded deployment history, most recent first.
    History,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
