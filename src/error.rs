//! Error taxonomy for the deployment orchestrator.
//!
//! Each variant carries the step it failed at (when applicable) and a
//! human-readable message; command/timeout failures from the Command Runner
//! are wrapped by the higher-level variant that triggered them, per the
//! propagation policy: the engine only matches on its own domain errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("preflight check failed: {0}")]
    Preflight(String),

    #[error("standby container failed to start: {0}")]
    ContainerStart(String),

    #[error("health check timed out: {0}")]
    HealthTimeout(String),

    #[error("warm-up inference failed: {0}")]
    Warmup(String),

    #[error("proxy config rejected: {0}")]
    ProxyConfig(String),

    #[error("proxy reload failed: {0}")]
    ProxyReload(String),

    #[error("traffic verification failed: {0}")]
    Verification(String),

    #[error("pre-warm state mismatch: {0}")]
    StateMismatch(String),

    #[error("command failed: {command}\nstderr: {stderr}")]
    Command { command: String, stderr: String },

    #[error("command timed out after {timeout_secs}s: {command}")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("state store error: {0}")]
    State(String),

    #[error("aborted by user")]
    Aborted,
}

impl DeploymentError {
    /// The taxonomy name used in history entries and log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            DeploymentError::Preflight(_) => "PreflightError",
            DeploymentError::ContainerStart(_) => "ContainerStartError",
            DeploymentError::HealthTimeout(_) => "HealthTimeoutError",
            DeploymentError::Warmup(_) => "WarmupError",
            DeploymentError::ProxyConfig(_) => "ProxyConfigError",
            DeploymentError::ProxyReload(_) => "ProxyReloadError",
            DeploymentError::Verification(_) => "VerificationError",
            DeploymentError::StateMismatch(_) => "StateMismatchError",
            DeploymentError::Command { .. } => "CommandError",
            DeploymentError::Timeout { .. } => "TimeoutError",
            DeploymentError::State(_) => "StateError",
            DeploymentError::Aborted => "Aborted",
        }
    }

    /// Truncate the error string the way history entries store it, so a
    /// single pathological stderr blob never bloats `state.json`.
    pub fn truncated(&self, max_len: usize) -> String {
        let s = self.to_string();
        if s.len() <= max_len {
            s
        } else {
            format!("{}...", &s[..max_len])
        }
    }
}

pub type Result<T> = std::result::Result<T, DeploymentError>;
