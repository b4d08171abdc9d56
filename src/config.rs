//! Orchestrator configuration.
//!
//! Assembled once at construction time from CLI flags plus compiled-in
//! defaults (per the Design Notes: configuration is passed in, not read
//! from ambient globals). There is no on-disk config file for the
//! orchestrator itself -- only the per-replica nginx upstream templates
//! and the state document, both under `project_root`.

use std::path::{Path, PathBuf};

use crate::color::Color;

/// Default health-check timeout for a full `deploy`, in seconds.
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 180;
/// Default connection-drain window, in seconds.
pub const DEFAULT_DRAIN_SECS: u64 = 15;
/// Pre-warm is considered stale after this many minutes (advisory only).
pub const PREWARM_STALE_MINUTES: i64 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the project tree; state, nginx templates and the log file
    /// are all resolved relative to this.
    pub project_root: PathBuf,
    /// How long `deploy` waits for the standby to become ready.
    pub health_timeout_secs: u64,
    /// How long to wait for in-flight requests to drain after a swap.
    pub drain_seconds: u64,
    /// Static (color -> port) bijection.
    pub blue_port: u16,
    pub green_port: u16,
    /// Service name prefix passed to the container runtime, e.g. `smollm2`.
    pub service_prefix: String,
    /// Name of the proxy container/service.
    pub proxy_service: String,
    /// Public port the proxy listens on for end-to-end verification.
    pub proxy_public_port: u16,
}

impl Config {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            health_timeout_secs: DEFAULT_HEALTH_TIMEOUT_SECS,
            drain_seconds: DEFAULT_DRAIN_SECS,
            blue_port: 8000,
            green_port: 8001,
            service_prefix: "smollm2".to_string(),
            proxy_service: "smollm2-nginx".to_string(),
            proxy_public_port: 80,
        }
    }

    pub fn port_for(&self, color: Color) -> u16 {
        match color {
            Color::Blue => self.blue_port,
            Color::Green => self.green_port,
        }
    }

    pub fn state_file(&self) -> PathBuf {
        self.project_root.join("deploy").join("state.json")
    }

    pub fn state_backup_file(&self) -> PathBuf {
        let mut p = self.state_file().into_os_string();
        p.push(".bak");
        PathBuf::from(p)
    }

    pub fn log_file(&self) -> PathBuf {
        self.project_root.join("deploy").join("deploy.log")
    }

    pub fn nginx_conf_dir(&self) -> PathBuf {
        self.project_root.join("nginx").join("conf.d")
    }

    pub fn nginx_templates_dir(&self) -> PathBuf {
        self.project_root.join("nginx")
    }

    pub fn active_nginx_conf(&self) -> PathBuf {
        self.nginx_conf_dir().join("default.conf")
    }

    pub fn upstream_template(&self, color: Color) -> PathBuf {
        self.nginx_templates_dir()
            .join(format!("upstream-{color}.conf"))
    }

    pub fn service_name(&self, color: Color) -> String {
        color.service_name(&self.service_prefix)
    }

    pub fn project_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.project_root.join(rel)
    }
}
