//! Container runtime: a narrow, injectable capability over the local
//! compose-style CLI (spec.md §6.2). Production calls go through the
//! Command Runner; tests substitute `crate::testing::FakeRuntime` so the
//! engine's state machine can be exercised without Docker or nginx,
//! matching the Design Notes' "capability, not shell glue" guidance.

use std::time::Duration;

use async_trait::async_trait;

use crate::color::Color;
use crate::config::Config;
use crate::error::Result;
use crate::runner::{CommandRunner, CommandSpec};

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a replica by color under the deploy profile.
    async fn start(&self, color: Color) -> Result<()>;

    /// Stop and remove a replica; best-effort, never fails the caller.
    async fn stop_and_remove(&self, color: Color);

    /// Whether the named service currently reports `State: running`.
    async fn is_running(&self, color: Color) -> Result<bool>;

    /// Opaque runtime-issued container id for a running replica.
    async fn container_id(&self, color: Color) -> Result<String>;

    /// Tail of the replica's logs, for diagnostics on a failed start.
    async fn tail_logs(&self, color: Color, lines: u32) -> String;

    /// Whether the proxy container/service is running.
    async fn proxy_running(&self) -> Result<bool>;

    /// Run a command inside the proxy container (`nginx -t`, `nginx -s reload`).
    async fn exec_in_proxy(&self, args: &[&str]) -> Result<()>;
}

/// Production implementation backed by `docker compose` through the
/// Command Runner.
pub struct ComposeRuntime {
    runner: CommandRunner,
    config: Config,
}

impl ComposeRuntime {
    pub fn new(runner: CommandRunner, config: Config) -> Self {
        Self { runner, config }
    }

    fn service(&self, color: Color) -> String {
        color.to_string()
    }
}

#[async_trait]
impl ContainerRuntime for ComposeRuntime {
    async fn start(&self, color: Color) -> Result<()> {
        self.runner
            .run(
                CommandSpec::line(format!(
                    "docker compose --profile deploy up -d {}",
                    self.service(color)
                )),
                Duration::from_secs(30),
                true,
            )
            .await?;
        Ok(())
    }

    async fn stop_and_remove(&self, color: Color) {
        let service = self.service(color);
        let _ = self
            .runner
            .run(
                CommandSpec::line(format!("docker compose --profile deploy stop {service}")),
                Duration::from_secs(30),
                false,
            )
            .await;
        let _ = self
            .runner
            .run(
                CommandSpec::line(format!("docker compose --profile deploy rm -f {service}")),
                Duration::from_secs(10),
                false,
            )
            .await;
    }

    async fn is_running(&self, color: Color) -> Result<bool> {
        let out = self
            .runner
            .run(
                CommandSpec::line(format!(
                    "docker compose --profile deploy ps {} --format json",
                    self.service(color)
                )),
                Duration::from_secs(10),
                false,
            )
            .await?;

        if out.stdout.trim().is_empty() {
            return Ok(false);
        }
        for line in out.stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(line) {
                if v.get("State").and_then(|s| s.as_str()) == Some("running") {
                    return Ok(true);
                }
            }
        }
        Ok(out.stdout.to_lowercase().contains("running"))
    }

    async fn container_id(&self, color: Color) -> Result<String> {
        let out = self
            .runner
            .run(
                CommandSpec::tokens([
                    "docker",
                    "inspect",
                    "--format={{.Id}}",
                    &self.config.service_name(color),
                ]),
                Duration::from_secs(10),
                true,
            )
            .await?;
        Ok(out.stdout.trim().trim_matches('\'').to_string())
    }

    async fn tail_logs(&self, color: Color, lines: u32) -> String {
        self.runner
            .run(
                CommandSpec::line(format!(
                    "docker compose --profile deploy logs --tail={lines} {}",
                    self.service(color)
                )),
                Duration::from_secs(10),
                false,
            )
            .await
            .map(|o| o.stdout)
            .unwrap_or_default()
    }

    async fn proxy_running(&self) -> Result<bool> {
        let out = self
            .runner
            .run(
                CommandSpec::line(format!(
                    "docker compose --profile deploy ps {} --format json",
                    self.config.proxy_service
                )),
                Duration::from_secs(10),
                false,
            )
            .await?;
        Ok(out.stdout.to_lowercase().contains("running"))
    }

    async fn exec_in_proxy(&self, args: &[&str]) -> Result<()> {
        let mut tokens = vec!["docker".to_string(), "exec".to_string(), self.config.proxy_service.clone()];
        tokens.extend(args.iter().map(|s| s.to_string()));
        self.runner
            .run(CommandSpec::Tokens(tokens), Duration::from_secs(5), true)
            .await?;
        Ok(())
    }
}
