//! Deployment Engine: the four top-level operations (`deploy`, `prewarm`,
//! `deploy-fast`, `rollback`) plus the `status`/`history` read views, each
//! composing the Command Runner (via `ContainerRuntime`), Replica Probe,
//! Proxy Controller and State Store (spec.md §4.5). The engine is the only
//! writer of the state document; every terminal outcome -- success or
//! failure -- appends exactly one history entry and persists once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use crate::color::Color;
use crate::config::{Config, PREWARM_STALE_MINUTES};
use crate::error::{DeploymentError, Result};
use crate::logging::Logger;
use crate::probe::{HealthClient, ReplicaProbe};
use crate::proxy::ProxyController;
use crate::runtime::ContainerRuntime;
use crate::state::{DeployMode, DeploymentState, HistoryEntry, StateStore};

#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub from: Color,
    pub to: Color,
    pub deployment_count: u64,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct PrewarmOutcome {
    pub already_warm: bool,
    pub standby_color: Color,
    pub container_id: String,
}

#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    pub from: Color,
    pub to: Color,
    pub traffic_verified: bool,
}

#[derive(Debug, Clone)]
pub struct StatusView {
    pub state: DeploymentState,
    pub active_running: bool,
    pub standby_running: bool,
    pub standby_healthy: Option<bool>,
}

pub struct Engine {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    probe: ReplicaProbe,
    proxy: ProxyController,
    store: StateStore,
    logger: Logger,
}

impl Engine {
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>, http: Arc<dyn HealthClient>) -> Self {
        let logger = Logger::new(config.log_file());
        let probe = ReplicaProbe::new(http, runtime.clone(), logger.clone());
        let proxy = ProxyController::new(config.clone(), runtime.clone(), logger.clone());
        let store = StateStore::new(config.clone());
        Self {
            config,
            runtime,
            probe,
            proxy,
            store,
            logger,
        }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Active-replica and proxy-routing checks shared by every flow.
    /// Deliberately does *not* touch the standby container: `deploy` and
    /// `prewarm` each decide what to do with a leftover standby themselves
    /// (spec.md §4.5.1 step 1 vs §4.5.2 step 1 differ on this).
    async fn preflight(&self, state: &DeploymentState) -> Result<()> {
        let active = state.active_color;

        let active_running = self
            .runtime
            .is_running(active)
            .await
            .map_err(|e| DeploymentError::Preflight(e.to_string()))?;
        if !active_running {
            return Err(DeploymentError::Preflight(format!(
                "active replica {active} is not running"
            )));
        }

        if !self
            .probe
            .wait_ready(self.config.port_for(active), Duration::from_secs(120), Duration::from_secs(2))
            .await
        {
            return Err(DeploymentError::Preflight(format!(
                "active replica {active} failed readiness check"
            )));
        }

        let proxy_running = self
            .runtime
            .proxy_running()
            .await
            .map_err(|e| DeploymentError::Preflight(e.to_string()))?;
        if !proxy_running {
            return Err(DeploymentError::Preflight("proxy container is not running".to_string()));
        }

        if !self.probe.healthz(self.config.proxy_public_port).await {
            return Err(DeploymentError::Preflight(
                "proxy does not serve /healthz externally".to_string(),
            ));
        }

        Ok(())
    }

    /// Stop a standby left running from a prior aborted run. Used by
    /// `deploy`, which (unlike `prewarm`) always wants a clean standby slot.
    async fn stop_leftover_standby(&self, standby: Color) -> Result<()> {
        let standby_running = self
            .runtime
            .is_running(standby)
            .await
            .map_err(|e| DeploymentError::Preflight(e.to_string()))?;
        if standby_running {
            self.logger
                .warn(&format!("  leftover {standby} container found, stopping"))
                .await;
            self.runtime.stop_and_remove(standby).await;
        }
        Ok(())
    }

    async fn start_standby(&self, color: Color) -> Result<()> {
        self.runtime
            .start(color)
            .await
            .map_err(|e| DeploymentError::ContainerStart(e.to_string()))?;
        tokio::time::sleep(Duration::from_secs(5)).await;
        let running = self
            .runtime
            .is_running(color)
            .await
            .map_err(|e| DeploymentError::ContainerStart(e.to_string()))?;
        if !running {
            let logs = self.runtime.tail_logs(color, 50).await;
            return Err(DeploymentError::ContainerStart(format!(
                "{color} did not come up; last logs:\n{logs}"
            )));
        }
        Ok(())
    }

    async fn verify_traffic(&self) -> bool {
        for attempt in 0..3 {
            if !self.probe.healthz(self.config.proxy_public_port).await {
                return false;
            }
            if attempt < 2 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        true
    }

    fn history_entry(
        from: Color,
        to: Color,
        duration: Duration,
        success: bool,
        error: Option<&DeploymentError>,
        rollback: bool,
        mode: Option<DeployMode>,
    ) -> HistoryEntry {
        HistoryEntry {
            timestamp: Utc::now(),
            from_color: from,
            to_color: to,
            duration_seconds: duration.as_secs_f64(),
            success,
            error: error.map(|e| e.truncated(2000)),
            rollback,
            mode,
        }
    }

    /// Record a failed terminal outcome: append history, persist once,
    /// log, and propagate the original error unchanged.
    async fn fail<T>(
        &self,
        mut state: DeploymentState,
        from: Color,
        to: Color,
        start: Instant,
        err: DeploymentError,
        mode: Option<DeployMode>,
    ) -> Result<T> {
        state.push_history(Self::history_entry(
            from,
            to,
            start.elapsed(),
            false,
            Some(&err),
            false,
            mode,
        ));
        if let Err(save_err) = self.store.save(&state).await {
            self.logger
                .critical(&format!("  failed to persist failure history: {save_err}"))
                .await;
        }
        self.logger.error(&format!("  deployment failed: {err}")).await;
        Err(err)
    }

    /// Full flow: spec.md §4.5.1.
    pub async fn deploy(&self) -> Result<DeployOutcome> {
        let start = Instant::now();
        let mut state = self.store.load().await?;
        let from = state.active_color;
        let to = state.standby_color;
        let run_id = Uuid::new_v4();

        self.logger
            .info(&format!("[{run_id}] deploy: {from} active, promoting {to}"))
            .await;

        if state.standby_prewarmed {
            self.runtime.stop_and_remove(to).await;
            state.clear_prewarm();
        }

        if let Err(e) = self.preflight(&state).await {
            return self.fail(state, from, to, start, e, Some(DeployMode::Normal)).await;
        }

        if let Err(e) = self.stop_leftover_standby(to).await {
            return self.fail(state, from, to, start, e, Some(DeployMode::Normal)).await;
        }

        if let Err(e) = self.start_standby(to).await {
            self.runtime.stop_and_remove(to).await;
            return self.fail(state, from, to, start, e, Some(DeployMode::Normal)).await;
        }

        let ready = self
            .probe
            .wait_ready(
                self.config.port_for(to),
                Duration::from_secs(self.config.health_timeout_secs),
                Duration::from_secs(2),
            )
            .await;
        if !ready {
            self.runtime.stop_and_remove(to).await;
            let err = DeploymentError::HealthTimeout(format!(
                "{to} did not become ready within {}s",
                self.config.health_timeout_secs
            ));
            return self.fail(state, from, to, start, err, Some(DeployMode::Normal)).await;
        }

        if let Err(e) = self.probe.warmup(self.config.port_for(to)).await {
            self.runtime.stop_and_remove(to).await;
            return self.fail(state, from, to, start, e, Some(DeployMode::Normal)).await;
        }

        self.logger.info("  point of no return: swapping traffic").await;

        let original = match self.proxy.swap(to).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.runtime.stop_and_remove(to).await;
                return self.fail(state, from, to, start, e, Some(DeployMode::Normal)).await;
            }
        };

        tokio::time::sleep(Duration::from_secs(self.config.drain_seconds)).await;

        if !self.verify_traffic().await {
            self.proxy.restore(&original).await.ok();
            self.runtime.stop_and_remove(to).await;
            let err = DeploymentError::Verification("post-swap traffic verification failed".to_string());
            return self.fail(state, from, to, start, err, Some(DeployMode::Normal)).await;
        }

        self.runtime.stop_and_remove(from).await;

        state.swap_colors();
        state.deployment_count += 1;
        state.last_deployment = Some(Utc::now());
        state.clear_prewarm();
        state.push_history(Self::history_entry(
            from,
            to,
            start.elapsed(),
            true,
            None,
            false,
            Some(DeployMode::Normal),
        ));
        let deployment_count = state.deployment_count;
        self.store.save(&state).await?;

        self.logger
            .info(&format!(
                "[{run_id}] deploy complete in {:.1}s",
                start.elapsed().as_secs_f64()
            ))
            .await;

        Ok(DeployOutcome {
            from,
            to,
            deployment_count,
            duration: start.elapsed(),
        })
    }

    /// Warm the standby without touching traffic: spec.md §4.5.2.
    pub async fn prewarm(&self) -> Result<PrewarmOutcome> {
        let mut state = self.store.load().await?;
        let standby = state.standby_color;

        self.preflight(&state).await?;

        if state.standby_prewarmed {
            let running = self.runtime.is_running(standby).await.unwrap_or(false);
            if running {
                let healthy = self
                    .probe
                    .quick_check(self.config.port_for(standby), Duration::from_secs(5))
                    .await;
                if healthy {
                    self.logger.info(&format!("  {standby} already warm")).await;
                    return Ok(PrewarmOutcome {
                        already_warm: true,
                        standby_color: standby,
                        container_id: state.standby_container_id.clone().unwrap_or_default(),
                    });
                }
            }
            self.runtime.stop_and_remove(standby).await;
            state.clear_prewarm();
        }

        if let Err(e) = self.start_standby(standby).await {
            state.clear_prewarm();
            self.store.save(&state).await.ok();
            return Err(e);
        }

        let ready = self
            .probe
            .wait_ready(self.config.port_for(standby), Duration::from_secs(300), Duration::from_secs(3))
            .await;
        if !ready {
            self.runtime.stop_and_remove(standby).await;
            state.clear_prewarm();
            self.store.save(&state).await.ok();
            return Err(DeploymentError::HealthTimeout(format!(
                "{standby} did not become ready within 300s"
            )));
        }

        if let Err(e) = self.probe.warmup(self.config.port_for(standby)).await {
            self.runtime.stop_and_remove(standby).await;
            state.clear_prewarm();
            self.store.save(&state).await.ok();
            return Err(e);
        }

        let container_id = self
            .runtime
            .container_id(standby)
            .await
            .map_err(|e| DeploymentError::ContainerStart(e.to_string()))?;

        state.standby_prewarmed = true;
        state.standby_prewarmed_at = Some(Utc::now());
        state.standby_container_id = Some(container_id.clone());
        self.store.save(&state).await?;

        self.logger
            .info(&format!("  {standby} pre-warmed ({container_id})"))
            .await;

        Ok(PrewarmOutcome {
            already_warm: false,
            standby_color: standby,
            container_id,
        })
    }

    /// Swap using a pre-warmed standby: spec.md §4.5.3.
    pub async fn deploy_fast(&self) -> Result<DeployOutcome> {
        let start = Instant::now();
        let mut state = self.store.load().await?;
        let from = state.active_color;
        let to = state.standby_color;

        if !state.standby_prewarmed {
            let err = DeploymentError::StateMismatch("standby is not pre-warmed; run prewarm first".to_string());
            return self.fail(state, from, to, start, err, Some(DeployMode::Fast)).await;
        }

        if let Some(at) = state.standby_prewarmed_at {
            let age_minutes = Utc::now().signed_duration_since(at).num_minutes();
            self.logger.info(&format!("  pre-warm age: {age_minutes}m")).await;
            if age_minutes > PREWARM_STALE_MINUTES {
                self.logger
                    .warn(&format!("  pre-warm is {age_minutes}m old, continuing anyway"))
                    .await;
            }
        }

        let running = self.runtime.is_running(to).await.unwrap_or(false);
        if !running {
            state.clear_prewarm();
            let err = DeploymentError::StateMismatch(format!("{to} is not running any more; run prewarm again"));
            return self.fail(state, from, to, start, err, Some(DeployMode::Fast)).await;
        }

        let current_id = self
            .runtime
            .container_id(to)
            .await
            .map_err(|e| DeploymentError::StateMismatch(e.to_string()))?;
        if Some(&current_id) != state.standby_container_id.as_ref() {
            let err = DeploymentError::StateMismatch(format!(
                "{to}'s container id no longer matches the pre-warmed one; run prewarm again"
            ));
            return self.fail(state, from, to, start, err, Some(DeployMode::Fast)).await;
        }

        if !self
            .probe
            .quick_check(self.config.port_for(to), Duration::from_secs(30))
            .await
        {
            let err = DeploymentError::HealthTimeout(format!("{to} failed quick check"));
            return self.fail(state, from, to, start, err, Some(DeployMode::Fast)).await;
        }

        if let Err(e) = self.probe.warmup(self.config.port_for(to)).await {
            return self.fail(state, from, to, start, e, Some(DeployMode::Fast)).await;
        }

        self.logger.info("  point of no return: swapping traffic").await;

        let original = match self.proxy.swap(to).await {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(state, from, to, start, e, Some(DeployMode::Fast)).await,
        };

        tokio::time::sleep(Duration::from_secs(self.config.drain_seconds)).await;

        if !self.verify_traffic().await {
            self.proxy.restore(&original).await.ok();
            let err = DeploymentError::Verification("post-swap traffic verification failed".to_string());
            return self.fail(state, from, to, start, err, Some(DeployMode::Fast)).await;
        }

        self.runtime.stop_and_remove(from).await;

        state.swap_colors();
        state.deployment_count += 1;
        state.last_deployment = Some(Utc::now());
        state.clear_prewarm();
        state.push_history(Self::history_entry(
            from,
            to,
            start.elapsed(),
            true,
            None,
            false,
            Some(DeployMode::Fast),
        ));
        let deployment_count = state.deployment_count;
        self.store.save(&state).await?;

        Ok(DeployOutcome {
            from,
            to,
            deployment_count,
            duration: start.elapsed(),
        })
    }

    /// Swap traffic back to the current standby color: spec.md §4.5.4.
    pub async fn rollback(&self) -> Result<RollbackOutcome> {
        let start = Instant::now();
        let mut state = self.store.load().await?;
        let from = state.active_color;
        let to = state.standby_color;

        let running = self
            .runtime
            .is_running(to)
            .await
            .map_err(|e| DeploymentError::ContainerStart(e.to_string()))?;
        if !running {
            self.runtime
                .start(to)
                .await
                .map_err(|e| DeploymentError::ContainerStart(e.to_string()))?;
            let ready = self
                .probe
                .wait_ready(self.config.port_for(to), Duration::from_secs(60), Duration::from_secs(2))
                .await;
            if !ready {
                let err = DeploymentError::HealthTimeout(format!("{to} did not become ready within 60s"));
                state.push_history(Self::history_entry(from, to, start.elapsed(), false, Some(&err), true, None));
                self.store.save(&state).await.ok();
                return Err(err);
            }
        }

        let _original = match self.proxy.swap(to).await {
            Ok(bytes) => bytes,
            Err(e) => {
                state.push_history(Self::history_entry(from, to, start.elapsed(), false, Some(&e), true, None));
                self.store.save(&state).await.ok();
                return Err(e);
            }
        };

        tokio::time::sleep(Duration::from_secs(self.config.drain_seconds)).await;

        let verified = self.verify_traffic().await;
        if !verified {
            self.logger
                .warn("  rollback traffic verification failed; proxy already reloaded, state updated to reflect reality")
                .await;
        }

        state.swap_colors();
        state.deployment_count += 1;
        state.last_deployment = Some(Utc::now());
        state.clear_prewarm();
        state.push_history(Self::history_entry(from, to, start.elapsed(), true, None, true, None));
        self.store.save(&state).await?;

        Ok(RollbackOutcome {
            from,
            to,
            traffic_verified: verified,
        })
    }

    /// Current state plus live reality, for the `status` subcommand.
    pub async fn status(&self) -> Result<StatusView> {
        let state = self.store.load().await?;
        let active_running = self.runtime.is_running(state.active_color).await.unwrap_or(false);
        let standby_running = self.runtime.is_running(state.standby_color).await.unwrap_or(false);
        let standby_healthy = if state.standby_prewarmed {
            Some(
                self.probe
                    .quick_check(self.config.port_for(state.standby_color), Duration::from_secs(5))
                    .await,
            )
        } else {
            None
        };
        Ok(StatusView {
            state,
            active_running,
            standby_running,
            standby_healthy,
        })
    }

    /// Bounded history, most recent first, for the `history` subcommand.
    pub async fn history(&self) -> Result<Vec<HistoryEntry>> {
        let state = self.store.load().await?;
        Ok(state.history.into_iter().rev().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHealthClient, FakeRuntime};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config::new(dir.path())
    }

    async fn seed_nginx(config: &Config) {
        tokio::fs::create_dir_all(config.nginx_conf_dir()).await.unwrap();
        tokio::fs::write(config.active_nginx_conf(), b"upstream blue\n").await.unwrap();
        tokio::fs::write(config.upstream_template(Color::Blue), b"upstream blue\n")
            .await
            .unwrap();
        tokio::fs::write(config.upstream_template(Color::Green), b"upstream green\n")
            .await
            .unwrap();
    }

    fn engine_with(config: Config, runtime: FakeRuntime, http: FakeHealthClient) -> Engine {
        Engine::new(config, Arc::new(runtime), Arc::new(http))
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_first_deploy_promotes_green_and_records_history() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        seed_nginx(&config).await;

        let runtime = FakeRuntime::new().with_running(Color::Blue, true).with_running(Color::Green, false);
        let http = FakeHealthClient::new().ready_immediately();
        let engine = engine_with(config.clone(), runtime, http);

        let outcome = engine.deploy().await.unwrap();
        assert_eq!(outcome.from, Color::Blue);
        assert_eq!(outcome.to, Color::Green);
        assert_eq!(outcome.deployment_count, 1);

        let state = engine.store.load().await.unwrap();
        assert_eq!(state.active_color, Color::Green);
        assert_eq!(state.history.len(), 1);
        assert!(state.history[0].success);
        assert_eq!(state.history[0].mode, Some(DeployMode::Normal));
    }

    #[tokio::test(start_paused = true)]
    async fn round_trip_two_deploys_returns_to_starting_color() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        seed_nginx(&config).await;

        let runtime = FakeRuntime::new().with_running(Color::Blue, true);
        let http = FakeHealthClient::new().ready_immediately();
        let engine = engine_with(config.clone(), runtime, http);

        engine.deploy().await.unwrap();
        let second = engine.deploy().await.unwrap();

        assert_eq!(second.from, Color::Green);
        assert_eq!(second.to, Color::Blue);

        let state = engine.store.load().await.unwrap();
        assert_eq!(state.active_color, Color::Blue);
        assert_eq!(state.deployment_count, 2);
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[1].from_color, Color::Green);
        assert_eq!(state.history[1].to_color, Color::Blue);
    }

    #[tokio::test(start_paused = true)]
    async fn prewarm_then_fast_deploy_matches_a_single_deploy_end_state() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        seed_nginx(&config).await;

        let runtime = FakeRuntime::new().with_running(Color::Blue, true);
        let http = FakeHealthClient::new().ready_immediately();
        let engine = engine_with(config.clone(), runtime, http);

        let warm = engine.prewarm().await.unwrap();
        assert!(!warm.already_warm);
        assert_eq!(warm.standby_color, Color::Green);

        let state = engine.store.load().await.unwrap();
        assert!(state.standby_prewarmed);
        assert!(state.standby_container_id.is_some());

        let fast = engine.deploy_fast().await.unwrap();
        assert_eq!(fast.to, Color::Green);

        let state = engine.store.load().await.unwrap();
        assert_eq!(state.active_color, Color::Green);
        assert!(!state.standby_prewarmed);
        assert_eq!(state.history.back().unwrap().mode, Some(DeployMode::Fast));
    }

    #[tokio::test(start_paused = true)]
    async fn deploy_restores_and_fails_on_swap_rejection() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        seed_nginx(&config).await;

        let runtime = FakeRuntime::new()
            .with_running(Color::Blue, true)
            .failing_exec_times(1);
        let http = FakeHealthClient::new().ready_immediately();
        let engine = engine_with(config.clone(), runtime, http);

        let err = engine.deploy().await.unwrap_err();
        assert_eq!(err.kind(), "ProxyConfigError");

        let on_disk = tokio::fs::read(config.active_nginx_conf()).await.unwrap();
        assert_eq!(on_disk, b"upstream blue\n");

        let state = engine.store.load().await.unwrap();
        assert_eq!(state.active_color, Color::Blue);
        assert_eq!(state.history.len(), 1);
        assert!(!state.history[0].success);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_prewarm_fails_deploy_fast_cleanly() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        seed_nginx(&config).await;

        let runtime = Arc::new(FakeRuntime::new().with_running(Color::Blue, true));
        let http = Arc::new(FakeHealthClient::new().ready_immediately());
        let engine = Engine::new(config.clone(), runtime.clone(), http);

        engine.prewarm().await.unwrap();
        runtime.force_stop(Color::Green);

        let err = engine.deploy_fast().await.unwrap_err();
        assert_eq!(err.kind(), "StateMismatchError");

        let state = engine.store.load().await.unwrap();
        assert_eq!(state.active_color, Color::Blue);
        assert!(!state.standby_prewarmed);
        assert_eq!(state.history.len(), 1);
        assert!(!state.history[0].success);
    }

    #[tokio::test(start_paused = true)]
    async fn prewarm_twice_is_already_warm_without_restarting() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        seed_nginx(&config).await;

        let runtime = Arc::new(FakeRuntime::new().with_running(Color::Blue, true));
        let http = Arc::new(FakeHealthClient::new().ready_immediately());
        let engine = Engine::new(config.clone(), runtime.clone(), http);

        let first = engine.prewarm().await.unwrap();
        assert!(!first.already_warm);
        assert_eq!(runtime.start_call_count(Color::Green), 1);

        let second = engine.prewarm().await.unwrap();
        assert!(second.already_warm);
        assert_eq!(second.container_id, first.container_id);
        assert_eq!(runtime.start_call_count(Color::Green), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_swaps_back_and_marks_history_as_rollback() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        seed_nginx(&config).await;

        let runtime = FakeRuntime::new().with_running(Color::Blue, true);
        let http = FakeHealthClient::new().ready_immediately();
        let engine = engine_with(config.clone(), runtime, http);

        engine.deploy().await.unwrap();
        let outcome = engine.rollback().await.unwrap();
        assert_eq!(outcome.from, Color::Green);
        assert_eq!(outcome.to, Color::Blue);
        assert!(outcome.traffic_verified);

        let state = engine.store.load().await.unwrap();
        assert_eq!(state.active_color, Color::Blue);
        assert!(state.history.back().unwrap().rollback);
    }
}
