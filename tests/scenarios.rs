//! End-to-end scenarios against the public API, driven entirely by fakes
//! under a temporary project root -- no Docker or nginx required. Covers
//! the seeded scenarios: continuous-probe zero-drop during back-to-back
//! deploys, and CLI flag parsing for the subcommand surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bluegreen_orchestrator::cli::{Cli, Command};
use bluegreen_orchestrator::color::Color;
use bluegreen_orchestrator::config::Config;
use bluegreen_orchestrator::engine::Engine;
use bluegreen_orchestrator::probe::HealthClient;
use bluegreen_orchestrator::testing::{FakeHealthClient, FakeRuntime};
use clap::Parser;
use tempfile::TempDir;

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

#[tokio::test(start_paused = true)]
async fn continuous_probe_sees_zero_failures_across_two_deploys() {
    let dir = TempDir::new().unwrap();
    let config = Config::new(dir.path());
    seed_nginx(&config).await;

    let runtime = Arc::new(FakeRuntime::new().with_running(Color::Blue, true));
    let http = Arc::new(FakeHealthClient::new().ready_immediately());
    let engine = Engine::new(config, runtime, http.clone());

    let probe_failures = Arc::new(AtomicU32::new(0));
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let prober = {
        let http = http.clone();
        let probe_failures = probe_failures.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            while !stop.load(Ordering::Relaxed) {
                match http.get("http://localhost:80/healthz", Duration::from_secs(1)).await {
                    Ok(outcome) if outcome.status == 200 => {}
                    _ => {
                        probe_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        })
    };

    engine.deploy().await.unwrap();
    engine.deploy().await.unwrap();

    stop.store(true, Ordering::Relaxed);
    prober.await.unwrap();

    assert_eq!(probe_failures.load(Ordering::Relaxed), 0);
}

#[test]
fn cli_parses_every_subcommand() {
    for (args, expect_project_root) in [
        (vec!["bgdeploy", "deploy"], "."),
        (vec!["bgdeploy", "deploy-fast"], "."),
        (vec!["bgdeploy", "prewarm"], "."),
        (vec!["bgdeploy", "rollback"], "."),
        (vec!["bgdeploy", "status"], "."),
        (vec!["bgdeploy", "history"], "."),
        (vec!["bgdeploy", "--project-root", "/srv/app", "deploy"], "/srv/app"),
    ] {
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.project_root, expect_project_root);
        match cli.command {
            Command::Deploy
            | Command::DeployFast
            | Command::Prewarm
            | Command::Rollback
            | Command::Status
            | Command::History => {}
        }
    }
}

#[test]
fn cli_rejects_unknown_subcommand() {
    assert!(Cli::try_parse_from(["bgdeploy", "nonsense"]).is_err());
}

#[test]
fn cli_applies_drain_and_health_timeout_flags() {
    let cli = Cli::try_parse_from([
        "bgdeploy",
        "--drain-seconds",
        "5",
        "--health-timeout",
        "60",
        "deploy",
    ])
    .unwrap();
    assert_eq!(cli.drain_seconds, 5);
    assert_eq!(cli.health_timeout, 60);
}
