use std::process::ExitCode;
use std::sync::Arc;

use bluegreen_orchestrator::cli::{Cli, Command};
use bluegreen_orchestrator::config::Config;
use bluegreen_orchestrator::engine::Engine;
use bluegreen_orchestrator::error::DeploymentError;
use bluegreen_orchestrator::probe::IsahcHealthClient;
use bluegreen_orchestrator::runner::CommandRunner;
use bluegreen_orchestrator::runtime::ComposeRuntime;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    let mut config = Config::new(&cli.project_root);
    config.drain_seconds = cli.drain_seconds;
    config.health_timeout_secs = cli.health_timeout;

    let runner = CommandRunner::new(&config.project_root);
    let runtime = Arc::new(ComposeRuntime::new(runner, config.clone()));
    let http = match IsahcHealthClient::new() {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("failed to initialize HTTP client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let engine = Engine::new(config, runtime, http);

    let result = match cli.command {
        Command::Deploy => run_deploy(&engine).await,
        Command::DeployFast => run_deploy_fast(&engine).await,
        Command::Prewarm => run_prewarm(&engine).await,
        Command::Rollback => run_rollback(&engine).await,
        Command::Status => run_status(&engine).await,
        Command::History => run_history(&engine).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(DeploymentError::Aborted) => ExitCode::from(130),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_deploy(engine: &Engine) -> Result<(), DeploymentError> {
    let outcome = engine.deploy().await?;
    println!(
        "deployed: {} -> {} (deployment #{})",
        outcome.from, outcome.to, outcome.deployment_count
    );
    Ok(())
}

async fn run_deploy_fast(engine: &Engine) -> Result<(), DeploymentError> {
    let outcome = engine.deploy_fast().await?;
    println!(
        "fast-deployed: {} -> {} (deployment #{}) in {:.1}s",
        outcome.from,
        outcome.to,
        outcome.deployment_count,
        outcome.duration.as_secs_f64()
    );
    Ok(())
}

async fn run_prewarm(engine: &Engine) -> Result<(), DeploymentError> {
    let outcome = engine.prewarm().await?;
    if outcome.already_warm {
        println!("{} already warm ({})", outcome.standby_color, outcome.container_id);
    } else {
        println!("{} pre-warmed ({})", outcome.standby_color, outcome.container_id);
    }
    Ok(())
}

async fn run_rollback(engine: &Engine) -> Result<(), DeploymentError> {
    let outcome = engine.rollback().await?;
    println!(
        "rolled back: {} -> {} (traffic verified: {})",
        outcome.from, outcome.to, outcome.traffic_verified
    );
    Ok(())
}

async fn run_status(engine: &Engine) -> Result<(), DeploymentError> {
    let view = engine.status().await?;
    println!(
        "active:  {} (port {}, running: {})",
        view.state.active_color, view.state.active_port, view.active_running
    );
    println!(
        "standby: {} (port {}, running: {})",
        view.state.standby_color, view.state.standby_port, view.standby_running
    );
    println!("deployment count: {}", view.state.deployment_count);
    match view.state.last_deployment {
        Some(ts) => println!("last deployment:  {ts}"),
        None => println!("last deployment:  never"),
    }
    if view.state.standby_prewarmed {
        println!(
            "standby pre-warmed: yes (healthy: {})",
            view.standby_healthy.unwrap_or(false)
        );
    } else {
        println!("standby pre-warmed: no");
    }
    Ok(())
}

async fn run_history(engine: &Engine) -> Result<(), DeploymentError> {
    let entries = engine.history().await?;
    if entries.is_empty() {
        println!("no deployment history yet");
        return Ok(());
    }
    for entry in entries {
        let outcome = if entry.success { "ok" } else { "failed" };
        let kind = if entry.rollback {
            "rollback".to_string()
        } else {
            entry
                .mode
                .map(|m| format!("{m:?}").to_lowercase())
                .unwrap_or_else(|| "deploy".to_string())
        };
        println!(
            "{}  {} -> {}  {}  {}  {:.1}s{}",
            entry.timestamp,
            entry.from_color,
            entry.to_color,
            kind,
            outcome,
            entry.duration_seconds,
            entry.error.map(|e| format!("  ({e})")).unwrap_or_default()
        );
    }
    Ok(())
}
