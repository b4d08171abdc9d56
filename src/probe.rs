//! Replica Probe: queries a replica's readiness and chat endpoints, plus
//! container-runtime identity lookups (spec.md §4.2).
//!
//! HTTP access goes through the `HealthClient` trait (the teacher's
//! `HealthCheckClient` / `IsahcHealthCheckClient` split in
//! `core/network/proxy_health/client.rs`), so tests can substitute
//! `crate::testing::FakeHealthClient` without a real replica.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;

use crate::color::Color;
use crate::error::{DeploymentError, Result};
use crate::logging::Logger;
use crate::runtime::ContainerRuntime;

#[derive(Debug, Clone)]
pub struct HttpOutcome {
    pub status: u16,
    pub body: Vec<u8>,
}

/// HTTP client abstraction for dependency injection and testing.
#[async_trait]
pub trait HealthClient: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> std::result::Result<HttpOutcome, String>;
    async fn post_json(
        &self,
        url: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> std::result::Result<HttpOutcome, String>;
}

/// Production client backed by isahc.
pub struct IsahcHealthClient {
    client: isahc::HttpClient,
}

impl IsahcHealthClient {
    pub fn new() -> std::result::Result<Self, String> {
        let client = isahc::HttpClient::new().map_err(|e| e.to_string())?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthClient for IsahcHealthClient {
    async fn get(&self, url: &str, timeout: Duration) -> std::result::Result<HttpOutcome, String> {
        use isahc::{AsyncReadResponseExt, Request};
        let request = Request::get(url)
            .timeout(timeout)
            .body(())
            .map_err(|e| e.to_string())?;
        let mut response = self.client.send_async(request).await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| e.to_string())?.to_vec();
        Ok(HttpOutcome { status, body })
    }

    async fn post_json(
        &self,
        url: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> std::result::Result<HttpOutcome, String> {
        use isahc::{AsyncReadResponseExt, Request};
        let request = Request::post(url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .body(body)
            .map_err(|e| e.to_string())?;
        let mut response = self.client.send_async(request).await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let response_body = response.bytes().await.map_err(|e| e.to_string())?.to_vec();
        Ok(HttpOutcome {
            status,
            body: response_body,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ReadyBody {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthzBody {
    status: String,
}

const WARMUP_MAX_TOKENS: u32 = 10;
const WARMUP_PROMPT: &str = "Hello, respond in one word.";

pub struct ReplicaProbe {
    http: Arc<dyn HealthClient>,
    runtime: Arc<dyn ContainerRuntime>,
    logger: Logger,
}

impl ReplicaProbe {
    pub fn new(http: Arc<dyn HealthClient>, runtime: Arc<dyn ContainerRuntime>, logger: Logger) -> Self {
        Self { http, runtime, logger }
    }

    /// Poll `/ready` until it reports `status: "ready"` or `timeout` elapses.
    /// Non-JSON or non-ready bodies count as a failed poll, not a hard error.
    pub async fn wait_ready(&self, port: u16, timeout: Duration, poll_interval: Duration) -> bool {
        let url = format!("http://localhost:{port}/ready");
        let start = Instant::now();
        let mut attempts = 0u32;

        while start.elapsed() < timeout {
            attempts += 1;
            let per_attempt_timeout = Duration::from_secs(25).min(timeout);
            match self.http.get(&url, per_attempt_timeout).await {
                Ok(outcome) if outcome.status == 200 => {
                    match serde_json::from_slice::<ReadyBody>(&outcome.body) {
                        Ok(body) if body.status == "ready" => {
                            self.logger
                                .info(&format!(
                                    "  Health OK after {attempts} attempts ({:.1}s)",
                                    start.elapsed().as_secs_f64()
                                ))
                                .await;
                            return true;
                        }
                        Ok(body) => {
                            self.logger
                                .info(&format!("  Poll {attempts}: status={}", body.status))
                                .await;
                        }
                        Err(_) => {
                            self.logger.info(&format!("  Poll {attempts}: non-JSON response")).await;
                        }
                    }
                }
                Ok(outcome) => {
                    self.logger
                        .info(&format!("  Poll {attempts}: HTTP {}", outcome.status))
                        .await;
                }
                Err(e) => {
                    self.logger
                        .info(&format!("  Poll {attempts}: connection failed ({e})"))
                        .await;
                }
            }

            tokio::time::sleep(poll_interval).await;
        }

        self.logger
            .info(&format!(
                "  Health check timed out after {}s ({attempts} attempts)",
                timeout.as_secs()
            ))
            .await;
        false
    }

    /// A single probe with a short deadline, no retries.
    pub async fn quick_check(&self, port: u16, per_attempt_timeout: Duration) -> bool {
        let url = format!("http://localhost:{port}/ready");
        match self.http.get(&url, per_attempt_timeout).await {
            Ok(outcome) if outcome.status == 200 => {
                matches!(
                    serde_json::from_slice::<ReadyBody>(&outcome.body),
                    Ok(body) if body.status == "ready"
                )
            }
            _ => false,
        }
    }

    /// One inference request with a small `max_tokens` and a fixed prompt.
    pub async fn warmup(&self, port: u16) -> Result<()> {
        let url = format!("http://localhost:{port}/chat");
        let payload = serde_json::json!({
            "message": WARMUP_PROMPT,
            "max_tokens": WARMUP_MAX_TOKENS,
        });
        let body = serde_json::to_vec(&payload).map_err(|e| DeploymentError::Warmup(e.to_string()))?;

        let start = Instant::now();
        let outcome = self
            .http
            .post_json(&url, body, Duration::from_secs(30))
            .await
            .map_err(DeploymentError::Warmup)?;

        if !(200..300).contains(&outcome.status) {
            return Err(DeploymentError::Warmup(format!(
                "warm-up inference failed (status={})",
                outcome.status
            )));
        }

        let parsed: ChatBody = serde_json::from_slice(&outcome.body)
            .map_err(|e| DeploymentError::Warmup(format!("non-JSON response: {e}")))?;

        match parsed.response {
            Some(text) if !text.is_empty() => {
                self.logger
                    .info(&format!(
                        "  Warm-up OK in {:.1}s: {}...",
                        start.elapsed().as_secs_f64(),
                        text.chars().take(50).collect::<String>()
                    ))
                    .await;
                Ok(())
            }
            _ => Err(DeploymentError::Warmup(
                "response missing non-empty 'response' field".to_string(),
            )),
        }
    }

    /// Single `/healthz` probe, used to confirm end-to-end routing through
    /// the proxy (preflight, and the 3-probe post-swap verification).
    pub async fn healthz(&self, port: u16) -> bool {
        let url = format!("http://localhost:{port}/healthz");
        match self.http.get(&url, Duration::from_secs(5)).await {
            Ok(outcome) if outcome.status == 200 => {
                matches!(
                    serde_json::from_slice::<HealthzBody>(&outcome.body),
                    Ok(body) if body.status == "alive"
                )
            }
            _ => false,
        }
    }

    pub async fn is_running(&self, color: Color) -> Result<bool> {
        self.runtime.is_running(color).await
    }

    pub async fn container_id(&self, color: Color) -> Result<String> {
        self.runtime.container_id(color).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHealthClient, FakeRuntime};

    fn probe(http: FakeHealthClient) -> ReplicaProbe {
        ReplicaProbe::new(
            Arc::new(http),
            Arc::new(FakeRuntime::new()),
            Logger::new(std::env::temp_dir().join("probe-test.log")),
        )
    }

    #[tokio::test]
    async fn wait_ready_returns_true_on_first_ready_body() {
        let http = FakeHealthClient::new().ready_immediately();
        let probe = probe(http);
        assert!(
            probe
                .wait_ready(8000, Duration::from_secs(2), Duration::from_millis(10))
                .await
        );
    }

    #[tokio::test]
    async fn wait_ready_tolerates_transient_failures_then_succeeds() {
        let http = FakeHealthClient::new().ready_after(3);
        let probe = probe(http);
        assert!(
            probe
                .wait_ready(8000, Duration::from_secs(2), Duration::from_millis(5))
                .await
        );
    }

    #[tokio::test]
    async fn wait_ready_times_out_when_never_ready() {
        let http = FakeHealthClient::new().never_ready();
        let probe = probe(http);
        assert!(
            !probe
                .wait_ready(8000, Duration::from_millis(50), Duration::from_millis(10))
                .await
        );
    }

    #[tokio::test]
    async fn quick_check_single_attempt_no_retry() {
        let http = FakeHealthClient::new().never_ready();
        let probe = probe(http);
        assert!(!probe.quick_check(8000, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn warmup_succeeds_on_valid_response() {
        let http = FakeHealthClient::new().ready_immediately();
        let probe = probe(http);
        probe.warmup(8000).await.unwrap();
    }

    #[tokio::test]
    async fn warmup_fails_on_missing_response_field() {
        let http = FakeHealthClient::new().chat_missing_field();
        let probe = probe(http);
        let err = probe.warmup(8000).await.unwrap_err();
        assert_eq!(err.kind(), "WarmupError");
    }
}
