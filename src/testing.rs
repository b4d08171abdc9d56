//! In-memory fakes for the two external collaborators (container runtime,
//! HTTP health client), so the Deployment Engine's state machine can be
//! exercised deterministically -- grounded in the teacher's
//! `MockHealthCheckClient` / `MockHttpClient` pattern
//! (`core/network/proxy_health/client.rs`, `core/network/http_monitor.rs`),
//! generalized here to cover the container runtime side the teacher has
//! no equivalent for.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::color::Color;
use crate::error::{DeploymentError, Result};
use crate::probe::{HealthClient, HttpOutcome};
use crate::runtime::ContainerRuntime;

/// Fake container runtime. Builder methods consume and return `Self` for
/// setup; plain `&self` methods are used to inspect call history once the
/// fake has been handed to an `Engine` as `Arc<dyn ContainerRuntime>`.
pub struct FakeRuntime {
    running: Mutex<HashMap<Color, bool>>,
    container_ids: Mutex<HashMap<Color, String>>,
    proxy_running: Mutex<bool>,
    fail_start: Mutex<HashSet<Color>>,
    fail_exec_remaining: Mutex<u32>,
    start_calls: Mutex<Vec<Color>>,
    stop_calls: Mutex<Vec<Color>>,
    next_id: AtomicU32,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
            container_ids: Mutex::new(HashMap::new()),
            proxy_running: Mutex::new(true),
            fail_start: Mutex::new(HashSet::new()),
            fail_exec_remaining: Mutex::new(0),
            start_calls: Mutex::new(Vec::new()),
            stop_calls: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn with_running(self, color: Color, running: bool) -> Self {
        self.running.lock().unwrap().insert(color, running);
        if running {
            let id = format!("fake-container-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.container_ids.lock().unwrap().insert(color, id);
        }
        self
    }

    pub fn with_container_id(self, color: Color, id: impl Into<String>) -> Self {
        self.container_ids.lock().unwrap().insert(color, id.into());
        self
    }

    pub fn with_proxy_running(self, running: bool) -> Self {
        *self.proxy_running.lock().unwrap() = running;
        self
    }

    pub fn failing_start(self, color: Color) -> Self {
        self.fail_start.lock().unwrap().insert(color);
        self
    }

    pub fn failing_exec_times(self, n: u32) -> Self {
        *self.fail_exec_remaining.lock().unwrap() = n;
        self
    }

    pub fn start_call_count(&self, color: Color) -> usize {
        self.start_calls.lock().unwrap().iter().filter(|c| **c == color).count()
    }

    pub fn stop_call_count(&self, color: Color) -> usize {
        self.stop_calls.lock().unwrap().iter().filter(|c| **c == color).count()
    }

    pub fn container_id_of(&self, color: Color) -> Option<String> {
        self.container_ids.lock().unwrap().get(&color).cloned()
    }

    /// Simulate an external actor killing a container between calls
    /// (e.g. OOM), without going through `stop_and_remove`.
    pub fn force_stop(&self, color: Color) {
        self.running.lock().unwrap().insert(color, false);
        self.container_ids.lock().unwrap().remove(&color);
    }

    /// Simulate a container getting recreated: still running, new id.
    pub fn recreate(&self, color: Color) {
        let id = format!("fake-container-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.running.lock().unwrap().insert(color, true);
        self.container_ids.lock().unwrap().insert(color, id);
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, color: Color) -> Result<()> {
        self.start_calls.lock().unwrap().push(color);
        if self.fail_start.lock().unwrap().contains(&color) {
            return Err(DeploymentError::ContainerStart(format!(
                "fake: {color} failed to start"
            )));
        }
        self.running.lock().unwrap().insert(color, true);
        let id = format!("fake-container-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.container_ids.lock().unwrap().insert(color, id);
        Ok(())
    }

    async fn stop_and_remove(&self, color: Color) {
        self.stop_calls.lock().unwrap().push(color);
        self.running.lock().unwrap().insert(color, false);
        self.container_ids.lock().unwrap().remove(&color);
    }

    async fn is_running(&self, color: Color) -> Result<bool> {
        Ok(*self.running.lock().unwrap().get(&color).unwrap_or(&false))
    }

    async fn container_id(&self, color: Color) -> Result<String> {
        self.container_ids
            .lock()
            .unwrap()
            .get(&color)
            .cloned()
            .ok_or_else(|| DeploymentError::Command {
                command: format!("docker inspect {color}"),
                stderr: "no such container".to_string(),
            })
    }

    async fn tail_logs(&self, color: Color, _lines: u32) -> String {
        format!("<fake logs for {color}>")
    }

    async fn proxy_running(&self) -> Result<bool> {
        Ok(*self.proxy_running.lock().unwrap())
    }

    async fn exec_in_proxy(&self, args: &[&str]) -> Result<()> {
        let mut remaining = self.fail_exec_remaining.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return if args.contains(&"-t") {
                Err(DeploymentError::ProxyConfig("fake: config test failed".to_string()))
            } else {
                Err(DeploymentError::ProxyReload("fake: reload failed".to_string()))
            };
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum ReadyThreshold {
    Never,
    AtAttempt(u32),
}

/// Fake HTTP client for the Replica Probe. `/ready` becomes ready at a
/// configurable attempt number (or never); `/chat` succeeds with a
/// canned response unless configured to omit the `response` field.
pub struct FakeHealthClient {
    ready_threshold: ReadyThreshold,
    chat_ok: bool,
    attempts: AtomicU32,
}

impl FakeHealthClient {
    pub fn new() -> Self {
        Self {
            ready_threshold: ReadyThreshold::AtAttempt(1),
            chat_ok: true,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn ready_immediately(mut self) -> Self {
        self.ready_threshold = ReadyThreshold::AtAttempt(1);
        self
    }

    pub fn ready_after(mut self, attempt: u32) -> Self {
        self.ready_threshold = ReadyThreshold::AtAttempt(attempt);
        self
    }

    pub fn never_ready(mut self) -> Self {
        self.ready_threshold = ReadyThreshold::Never;
        self
    }

    pub fn chat_missing_field(mut self) -> Self {
        self.chat_ok = false;
        self
    }
}

impl Default for FakeHealthClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthClient for FakeHealthClient {
    async fn get(&self, url: &str, _timeout: Duration) -> std::result::Result<HttpOutcome, String> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let ready = match self.ready_threshold {
            ReadyThreshold::Never => false,
            ReadyThreshold::AtAttempt(n) => attempt >= n,
        };

        if url.ends_with("/healthz") {
            let body = if ready {
                br#"{"status":"alive"}"#.to_vec()
            } else {
                br#"{"status":"unreachable"}"#.to_vec()
            };
            return Ok(HttpOutcome {
                status: if ready { 200 } else { 503 },
                body,
            });
        }

        let body = if ready {
            br#"{"status":"ready"}"#.to_vec()
        } else {
            br#"{"status":"not_ready","reason":"loading"}"#.to_vec()
        };
        Ok(HttpOutcome {
            status: if ready { 200 } else { 503 },
            body,
        })
    }

    async fn post_json(
        &self,
        _url: &str,
        _body: Vec<u8>,
        _timeout: Duration,
    ) -> std::result::Result<HttpOutcome, String> {
        let body = if self.chat_ok {
            br#"{"response":"ok","tokens_generated":1,"inference_ms":5.0}"#.to_vec()
        } else {
            br#"{"tokens_generated":1}"#.to_vec()
        };
        Ok(HttpOutcome { status: 200, body })
    }
}
