//! State Store: the durable `DeploymentState` document (spec.md §3, §4.4,
//! §6.4). Reads initialize defaults on absence and persist them immediately,
//! so a concurrent `status` right after never observes a different default
//! than a concurrent `deploy` would. Writes go to a temp sibling, then
//! rename over the target, after copying the previous file to `.bak` --
//! grounded in the teacher's `write_state_atomic` (`core/network/http_monitor.rs`)
//! and the original's `save_state` (`deploy/orchestrator.py`).

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::color::Color;
use crate::config::Config;
use crate::error::{DeploymentError, Result};

const MAX_HISTORY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    Normal,
    Fast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub from_color: Color,
    pub to_color: Color,
    pub duration_seconds: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub rollback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<DeployMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    pub active_color: Color,
    pub standby_color: Color,
    pub active_port: u16,
    pub standby_port: u16,
    #[serde(default)]
    pub last_deployment: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_model_version: String,
    #[serde(default)]
    pub deployment_count: u64,
    #[serde(default)]
    pub standby_prewarmed: bool,
    #[serde(default)]
    pub standby_prewarmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub standby_container_id: Option<String>,
    #[serde(default)]
    pub history: VecDeque<HistoryEntry>,
}

impl DeploymentState {
    fn default_for(config: &Config) -> Self {
        Self {
            active_color: Color::Blue,
            standby_color: Color::Green,
            active_port: config.port_for(Color::Blue),
            standby_port: config.port_for(Color::Green),
            last_deployment: None,
            last_model_version: String::new(),
            deployment_count: 0,
            standby_prewarmed: false,
            standby_prewarmed_at: None,
            standby_container_id: None,
            history: VecDeque::new(),
        }
    }

    /// Swap active/standby color and port assignment in place.
    pub fn swap_colors(&mut self) {
        std::mem::swap(&mut self.active_color, &mut self.standby_color);
        std::mem::swap(&mut self.active_port, &mut self.standby_port);
    }

    /// Append a history entry, evicting the oldest once over `MAX_HISTORY`.
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push_back(entry);
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }

    pub fn clear_prewarm(&mut self) {
        self.standby_prewarmed = false;
        self.standby_prewarmed_at = None;
        self.standby_container_id = None;
    }
}

pub struct StateStore {
    config: Config,
}

impl StateStore {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Load the state document, creating and persisting defaults on first
    /// read. Never returns a transient in-memory default without writing it.
    pub async fn load(&self) -> Result<DeploymentState> {
        let path = self.config.state_file();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| DeploymentError::State(format!("corrupt state.json: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let state = DeploymentState::default_for(&self.config);
                self.save(&state).await?;
                Ok(state)
            }
            Err(e) => Err(DeploymentError::State(e.to_string())),
        }
    }

    /// Atomically persist `state`: back up the previous file to `.bak`,
    /// write the new document to a temp sibling, then rename over target.
    pub async fn save(&self, state: &DeploymentState) -> Result<()> {
        let path = self.config.state_file();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DeploymentError::State(e.to_string()))?;
        }

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::copy(&path, self.config.state_backup_file())
                .await
                .map_err(|e| DeploymentError::State(format!("backing up state.json: {e}")))?;
        }

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        state
            .serialize(&mut serializer)
            .map_err(|e| DeploymentError::State(e.to_string()))?;
        let mut serialized = String::from_utf8(buf).map_err(|e| DeploymentError::State(e.to_string()))?;
        serialized.push('\n');

        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| DeploymentError::State(e.to_string()))?;
        file.write_all(serialized.as_bytes())
            .await
            .map_err(|e| DeploymentError::State(e.to_string()))?;
        file.flush().await.map_err(|e| DeploymentError::State(e.to_string()))?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| DeploymentError::State(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn load_creates_and_persists_defaults_on_absence() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path());
        let store = StateStore::new(config.clone());

        let state = store.load().await.unwrap();
        assert_eq!(state.active_color, Color::Blue);
        assert!(tokio::fs::try_exists(config.state_file()).await.unwrap());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path());
        let store = StateStore::new(config);

        let mut state = store.load().await.unwrap();
        state.deployment_count = 3;
        state.swap_colors();
        store.save(&state).await.unwrap();

        let reloaded = store.load().await.unwrap();
        assert_eq!(reloaded.deployment_count, 3);
        assert_eq!(reloaded.active_color, Color::Green);
    }

    #[tokio::test]
    async fn save_writes_four_space_indent() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path());
        let store = StateStore::new(config.clone());

        let state = store.load().await.unwrap();
        store.save(&state).await.unwrap();

        let raw = tokio::fs::read_to_string(config.state_file()).await.unwrap();
        let second_line = raw.lines().nth(1).unwrap();
        assert!(second_line.starts_with("    \""), "expected 4-space indent, got {second_line:?}");
    }

    #[tokio::test]
    async fn save_backs_up_previous_file() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path());
        let store = StateStore::new(config.clone());

        let mut state = store.load().await.unwrap();
        store.save(&state).await.unwrap();
        state.deployment_count = 1;
        store.save(&state).await.unwrap();

        let backup = tokio::fs::read_to_string(config.state_backup_file()).await.unwrap();
        let parsed: DeploymentState = serde_json::from_str(&backup).unwrap();
        assert_eq!(parsed.deployment_count, 0);
    }

    #[test]
    fn history_is_capped_at_max() {
        let mut state = DeploymentState::default_for(&Config::new("."));
        for _ in 0..25 {
            state.push_history(HistoryEntry {
                timestamp: Utc::now(),
                from_color: Color::Blue,
                to_color: Color::Green,
                duration_seconds: 1.0,
                success: true,
                error: None,
                rollback: false,
                mode: Some(DeployMode::Normal),
            });
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
    }
}
