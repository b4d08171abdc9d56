//! Structured JSON-lines logging to `deploy/deploy.log`, with a terser
//! line echoed to stdout -- mirrors the teacher's dual stdout/file handler
//! split (`debug_logger.rs`'s `RotatingLogger`), simplified to the fields
//! spec.md §6.4 asks for: `{time, level, msg}`. No rotation/compression --
//! the spec never asks for it and deploy.log is bounded by deploy cadence,
//! not by request volume.

use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Serialize)]
struct LogLine<'a> {
    time: String,
    level: &'a str,
    msg: &'a str,
}

#[derive(Debug, Clone)]
pub struct Logger {
    log_file: PathBuf,
}

impl Logger {
    pub fn new(log_file: PathBuf) -> Self {
        Self { log_file }
    }

    pub async fn log(&self, level: &str, msg: &str) {
        self.print_to_stdout(level, msg);
        if let Err(e) = self.append(level, msg).await {
            eprintln!("  (failed to write deploy.log: {e})");
        }
    }

    pub async fn info(&self, msg: &str) {
        self.log("INFO", msg).await;
    }

    pub async fn debug(&self, msg: &str) {
        self.log("DEBUG", msg).await;
    }

    pub async fn warn(&self, msg: &str) {
        self.log("WARNING", msg).await;
    }

    pub async fn error(&self, msg: &str) {
        self.log("ERROR", msg).await;
    }

    pub async fn critical(&self, msg: &str) {
        self.log("CRITICAL", msg).await;
    }

    fn print_to_stdout(&self, level: &str, msg: &str) {
        if level == "DEBUG" {
            return;
        }
        let now = Utc::now().format("%H:%M:%S");
        println!("{now} [{level}] {msg}");
    }

    async fn append(&self, level: &str, msg: &str) -> std::io::Result<()> {
        if let Some(parent) = self.log_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let line = LogLine {
            time: Utc::now().to_rfc3339(),
            level,
            msg,
        };
        let mut serialized =
            serde_json::to_string(&line).unwrap_or_else(|_| "{\"msg\":\"<unserializable>\"}".into());
        serialized.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .await?;
        file.write_all(serialized.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_one_json_line_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Logger::new(dir.path().join("deploy.log"));

        logger.info("step 1 ok").await;
        logger.error("step 2 failed").await;

        let content = tokio::fs::read_to_string(dir.path().join("deploy.log"))
            .await
            .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        for line in &lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed.get("time").is_some());
            assert!(parsed.get("level").is_some());
            assert!(parsed.get("msg").is_some());
        }
    }
}
