//! Proxy Controller: swaps the live nginx upstream between colors with a
//! validate-before-reload, restore-on-failure contract (spec.md §4.3),
//! grounded in `orchestrator.py`'s `swap_nginx` / `rollback_nginx`.

use tokio::io::AsyncWriteExt;

use crate::color::Color;
use crate::config::Config;
use crate::error::{DeploymentError, Result};
use crate::logging::Logger;
use crate::runtime::ContainerRuntime;
use std::sync::Arc;

pub struct ProxyController {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    logger: Logger,
}

impl ProxyController {
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>, logger: Logger) -> Self {
        Self { config, runtime, logger }
    }

    /// Point the active config at `target_color`. Returns the bytes the
    /// config held before the swap, so the caller can `restore` them on a
    /// later failure in the same flow.
    pub async fn swap(&self, target_color: Color) -> Result<Vec<u8>> {
        let active_path = self.config.active_nginx_conf();
        let original = tokio::fs::read(&active_path)
            .await
            .map_err(|e| DeploymentError::ProxyConfig(format!("reading current config: {e}")))?;

        let template_path = self.config.upstream_template(target_color);
        let target = tokio::fs::read(&template_path)
            .await
            .map_err(|e| DeploymentError::ProxyConfig(format!("reading {target_color} template: {e}")))?;

        self.write_conf(&active_path, &target).await?;

        if let Err(e) = self.validate().await {
            self.logger
                .error(&format!("  proxy config rejected, restoring previous: {e}"))
                .await;
            self.write_conf(&active_path, &original).await.ok();
            return Err(DeploymentError::ProxyConfig(e.to_string()));
        }

        if let Err(e) = self.reload().await {
            self.logger
                .error(&format!("  proxy reload failed, restoring previous: {e}"))
                .await;
            self.write_conf(&active_path, &original).await.ok();
            if let Err(e2) = self.reload().await {
                self.logger
                    .critical(&format!("  restore reload also failed: {e2}"))
                    .await;
            }
            return Err(DeploymentError::ProxyReload(e.to_string()));
        }

        Ok(original)
    }

    /// Restore a config previously returned by `swap`, used during an
    /// engine-level abort after the point of no return.
    pub async fn restore(&self, original_config_bytes: &[u8]) -> Result<()> {
        let active_path = self.config.active_nginx_conf();
        self.write_conf(&active_path, original_config_bytes).await?;
        self.validate().await.map_err(DeploymentError::ProxyConfig)?;
        self.reload().await.map_err(DeploymentError::ProxyReload)?;
        Ok(())
    }

    async fn write_conf(&self, path: &std::path::Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DeploymentError::ProxyConfig(e.to_string()))?;
        }
        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| DeploymentError::ProxyConfig(e.to_string()))?;
        file.write_all(bytes)
            .await
            .map_err(|e| DeploymentError::ProxyConfig(e.to_string()))?;
        file.flush().await.map_err(|e| DeploymentError::ProxyConfig(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| DeploymentError::ProxyConfig(e.to_string()))?;
        Ok(())
    }

    async fn validate(&self) -> std::result::Result<(), String> {
        self.runtime
            .exec_in_proxy(&["nginx", "-t"])
            .await
            .map_err(|e| e.to_string())
    }

    async fn reload(&self) -> std::result::Result<(), String> {
        self.runtime
            .exec_in_proxy(&["nginx", "-s", "reload"])
            .await
            .map_err(|e| e.to_string())
    }
}
