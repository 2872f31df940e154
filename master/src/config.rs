//! Configuration management for the master control plane.
//!
//! `ConfigManager` loads and validates `master.toml` into `MasterConfig`.
//! Scheduler parameters (θ/α/β/γ) live in a separate small JSON file that is
//! hot-reloaded by `SchedulerParamsWatcher` on a poll interval rather than a
//! filesystem watch, since nothing in this workspace watches the filesystem
//! for changes — an operator edits the file and the next poll picks it up
//! (§6: "reload interval, not push").

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use shared::config::{MasterConfig, SchedulerParams};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, info, warn};

const MASTER_CONFIG_FILE: &str = "master.toml";

/// Owns the lifecycle of `master.toml`: initial load, validation, and
/// explicit reload (e.g. on a `SIGHUP`-triggered admin call).
pub struct ConfigManager {
    pub config_path: PathBuf,
    pub config: MasterConfig,
}

impl ConfigManager {
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_path = if config_path.is_dir() {
            config_path.join(MASTER_CONFIG_FILE)
        } else {
            config_path
        };

        if !config_path.exists() {
            return Err(anyhow::anyhow!(
                "configuration file does not exist: {}",
                config_path.display()
            ));
        }

        let config = Self::read_and_validate(&config_path)?;
        info!(
            listen_address = %config.listen_address,
            data_dir = %config.data_dir,
            "master configuration loaded"
        );
        Ok(Self { config_path, config })
    }

    fn read_and_validate(path: &Path) -> Result<MasterConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: MasterConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid master configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Reloads from disk, returning whether anything observable changed.
    pub fn reload(&mut self) -> Result<bool> {
        let fresh = Self::read_and_validate(&self.config_path)?;
        let changed = fresh != self.config;
        if changed {
            info!("master configuration changed and reloaded");
        } else {
            debug!("master configuration unchanged");
        }
        self.config = fresh;
        Ok(changed)
    }
}

/// Polls the scheduler-parameter file for changes and republishes it into a
/// shared `RwLock` the scheduler reads from on every placement pass.
pub struct SchedulerParamsWatcher {
    path: PathBuf,
    params: Arc<AsyncRwLock<SchedulerParams>>,
    last_seen: tokio::sync::Mutex<Option<(std::time::Duration, u64)>>,
}

impl SchedulerParamsWatcher {
    /// Loads the initial parameters, writing the default file if absent so
    /// an operator has something to edit.
    pub async fn load(path: PathBuf) -> Result<Arc<Self>> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let defaults = SchedulerParams::default();
            let json = serde_json::to_string_pretty(&defaults)?;
            std::fs::write(&path, json)
                .with_context(|| format!("failed to write default scheduler params to {}", path.display()))?;
            info!(path = %path.display(), "wrote default scheduler parameters");
        }

        let watcher = Self {
            path,
            params: Arc::new(AsyncRwLock::new(SchedulerParams::default())),
            last_seen: tokio::sync::Mutex::new(None),
        };
        watcher.poll_and_reload().await?;
        Ok(Arc::new(watcher))
    }

    pub fn params(&self) -> Arc<AsyncRwLock<SchedulerParams>> {
        self.params.clone()
    }

    /// Re-reads the file only if its mtime or size changed since the last
    /// poll. Returns whether parameters were actually replaced.
    pub async fn poll_and_reload(&self) -> Result<bool> {
        let metadata = std::fs::metadata(&self.path)
            .with_context(|| format!("failed to stat {}", self.path.display()))?;
        let mtime = metadata.modified()?.duration_since(UNIX_EPOCH).unwrap_or_default();
        let size = metadata.len();

        let mut last_seen = self.last_seen.lock().await;
        if *last_seen == Some((mtime, size)) {
            return Ok(false);
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let parsed: SchedulerParams = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;

        *self.params.write().await = parsed;
        *last_seen = Some((mtime, size));
        info!(path = %self.path.display(), "scheduler parameters reloaded");
        Ok(true)
    }

    /// Background loop: poll every `interval_s` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, interval_s: u64, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_s.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => {
                    info!("scheduler parameter watcher shutting down");
                    return;
                }
            }
            if let Err(e) = self.poll_and_reload().await {
                warn!(error = ?e, "failed to poll scheduler parameter file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_master_toml(dir: &TempDir) -> PathBuf {
        let path = dir.path().join(MASTER_CONFIG_FILE);
        std::fs::write(&path, "listen_address = \"127.0.0.1:7000\"\n").unwrap();
        path
    }

    #[test]
    fn config_manager_loads_and_validates() {
        let dir = TempDir::new().unwrap();
        let path = write_master_toml(&dir);
        let manager = ConfigManager::new(path).unwrap();
        assert_eq!(manager.config.listen_address, "127.0.0.1:7000");
    }

    #[test]
    fn config_manager_reload_reports_no_change_when_file_is_identical() {
        let dir = TempDir::new().unwrap();
        let path = write_master_toml(&dir);
        let mut manager = ConfigManager::new(path).unwrap();
        assert!(!manager.reload().unwrap());
    }

    #[test]
    fn config_manager_reload_reports_change() {
        let dir = TempDir::new().unwrap();
        let path = write_master_toml(&dir);
        let mut manager = ConfigManager::new(path.clone()).unwrap();
        std::fs::write(&path, "listen_address = \"127.0.0.1:7001\"\n").unwrap();
        assert!(manager.reload().unwrap());
        assert_eq!(manager.config.listen_address, "127.0.0.1:7001");
    }

    #[tokio::test]
    async fn scheduler_params_watcher_writes_defaults_when_file_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scheduler_params.json");
        let _watcher = SchedulerParamsWatcher::load(path.clone()).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn scheduler_params_watcher_reloads_on_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scheduler_params.json");
        let watcher = SchedulerParamsWatcher::load(path.clone()).await.unwrap();
        let initial = *watcher.params().read().await;
        assert_eq!(initial.alpha, 1.0);

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let mut custom = SchedulerParams::default();
        custom.alpha = 5.0;
        std::fs::write(&path, serde_json::to_string(&custom).unwrap()).unwrap();

        let changed = watcher.poll_and_reload().await.unwrap();
        assert!(changed);
        assert_eq!(watcher.params().read().await.alpha, 5.0);
    }
}
