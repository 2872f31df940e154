//! Configuration management for the worker execution agent.
//!
//! `ConfigManager` loads and validates `worker.toml` into `WorkerConfig`.
//! Unlike the master there is no secondary hot-reloaded parameter file: a
//! worker's resource totals and identity are fixed for its process lifetime
//! (§9, worker ids are the sole key for identity and must not move).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use shared::config::WorkerConfig;
use tracing::{debug, info};

const WORKER_CONFIG_FILE: &str = "worker.toml";

/// Owns the lifecycle of `worker.toml`: initial load, validation, and
/// explicit reload.
pub struct ConfigManager {
    pub config_path: PathBuf,
    pub config: WorkerConfig,
}

impl ConfigManager {
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let config_path = if config_path.is_dir() {
            config_path.join(WORKER_CONFIG_FILE)
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
            worker_id = %config.worker_id,
            listen_address = %config.listen_address,
            master_url = %config.master_url,
            "worker configuration loaded"
        );
        Ok(Self { config_path, config })
    }

    fn read_and_validate(path: &Path) -> Result<WorkerConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: WorkerConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid worker configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Reloads from disk, returning whether anything observable changed.
    pub fn reload(&mut self) -> Result<bool> {
        let fresh = Self::read_and_validate(&self.config_path)?;
        let changed = fresh != self.config;
        if changed {
            info!("worker configuration changed and reloaded");
        } else {
            debug!("worker configuration unchanged");
        }
        self.config = fresh;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_worker_toml(dir: &TempDir) -> PathBuf {
        let path = dir.path().join(WORKER_CONFIG_FILE);
        std::fs::write(
            &path,
            concat!(
                "worker_id = \"worker-1\"\n",
                "worker_address = \"http://127.0.0.1:7100\"\n",
                "listen_address = \"127.0.0.1:7100\"\n",
                "master_url = \"http://127.0.0.1:7000\"\n",
                "total_cpu = 4.0\n",
                "total_mem_gb = 8.0\n",
            ),
        )
        .unwrap();
        path
    }

    #[test]
    fn config_manager_loads_and_validates() {
        let dir = TempDir::new().unwrap();
        let path = write_worker_toml(&dir);
        let manager = ConfigManager::new(path).unwrap();
        assert_eq!(manager.config.worker_id, "worker-1");
        assert_eq!(manager.config.total_cpu, 4.0);
    }

    #[test]
    fn config_manager_reload_reports_no_change_when_file_is_identical() {
        let dir = TempDir::new().unwrap();
        let path = write_worker_toml(&dir);
        let mut manager = ConfigManager::new(path).unwrap();
        assert!(!manager.reload().unwrap());
    }

    #[test]
    fn config_manager_reload_reports_change() {
        let dir = TempDir::new().unwrap();
        let path = write_worker_toml(&dir);
        let mut manager = ConfigManager::new(path.clone()).unwrap();
        std::fs::write(
            &path,
            concat!(
                "worker_id = \"worker-1\"\n",
                "worker_address = \"http://127.0.0.1:7100\"\n",
                "listen_address = \"127.0.0.1:7100\"\n",
                "master_url = \"http://127.0.0.1:7000\"\n",
                "total_cpu = 8.0\n",
                "total_mem_gb = 16.0\n",
            ),
        )
        .unwrap();
        assert!(manager.reload().unwrap());
        assert_eq!(manager.config.total_cpu, 8.0);
    }

    #[test]
    fn config_manager_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(WORKER_CONFIG_FILE);
        std::fs::write(
            &path,
            concat!(
                "worker_id = \"bad id!\"\n",
                "worker_address = \"http://127.0.0.1:7100\"\n",
                "listen_address = \"127.0.0.1:7100\"\n",
                "total_cpu = 4.0\n",
                "total_mem_gb = 8.0\n",
            ),
        )
        .unwrap();
        assert!(ConfigManager::new(path).is_err());
    }
}
