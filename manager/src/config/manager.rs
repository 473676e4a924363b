// File: manager/src/config/manager.rs
use super::{Config, NetworkConfigFile};
use anyhow::{anyhow, Result};
use glob::glob;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

pub struct ConfigManager {
    current_config: Arc<Config>,
}

impl ConfigManager {
    pub async fn new(config_dir: impl AsRef<Path>) -> Result<Self> {
        let config = Self::load_configuration(config_dir.as_ref()).await?;
        Ok(Self {
            current_config: Arc::new(config),
        })
    }

    pub fn get_current_config(&self) -> Arc<Config> {
        self.current_config.clone()
    }

    async fn load_configuration(config_dir: &Path) -> Result<Config> {
        let main_config_path = config_dir.join("main.toml");
        let main_config_content = fs::read_to_string(&main_config_path).await
            .map_err(|e| anyhow!("Failed to read main config {}: {}", main_config_path.display(), e))?;

        let mut config: Config = toml::from_str(&main_config_content)
            .map_err(|e| anyhow!("Failed to parse main config: {}", e))?;

        if config.chunk_size_bytes == 0 {
            return Err(anyhow!("chunk_size_bytes must be greater than zero"));
        }

        // Every other file describes one network
        let pattern = format!("{}/*.toml", glob::Pattern::escape(&config_dir.to_string_lossy()));
        let mut networks = HashMap::new();

        for entry in glob(&pattern).map_err(|e| anyhow!("Glob pattern error: {}", e))? {
            let path = entry.map_err(|e| anyhow!("Glob entry error: {}", e))?;
            let filename = path.file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow!("Invalid filename"))?;

            if filename == "main.toml" {
                continue;
            }

            let file_stem = filename.strip_suffix(".toml")
                .ok_or_else(|| anyhow!("Invalid config filename: {}", filename))?;

            debug!("Loading network config: {}", path.display());

            let content = fs::read_to_string(&path).await
                .map_err(|e| anyhow!("Failed to read {}: {}", path.display(), e))?;

            let mut network_file: NetworkConfigFile = toml::from_str(&content)
                .map_err(|e| anyhow!("Failed to parse {}: {}", path.display(), e))?;

            if network_file.network.name.is_empty() {
                network_file.network.name = file_stem.to_string();
            }

            let name = network_file.network.name.clone();
            if networks.insert(name.clone(), network_file.network).is_some() {
                warn!("Network {} configured more than once, {} wins", name, path.display());
            }
        }

        config.networks = networks;

        info!("Loaded {} networks ({} enabled), base dir {}",
            config.networks.len(),
            config.enabled_networks().len(),
            config.base_dir.display()
        );

        Ok(config)
    }
}
