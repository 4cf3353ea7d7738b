use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use partstore_core::{Backend, BackendConfig};

const CONFIG_FILE: &str = "partstore.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub name: String,
    pub backend: BackendConfig,
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("partstore")
            .join(CONFIG_FILE)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("config not found at {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Like [`AppConfig::load`], but a missing file yields an empty config.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config to {}", path.display()))?;
        Ok(())
    }

    pub fn find_remote(&self, name: &str) -> Option<&RemoteConfig> {
        self.remotes
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }

    /// Looks up `name` and returns its initialized backend.
    pub async fn open_remote(&self, name: &str) -> Result<Arc<dyn Backend>> {
        let remote = self
            .find_remote(name)
            .ok_or_else(|| anyhow::anyhow!("remote '{name}' not found"))?;
        remote
            .backend
            .open()
            .await
            .with_context(|| format!("failed to open remote '{name}'"))
    }
}
