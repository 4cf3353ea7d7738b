use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::azure::{AzureBackend, AzureConfig};
use crate::backend::local::{LocalBackend, LocalConfig};
use crate::backend::memory::{MemoryBackend, MemoryConfig};
use crate::backend::s3::{S3Backend, S3Config};
use crate::backend::{Backend, BackendKind};
use crate::error::Result;

/// Where a remote lives. Tagged by `type` in TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Local(LocalConfig),
    S3(S3Config),
    Azure(AzureConfig),
    Memory(MemoryConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Local(_) => BackendKind::Local,
            BackendConfig::S3(_) => BackendKind::S3,
            BackendConfig::Azure(_) => BackendKind::Azure,
            BackendConfig::Memory(_) => BackendKind::Memory,
        }
    }

    /// Builds an uninitialized backend.
    pub fn build(&self) -> Arc<dyn Backend> {
        match self {
            BackendConfig::Local(config) => Arc::new(LocalBackend::from_config(config)),
            BackendConfig::S3(config) => Arc::new(S3Backend::new(config.clone())),
            BackendConfig::Azure(config) => Arc::new(AzureBackend::new(config.clone())),
            BackendConfig::Memory(config) => Arc::new(MemoryBackend::from_config(config)),
        }
    }

    /// Builds and initializes the backend.
    pub async fn open(&self) -> Result<Arc<dyn Backend>> {
        let backend = self.build();
        backend.init().await?;
        Ok(backend)
    }
}
