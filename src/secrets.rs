//! Credential handling: per-source bearer tokens and signer material.
//!
//! Secrets live in a JSON file outside the main config and are re-read on
//! SIGHUP. Values never appear in logs; only key names do.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Shared, reloadable map of secret name -> value.
pub struct CredentialStore {
    values: RwLock<HashMap<String, String>>,
    path: Option<PathBuf>,
}

impl CredentialStore {
    /// An empty store; collectors run unauthenticated (useful with the
    /// simulated source).
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            values: RwLock::new(HashMap::new()),
            path: None,
        })
    }

    /// Load the secrets file once at startup.
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let values = Self::read_file(&path)?;
        info!("loaded {} secrets from {}", values.len(), path.display());
        Ok(Arc::new(Self {
            values: RwLock::new(values),
            path: Some(path),
        }))
    }

    fn read_file(path: &Path) -> Result<HashMap<String, String>> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read secrets file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse secrets file {}", path.display()))
    }

    /// Fetch one secret by name.
    pub async fn get(&self, name: &str) -> Option<String> {
        self.values.read().await.get(name).cloned()
    }

    /// Re-read the backing file, replacing all values. Called from the
    /// SIGHUP handler; a failed reload keeps the previous values.
    pub async fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        match Self::read_file(path) {
            Ok(values) => {
                let count = values.len();
                *self.values.write().await = values;
                info!("reloaded {} secrets", count);
                Ok(())
            }
            Err(e) => {
                warn!("secret reload failed, keeping previous values: {}", e);
                Err(e)
            }
        }
    }

    /// Insert a value directly; used by tests and the simulated mode.
    pub async fn insert(&self, name: &str, value: &str) {
        self.values
            .write()
            .await
            .insert(name.to_string(), value.to_string());
    }
}
