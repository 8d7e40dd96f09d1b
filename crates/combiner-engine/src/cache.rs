use std::path::PathBuf;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

pub const CUSTOMERS_FILE: &str = "customers.json";
pub const ORDERS_FILE: &str = "orders.json";

/// Whole-snapshot JSON files under one directory.
///
/// Snapshots are read or replaced wholesale; there is no expiry, a refresh
/// is requested explicitly.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    dir: PathBuf,
}

impl SnapshotCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Stored snapshot, or `None` when the file is missing. A file that no
    /// longer parses is treated as missing.
    pub async fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.path(name);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::Cache(format!("{}: {e}", path.display()))),
        };
        match serde_json::from_slice(&data) {
            Ok(value) => {
                debug!(path = %path.display(), "snapshot cache hit");
                Ok(Some(value))
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable snapshot");
                Ok(None)
            }
        }
    }

    pub async fn store<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.path(name);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| EngineError::Cache(format!("{}: {e}", self.dir.display())))?;
        let data = serde_json::to_vec(value).map_err(|e| EngineError::Cache(e.to_string()))?;
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| EngineError::Cache(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "snapshot cache written");
        Ok(())
    }
}
