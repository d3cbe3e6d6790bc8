use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::{PersistedState, StateStore, StatusSnapshot};
use crate::Result;

/// JSON files under the data directory
///
/// State goes to `{data_dir}/state/{tag}.json`, status to
/// `{data_dir}/status/{tag}.json`. Writes go through a temp file and a rename.
pub struct FileStateStore {
    state_path: PathBuf,
    status_path: PathBuf,
}

impl FileStateStore {
    pub fn new(data_dir: impl AsRef<Path>, tag: &str) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            state_path: data_dir.join("state").join(format!("{}.json", tag)),
            status_path: data_dir.join("status").join(format!("{}.json", tag)),
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn status_path(&self) -> &Path {
        &self.status_path
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    let value = serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let body = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move state into {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Option<PersistedState>> {
        read_json(&self.state_path).await
    }

    async fn save(&self, state: &PersistedState) -> Result<()> {
        write_json(&self.state_path, state).await?;
        tracing::debug!("State saved to {}", self.state_path.display());
        Ok(())
    }

    async fn save_status(&self, status: &StatusSnapshot) -> Result<()> {
        write_json(&self.status_path, status).await
    }

    async fn load_status(&self) -> Result<Option<StatusSnapshot>> {
        read_json(&self.status_path).await
    }
}
