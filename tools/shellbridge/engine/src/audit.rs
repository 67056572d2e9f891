use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::warn;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Append-only record of executed commands.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, block: &str) -> Result<()> {
        let stamp = chrono::Local::now().format(TIMESTAMP_FORMAT);
        let record = format!("[{stamp}]\n{block}\n\n");

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("failed to create audit log directory {}", parent.display())
                })?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        file.write_all(record.as_bytes())
            .await
            .with_context(|| format!("failed to append to audit log {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }

    /// Like [`AuditLog::append`], but a failed write is only logged.
    pub async fn record(&self, block: &str) {
        if let Err(err) = self.append(block).await {
            warn!(?err, path = %self.path.display(), "failed to write audit record");
        }
    }
}
