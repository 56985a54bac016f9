use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use studio_core::{ArtifactMetadata, ArtifactRef, ArtifactStore, ExecutionError, TaskId, TaskKind};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

const KINDS: [TaskKind; 5] = [TaskKind::Video, TaskKind::Audio, TaskKind::Image, TaskKind::Code, TaskKind::Text];

#[derive(Debug, Clone)]
struct StoredFile {
    artifact: ArtifactRef,
    path: PathBuf,
}

/// Writes artifacts under `<root>/<kind dir>/<id>.<ext>`; the router serves
/// `root` at `/storage`.
///
/// Artifacts written by this process are indexed in memory. Files left by
/// earlier runs are only reached by [`ArtifactStore::cleanup_before`], which
/// judges them by modification time.
#[derive(Debug)]
pub struct LocalArtifactStore {
    root: PathBuf,
    index: RwLock<HashMap<String, StoredFile>>,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the per-kind directories.
    pub async fn prepare(&self) -> std::io::Result<()> {
        for kind in KINDS {
            tokio::fs::create_dir_all(self.root.join(kind_dir(kind))).await?;
        }
        Ok(())
    }
}

fn kind_dir(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Video => "videos",
        TaskKind::Audio => "audio",
        TaskKind::Image => "images",
        TaskKind::Code => "code",
        TaskKind::Text => "text",
    }
}

fn storage_error(err: std::io::Error) -> ExecutionError {
    ExecutionError::Storage(err.to_string())
}

/// Remove a file; a file that is already gone counts as removed.
async fn remove(path: &Path) -> Result<(), ExecutionError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(storage_error(err)),
    }
}

/// ASCII-alphanumeric part of the requested filename's extension.
fn extension(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .unwrap_or("bin")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect::<String>()
        .to_ascii_lowercase()
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn store(&self, data: Bytes, metadata: ArtifactMetadata) -> Result<ArtifactRef, ExecutionError> {
        let id = Uuid::new_v4().simple().to_string();
        let ext = match extension(&metadata.filename) {
            ext if ext.is_empty() => "bin".to_owned(),
            ext => ext,
        };
        let dir = kind_dir(metadata.kind);
        let file_name = format!("{id}.{ext}");
        let path = self.root.join(dir).join(&file_name);

        let checksum = hex::encode(Sha256::digest(&data));
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(storage_error)?;
        }
        tokio::fs::write(&path, &data).await.map_err(storage_error)?;
        debug!(
            task_id = %metadata.task_id,
            user_id = %metadata.user_id,
            path = %path.display(),
            size = data.len(),
            "artifact stored"
        );

        let artifact = ArtifactRef {
            id: id.clone(),
            task_id: metadata.task_id,
            url: format!("/storage/{dir}/{file_name}"),
            size: data.len() as u64,
            checksum,
            mime_type: metadata.mime_type,
            created_at: Utc::now(),
        };
        self.index.write().await.insert(
            id,
            StoredFile {
                artifact: artifact.clone(),
                path,
            },
        );
        Ok(artifact)
    }

    async fn get(&self, id: &str) -> Result<Option<ArtifactRef>, ExecutionError> {
        Ok(self.index.read().await.get(id).map(|f| f.artifact.clone()))
    }

    async fn task_artifacts(&self, task_id: TaskId) -> Result<Vec<ArtifactRef>, ExecutionError> {
        let mut found: Vec<ArtifactRef> = self
            .index
            .read()
            .await
            .values()
            .filter(|f| f.artifact.task_id == task_id)
            .map(|f| f.artifact.clone())
            .collect();
        found.sort_by_key(|a| a.created_at);
        Ok(found)
    }

    async fn delete(&self, id: &str) -> Result<bool, ExecutionError> {
        let Some(file) = self.index.write().await.remove(id) else {
            return Ok(false);
        };
        remove(&file.path).await?;
        debug!(artifact_id = id, path = %file.path.display(), "artifact deleted");
        Ok(true)
    }

    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<usize, ExecutionError> {
        let expired: Vec<StoredFile> = {
            let mut index = self.index.write().await;
            let ids: Vec<String> = index
                .iter()
                .filter(|(_, f)| f.artifact.created_at < cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| index.remove(id)).collect()
        };
        let mut removed = 0;
        for file in &expired {
            remove(&file.path).await?;
            removed += 1;
        }

        // Leftovers from earlier runs.
        let threshold = SystemTime::from(cutoff);
        for kind in KINDS {
            let dir = self.root.join(kind_dir(kind));
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(storage_error(err)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(storage_error)? {
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    Err(err) => {
                        warn!(path = %entry.path().display(), error = %err, "cannot stat artifact");
                        continue;
                    }
                };
                let stale = meta.is_file() && meta.modified().is_ok_and(|modified| modified < threshold);
                if stale {
                    remove(&entry.path()).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}
