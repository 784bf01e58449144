// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use attic_util::retry::{retry_classified, RetryPolicy};

use crate::error::StorageError;

const STATE_SUFFIX: &str = ".multipart.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartRecord {
    pub number: usize,
    pub len: u64,
    pub content_id: String,
}

/// Durable record of an in-flight multipart upload. Persisted before the
/// first part attempt and after every completed part, so a crashed run
/// can resume from the last finished part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartUploadState {
    pub key: String,
    pub upload_id: String,
    pub part_size: u64,
    pub total_len: u64,
    pub started_at: DateTime<Utc>,
    pub parts: Vec<PartRecord>,
}

/// Filesystem store for [`MultipartUploadState`] records.
#[derive(Clone)]
pub struct MultipartStateDir {
    dir: PathBuf,
}

impl MultipartStateDir {
    pub fn new(dir: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn state_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}{STATE_SUFFIX}", key.replace('/', "__")))
    }

    pub fn save(&self, state: &MultipartUploadState) -> Result<(), StorageError> {
        let path = self.state_path(&state.key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state).map_err(std::io::Error::other)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load(&self, key: &str) -> Result<Option<MultipartUploadState>, StorageError> {
        let path = self.state_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let state = serde_json::from_slice(&fs::read(&path)?).map_err(std::io::Error::other)?;
        Ok(Some(state))
    }

    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.state_path(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn load_all(&self) -> Result<Vec<MultipartUploadState>, StorageError> {
        let mut out = vec![];
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(STATE_SUFFIX))
            {
                match serde_json::from_slice(&fs::read(&path)?) {
                    Ok(state) => out.push(state),
                    Err(e) => warn!(path = %path.display(), error = %e,
                        "unreadable multipart state file"),
                }
            }
        }
        Ok(out)
    }
}

/// Uploads one logical object as independently-retried parts through a
/// backend exposing part-level control.
pub struct MultipartUploader {
    store: Arc<dyn MultipartStore>,
    state_dir: MultipartStateDir,
    part_size: u64,
    retry: RetryPolicy,
}

impl MultipartUploader {
    pub fn new(
        store: Arc<dyn MultipartStore>,
        state_dir: MultipartStateDir,
        part_size: u64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            state_dir,
            part_size,
            retry,
        }
    }

    /// Uploads `bytes` to `key`, resuming a persisted upload for the same
    /// key and length if one exists.
    pub async fn upload(&self, key: &Path, bytes: Bytes) -> Result<(), StorageError> {
        let mut state = match self.state_dir.load(key.as_ref())? {
            Some(state)
                if state.total_len == bytes.len() as u64 && state.part_size == self.part_size =>
            {
                info!(key = %key, resumed_parts = state.parts.len(),
                    "resuming multipart upload");
                state
            }
            Some(stale) => {
                // Shape changed since the crash: abort and start over.
                self.abort_upload(&stale).await;
                self.begin(key, bytes.len() as u64).await?
            }
            None => self.begin(key, bytes.len() as u64).await?,
        };

        let id = state.upload_id.clone();
        let part_count = bytes.len().div_ceil(self.part_size as usize).max(1);
        while state.parts.len() < part_count {
            let number = state.parts.len();
            let start = number * self.part_size as usize;
            let end = (start + self.part_size as usize).min(bytes.len());
            let chunk = bytes.slice(start..end);

            let content_id = retry_classified(&self.retry, StorageError::class, || {
                let chunk = chunk.clone();
                let id = id.clone();
                async move {
                    self.store
                        .put_part(key, &id, number, chunk.into())
                        .await
                        .map(|part| part.content_id)
                        .map_err(StorageError::from)
                }
            })
            .await?;

            state.parts.push(PartRecord {
                number,
                len: (end - start) as u64,
                content_id,
            });
            self.state_dir.save(&state)?;
        }

        let parts: Vec<PartId> = state
            .parts
            .iter()
            .map(|p| PartId {
                content_id: p.content_id.clone(),
            })
            .collect();
        self.store
            .complete_multipart(key, &id, parts)
            .await?;
        self.state_dir.remove(key.as_ref())?;
        Ok(())
    }

    async fn begin(&self, key: &Path, total_len: u64) -> Result<MultipartUploadState, StorageError> {
        let upload_id = self.store.create_multipart(key).await?;
        let state = MultipartUploadState {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            part_size: self.part_size,
            total_len,
            started_at: Utc::now(),
            parts: vec![],
        };
        self.state_dir.save(&state)?;
        Ok(state)
    }

    async fn abort_upload(&self, state: &MultipartUploadState) {
        let key = Path::from(state.key.as_str());
        if let Err(e) = self
            .store
            .abort_multipart(&key, &state.upload_id)
            .await
        {
            warn!(key = %key, error = %e, "failed to abort stale multipart upload");
        }
        let _ = self.state_dir.remove(&state.key);
    }

    /// Aborts persisted uploads older than `older_than`. Run at startup
    /// so crashed runs do not leak parts on the remote.
    pub async fn cleanup_stale(&self, older_than: Duration) -> Result<usize, StorageError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let mut aborted = 0;
        for state in self.state_dir.load_all()? {
            if state.started_at < cutoff {
                info!(key = %state.key, started_at = %state.started_at,
                    "aborting stale multipart upload");
                self.abort_upload(&state).await;
                aborted += 1;
            }
        }
        Ok(aborted)
    }
}
