// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::path::Path;
use object_store::DynObjectStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StorageError;
use crate::util;

const INDEX_SUFFIX: &str = "index.json";
const PAYLOAD_SUFFIX: &str = "payload";

/// Index record written next to every parked payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub key: String,
    pub size: u64,
    pub parked_at: DateTime<Utc>,
}

/// Local-disk parking lot for payloads the remote store refused after
/// retry exhaustion. Writes are atomic (temp file + rename); a replay
/// pass on the next run drains the directory back to the remote.
#[derive(Clone)]
pub struct LocalFallback {
    dir: PathBuf,
}

impl LocalFallback {
    pub fn new(dir: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn park(&self, key: &Path, bytes: &Bytes) -> Result<PathBuf, StorageError> {
        let id = Uuid::new_v4();
        let payload_path = self.dir.join(format!("{id}.{PAYLOAD_SUFFIX}"));
        let index_path = self.dir.join(format!("{id}.{INDEX_SUFFIX}"));

        let tmp = payload_path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &payload_path)?;

        let record = FallbackRecord {
            key: key.to_string(),
            size: bytes.len() as u64,
            parked_at: Utc::now(),
        };
        let tmp = index_path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&record).map_err(std::io::Error::other)?)?;
        fs::rename(&tmp, &index_path)?;

        warn!(key = %key, path = %payload_path.display(), "payload parked in local fallback");
        Ok(payload_path)
    }

    fn entries(&self) -> Result<Vec<(PathBuf, FallbackRecord)>, StorageError> {
        let mut out = vec![];
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(INDEX_SUFFIX))
            {
                let record: FallbackRecord =
                    serde_json::from_slice(&fs::read(&path)?).map_err(std::io::Error::other)?;
                out.push((path, record));
            }
        }
        Ok(out)
    }

    pub fn pending(&self) -> Result<usize, StorageError> {
        Ok(self.entries()?.len())
    }

    fn payload_path(index_path: &FsPath) -> PathBuf {
        let name = index_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .trim_end_matches(INDEX_SUFFIX)
            .trim_end_matches('.');
        index_path.with_file_name(format!("{name}.{PAYLOAD_SUFFIX}"))
    }

    /// Uploads every parked payload and removes it on success. Failures
    /// keep their files for the next run.
    pub async fn replay(&self, store: Arc<DynObjectStore>) -> Result<usize, StorageError> {
        let mut replayed = 0;
        for (index_path, record) in self.entries()? {
            let payload_path = Self::payload_path(&index_path);
            let bytes = match fs::read(&payload_path) {
                Ok(data) => Bytes::from(data),
                Err(e) => {
                    warn!(index = %index_path.display(), error = %e,
                        "fallback payload unreadable, skipping");
                    continue;
                }
            };
            let key = Path::from(record.key.as_str());
            match util::put(&key, bytes, store.clone()).await {
                Ok(()) => {
                    let _ = fs::remove_file(&payload_path);
                    let _ = fs::remove_file(&index_path);
                    replayed += 1;
                    info!(key = %key, "fallback payload replayed to remote store");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "fallback replay failed, keeping payload");
                }
            }
        }
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    #[tokio::test]
    async fn park_then_replay_drains_the_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let fallback = LocalFallback::new(dir.path().to_path_buf()).unwrap();
        let key = Path::from("orders/audit_logs/batch_001.jsonl.gz");
        fallback.park(&key, &Bytes::from_static(b"payload")).unwrap();
        assert_eq!(fallback.pending().unwrap(), 1);

        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let replayed = fallback.replay(store.clone()).await.unwrap();
        assert_eq!(replayed, 1);
        assert_eq!(fallback.pending().unwrap(), 0);

        let data = store.get(&key).await.unwrap().bytes().await.unwrap();
        assert_eq!(&data[..], b"payload");
    }

    #[tokio::test]
    async fn replay_on_empty_directory_is_a_noop() {
        let dir = tempfile::TempDir::new().unwrap();
        let fallback = LocalFallback::new(dir.path().to_path_buf()).unwrap();
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        assert_eq!(fallback.replay(store).await.unwrap(), 0);
    }
}
