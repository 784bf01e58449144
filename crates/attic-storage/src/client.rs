// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use object_store::path::Path;
use object_store::{DynObjectStore, ObjectMeta, PutMode, PutOptions, UpdateVersion};
use tracing::{info, warn};

use attic_util::retry::{retry_classified, ErrorClass, RetryPolicy};

use crate::circuit::CircuitBreaker;
use crate::error::StorageError;
use crate::fallback::LocalFallback;
use crate::multipart::{MultipartStateDir, MultipartUploader};
use crate::rate_limit::RateLimiter;
use crate::{util, ObjectStoreConfig};

/// Outcome of a create-only conditional put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// The archiver's one client for object storage. Every call flows
/// through the process-wide token bucket and circuit breaker; puts above
/// the multipart threshold go through the part-level uploader; puts that
/// exhaust their retry budget are parked in the local fallback.
pub struct ArchiveStore {
    store: Arc<DynObjectStore>,
    multipart: Option<MultipartUploader>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    fallback: Option<LocalFallback>,
    retry: RetryPolicy,
    multipart_threshold: u64,
}

impl ArchiveStore {
    pub fn new(config: &ObjectStoreConfig, retry: RetryPolicy) -> anyhow::Result<Self> {
        let store = config.make()?;
        let multipart = match config.make_multipart()? {
            Some(mp_store) => {
                let state_dir = config
                    .fallback_directory
                    .clone()
                    .unwrap_or_else(std::env::temp_dir)
                    .join("multipart-state");
                Some(MultipartUploader::new(
                    mp_store,
                    MultipartStateDir::new(state_dir)?,
                    config.multipart_part_size_bytes,
                    retry,
                ))
            }
            None => None,
        };
        let fallback = config
            .fallback_directory
            .as_ref()
            .map(|dir| LocalFallback::new(dir.join("parked")))
            .transpose()?;
        Ok(Self {
            store,
            multipart,
            limiter: RateLimiter::new(config.rate_limit),
            breaker: CircuitBreaker::new(config.circuit_breaker),
            fallback,
            retry,
            multipart_threshold: config.multipart_threshold_bytes,
        })
    }

    /// Unwrapped handle, for callers composing their own access patterns
    /// (manifest sync, restore listing).
    pub fn raw(&self) -> Arc<DynObjectStore> {
        self.store.clone()
    }

    /// Startup recovery: replay parked payloads, abort stale multipart
    /// uploads.
    pub async fn recover(&self, stale_multipart_after: Duration) -> Result<(), StorageError> {
        if let Some(fallback) = &self.fallback {
            let replayed = fallback.replay(self.store.clone()).await?;
            if replayed > 0 {
                info!(replayed, "replayed parked payloads from local fallback");
            }
        }
        if let Some(multipart) = &self.multipart {
            multipart.cleanup_stale(stale_multipart_after).await?;
        }
        Ok(())
    }

    async fn gated<T, F, Fut>(&self, op: F) -> Result<T, StorageError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        if !self.breaker.allow() {
            return Err(StorageError::CircuitOpen);
        }
        self.limiter.acquire().await;
        let result = op().await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) if e.class() == ErrorClass::Transient => {
                if is_slowdown(e) {
                    self.limiter.on_slowdown();
                }
                self.breaker.record_failure();
            }
            // Program-state errors (not found, precondition) say nothing
            // about endpoint health.
            Err(_) => self.breaker.record_success(),
        }
        result
    }

    pub async fn get(&self, key: &Path) -> Result<Bytes, StorageError> {
        self.gated(|| async {
            let result = self.store.get(key).await?;
            Ok(result.bytes().await?)
        })
        .await
    }

    /// Bytes plus entity tag, for read-merge-write cycles.
    pub async fn get_with_version(
        &self,
        key: &Path,
    ) -> Result<(Bytes, UpdateVersion), StorageError> {
        self.gated(|| async {
            let result = self.store.get(key).await?;
            let version = UpdateVersion {
                e_tag: result.meta.e_tag.clone(),
                version: result.meta.version.clone(),
            };
            Ok((result.bytes().await?, version))
        })
        .await
    }

    pub async fn head(&self, key: &Path) -> Result<ObjectMeta, StorageError> {
        self.gated(|| async { Ok(self.store.head(key).await?) }).await
    }

    pub async fn exists(&self, key: &Path) -> Result<bool, StorageError> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn delete(&self, key: &Path) -> Result<(), StorageError> {
        self.gated(|| async { Ok(self.store.delete(key).await?) })
            .await
    }

    pub async fn list_sorted(&self, prefix: &Path) -> Result<Vec<ObjectMeta>, StorageError> {
        self.gated(|| async { util::list_sorted(prefix, &self.store).await })
            .await
    }

    /// Uploads `bytes` under `key`. Large payloads go multipart when the
    /// backend supports part-level control. After the retry budget is
    /// spent the payload is parked locally and a typed error returned, so
    /// the caller can fail its batch without losing the bytes.
    pub async fn put(&self, key: &Path, bytes: Bytes) -> Result<(), StorageError> {
        let use_multipart = self.multipart.is_some()
            && bytes.len() as u64 >= self.multipart_threshold;

        let result = if use_multipart {
            let uploader = self.multipart.as_ref().unwrap();
            self.gated(|| uploader.upload(key, bytes.clone())).await
        } else {
            retry_classified(&self.retry, StorageError::class, || {
                let bytes = bytes.clone();
                async move {
                    self.gated(|| async {
                        self.store.put(key, bytes.clone().into()).await?;
                        Ok(())
                    })
                    .await
                }
            })
            .await
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(key = %key, error = %e, "upload failed after retries");
                if let Some(fallback) = &self.fallback {
                    let parked = fallback.park(key, &bytes)?;
                    Err(StorageError::ParkedToFallback {
                        key: key.to_string(),
                        path: parked.display().to_string(),
                    })
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Create-only put, used for objects that must win a race at most
    /// once (lock leases).
    pub async fn put_if_absent(
        &self,
        key: &Path,
        bytes: Bytes,
    ) -> Result<CreateOutcome, StorageError> {
        let result = self
            .gated(|| async {
                self.store
                    .put_opts(key, bytes.clone().into(), PutOptions::from(PutMode::Create))
                    .await?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => Ok(CreateOutcome::Created),
            Err(StorageError::Store(object_store::Error::AlreadyExists { .. })) => {
                Ok(CreateOutcome::AlreadyExists)
            }
            Err(e) => Err(e),
        }
    }

    /// Conditional replace: succeeds only if the object still carries
    /// `version`. A conflict surfaces as `PreconditionFailed` so the
    /// caller can re-read, merge and retry. Backends without conditional
    /// update support fall back to a plain put.
    pub async fn put_if_matches(
        &self,
        key: &Path,
        bytes: Bytes,
        version: UpdateVersion,
    ) -> Result<(), StorageError> {
        let result = self
            .gated(|| async {
                self.store
                    .put_opts(
                        key,
                        bytes.clone().into(),
                        PutOptions::from(PutMode::Update(version.clone())),
                    )
                    .await?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(StorageError::Store(object_store::Error::Precondition { .. })) => {
                Err(StorageError::PreconditionFailed {
                    key: key.to_string(),
                })
            }
            Err(StorageError::Store(object_store::Error::NotImplemented)) => {
                // Per-table locking already serializes writers here.
                self.put(key, bytes).await
            }
            Err(e) => Err(e),
        }
    }

    pub fn fallback_pending(&self) -> usize {
        self.fallback
            .as_ref()
            .and_then(|f| f.pending().ok())
            .unwrap_or(0)
    }

    pub fn circuit_open(&self) -> bool {
        self.breaker.is_open()
    }
}

fn is_slowdown(e: &StorageError) -> bool {
    // S3 surfaces throttling as 503 SlowDown; the generic store error
    // keeps the message.
    let text = e.to_string();
    text.contains("SlowDown") || text.contains("503") || text.contains("TooManyRequests")
}

/// Test-only constructor over an arbitrary store, used across the
/// workspace's unit tests.
impl ArchiveStore {
    pub fn for_tests(store: Arc<DynObjectStore>) -> Self {
        Self {
            store,
            multipart: None,
            limiter: RateLimiter::new(Default::default()),
            breaker: CircuitBreaker::new(Default::default()),
            fallback: None,
            retry: RetryPolicy {
                base_secs: 0.0,
                cap_secs: 0.0,
                max_attempts: 2,
            },
            multipart_threshold: u64::MAX,
        }
    }

    pub fn with_fallback(mut self, fallback: LocalFallback) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn store() -> ArchiveStore {
        ArchiveStore::for_tests(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn put_get_head_round_trip() {
        let client = store();
        let key = Path::from("orders/public/audit_logs/_watermark.json");
        client.put(&key, Bytes::from_static(b"{}")).await.unwrap();
        assert!(client.exists(&key).await.unwrap());
        let meta = client.head(&key).await.unwrap();
        assert_eq!(meta.size, 2);
        assert_eq!(&client.get(&key).await.unwrap()[..], b"{}");
    }

    #[tokio::test]
    async fn put_if_absent_reports_the_loser() {
        let client = store();
        let key = Path::from("locks/run.json");
        assert_eq!(
            client.put_if_absent(&key, Bytes::from_static(b"a")).await.unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            client.put_if_absent(&key, Bytes::from_static(b"b")).await.unwrap(),
            CreateOutcome::AlreadyExists
        );
        assert_eq!(&client.get(&key).await.unwrap()[..], b"a");
    }

    #[tokio::test]
    async fn put_if_matches_detects_conflicts() {
        let client = store();
        let key = Path::from("m.json");
        client.put(&key, Bytes::from_static(b"v1")).await.unwrap();
        let (_, version) = client.get_with_version(&key).await.unwrap();

        client
            .put_if_matches(&key, Bytes::from_static(b"v2"), version.clone())
            .await
            .unwrap();

        // Stale version now conflicts.
        let err = client
            .put_if_matches(&key, Bytes::from_static(b"v3"), version)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn failed_put_parks_into_fallback() {
        // A store wrapped to always fail puts: simulate by pointing at a
        // local filesystem path that cannot be written.
        let dir = tempfile::TempDir::new().unwrap();
        let fallback = LocalFallback::new(dir.path().join("parked")).unwrap();
        let failing: Arc<DynObjectStore> = Arc::new(FailingStore);
        let client = ArchiveStore::for_tests(failing).with_fallback(fallback.clone());

        let err = client
            .put(&Path::from("k"), Bytes::from_static(b"payload"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ParkedToFallback { .. }));
        assert_eq!(fallback.pending().unwrap(), 1);
    }

    #[derive(Debug, Default)]
    struct FailingStore;

    impl std::fmt::Display for FailingStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "FailingStore")
        }
    }

    #[async_trait::async_trait]
    impl object_store::ObjectStore for FailingStore {
        async fn put_opts(
            &self,
            _location: &Path,
            _payload: object_store::PutPayload,
            _opts: PutOptions,
        ) -> object_store::Result<object_store::PutResult> {
            Err(object_store::Error::Generic {
                store: "failing",
                source: "injected put failure".into(),
            })
        }

        async fn put_multipart_opts(
            &self,
            _location: &Path,
            _opts: object_store::PutMultipartOpts,
        ) -> object_store::Result<Box<dyn object_store::MultipartUpload>> {
            Err(object_store::Error::NotImplemented)
        }

        async fn get_opts(
            &self,
            _location: &Path,
            _options: object_store::GetOptions,
        ) -> object_store::Result<object_store::GetResult> {
            Err(object_store::Error::NotImplemented)
        }

        async fn delete(&self, _location: &Path) -> object_store::Result<()> {
            Err(object_store::Error::NotImplemented)
        }

        fn list(
            &self,
            _prefix: Option<&Path>,
        ) -> futures::stream::BoxStream<'_, object_store::Result<ObjectMeta>> {
            Box::pin(futures::stream::empty())
        }

        async fn list_with_delimiter(
            &self,
            _prefix: Option<&Path>,
        ) -> object_store::Result<object_store::ListResult> {
            Err(object_store::Error::NotImplemented)
        }

        async fn copy(&self, _from: &Path, _to: &Path) -> object_store::Result<()> {
            Err(object_store::Error::NotImplemented)
        }

        async fn copy_if_not_exists(&self, _from: &Path, _to: &Path) -> object_store::Result<()> {
            Err(object_store::Error::NotImplemented)
        }
    }
}
