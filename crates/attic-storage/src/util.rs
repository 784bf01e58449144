// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use backoff::future::retry;
use bytes::Bytes;
use futures::StreamExt;
use object_store::path::Path;
use object_store::{DynObjectStore, ObjectMeta};
use tracing::error;

use crate::error::StorageError;

pub async fn get(location: &Path, from: Arc<DynObjectStore>) -> Result<Bytes, StorageError> {
    let backoff = backoff::ExponentialBackoff::default();
    let bytes = retry(backoff, || async {
        from.get(location).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => backoff::Error::permanent(e),
            e => {
                error!("Failed to read file from object store with error: {:?}", &e);
                backoff::Error::transient(e)
            }
        })
    })
    .await?
    .bytes()
    .await?;
    Ok(bytes)
}

pub async fn put(location: &Path, bytes: Bytes, to: Arc<DynObjectStore>) -> Result<(), StorageError> {
    let backoff = backoff::ExponentialBackoff::default();
    retry(backoff, || async {
        to.put(location, bytes.clone().into()).await.map_err(|e| {
            error!("Failed to write file to object store with error: {:?}", &e);
            backoff::Error::transient(e)
        })
    })
    .await?;
    Ok(())
}

pub async fn exists(location: &Path, store: &Arc<DynObjectStore>) -> Result<bool, StorageError> {
    match store.head(location).await {
        Ok(_) => Ok(true),
        Err(object_store::Error::NotFound { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// All objects under `prefix`, sorted by key.
pub async fn list_sorted(
    prefix: &Path,
    store: &Arc<DynObjectStore>,
) -> Result<Vec<ObjectMeta>, StorageError> {
    let mut entries = vec![];
    let mut stream = store.list(Some(prefix));
    while let Some(meta) = stream.next().await {
        entries.push(meta?);
    }
    entries.sort_by(|a, b| a.location.cmp(&b.location));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    #[tokio::test]
    async fn exists_reflects_put_and_delete() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let path = Path::from("x/y");
        assert!(!exists(&path, &store).await.unwrap());
        put(&path, Bytes::from_static(b"data"), store.clone())
            .await
            .unwrap();
        assert!(exists(&path, &store).await.unwrap());
        store.delete(&path).await.unwrap();
        assert!(!exists(&path, &store).await.unwrap());
    }

    #[tokio::test]
    async fn list_sorted_orders_keys() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        for key in ["p/b", "p/a", "p/c"] {
            put(&Path::from(key), Bytes::from_static(b"1"), store.clone())
                .await
                .unwrap();
        }
        let entries = list_sorted(&Path::from("p"), &store).await.unwrap();
        let keys: Vec<_> = entries.iter().map(|m| m.location.to_string()).collect();
        assert_eq!(keys, vec!["p/a", "p/b", "p/c"]);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store: Arc<DynObjectStore> = Arc::new(InMemory::new());
        let err = get(&Path::from("missing"), store).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
