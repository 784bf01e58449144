// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Object-store access for the archiver: backend factory, rate limiting,
//! circuit breaking, multipart uploads with resumable state, and a
//! local-disk fallback for payloads the remote refuses to take.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Args;
use object_store::aws::AmazonS3Builder;
use object_store::limit::LimitStore;
use object_store::multipart::MultipartStore;
use object_store::DynObjectStore;
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod circuit;
pub mod client;
pub mod error;
pub mod fallback;
pub mod multipart;
pub mod rate_limit;
pub mod util;

pub use client::ArchiveStore;
pub use error::StorageError;

/// Object-store type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
pub enum ObjectStoreType {
    /// Local file system
    File,
    /// AWS S3
    S3,
    /// Google Cloud Store
    GCS,
    /// Azure Blob Store
    Azure,
}

/// Storage-side encryption selection, enforced by the compliance gate for
/// critical tables.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SseOption {
    None,
    #[default]
    SseS3,
    SseKms,
}

#[derive(Default, Debug, Clone, Deserialize, Serialize, Args)]
#[serde(rename_all = "kebab-case", default)]
pub struct ObjectStoreConfig {
    /// Which object storage to use. If not specified, defaults to local file system.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[clap(long, value_enum)]
    pub object_store: Option<ObjectStoreType>,
    /// Path of the local directory. Only relevant if `--object-store` is File.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[clap(long)]
    pub directory: Option<PathBuf>,
    /// Name of the bucket to use for the object store.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[clap(long)]
    pub bucket: Option<String>,
    /// Key prefix all archive objects live under.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[clap(long)]
    pub prefix: Option<String>,
    /// When using Amazon S3, an access key with read/write permission on
    /// the bucket.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[clap(long)]
    pub aws_access_key_id: Option<String>,
    /// Name of the environment variable holding the secret access key.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[clap(long)]
    pub aws_secret_access_key_env: Option<String>,
    /// When using Amazon S3, the region of the bucket.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[clap(long)]
    pub aws_region: Option<String>,
    /// Custom S3-compatible endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[clap(long)]
    pub aws_endpoint: Option<String>,
    /// Allow unencrypted HTTP connection to AWS.
    #[clap(long, default_value_t = false)]
    pub aws_allow_http: bool,
    /// KMS key id for sse-kms encryption.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[clap(long)]
    pub aws_kms_key_id: Option<String>,
    /// When using Google Cloud Storage, path to the credentials JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[clap(long)]
    pub google_service_account: Option<String>,
    /// When using Microsoft Azure, the storage account name.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[clap(long)]
    pub azure_storage_account: Option<String>,
    /// Name of the environment variable holding the Azure access key.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[clap(long)]
    pub azure_storage_access_key_env: Option<String>,
    /// Storage-side encryption option.
    #[clap(long, value_enum, default_value = "sse-s3")]
    pub sse: SseOption,
    /// Storage class for uploaded objects (e.g. STANDARD_IA). Applied at
    /// the bucket/lifecycle level; recorded in batch metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[clap(long)]
    pub storage_class: Option<String>,
    #[clap(long, default_value_t = default_object_store_connection_limit())]
    pub object_store_connection_limit: usize,
    /// Objects at or above this size upload as multipart.
    #[clap(long, default_value_t = default_multipart_threshold())]
    pub multipart_threshold_bytes: u64,
    /// Fixed multipart part size; the last part may be smaller.
    #[clap(long, default_value_t = default_multipart_part_size())]
    pub multipart_part_size_bytes: u64,
    /// Directory payloads are parked in when the remote is unavailable.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[clap(long)]
    pub fallback_directory: Option<PathBuf>,
    #[clap(flatten)]
    #[serde(default)]
    pub rate_limit: rate_limit::RateLimitConfig,
    #[clap(flatten)]
    #[serde(default)]
    pub circuit_breaker: circuit::CircuitBreakerConfig,
}

fn default_object_store_connection_limit() -> usize {
    20
}

fn default_multipart_threshold() -> u64 {
    10 * 1024 * 1024
}

fn default_multipart_part_size() -> u64 {
    5 * 1024 * 1024
}

impl ObjectStoreConfig {
    fn resolve_env(name: &Option<String>) -> anyhow::Result<Option<String>> {
        match name {
            None => Ok(None),
            Some(var) => std::env::var(var)
                .map(Some)
                .with_context(|| format!("environment variable {var} is not set")),
        }
    }

    fn new_local_fs(&self) -> anyhow::Result<Arc<DynObjectStore>> {
        info!(directory=?self.directory, object_store_type="File", "Object Store");
        if let Some(path) = &self.directory {
            fs::create_dir_all(path).context(anyhow!(
                "Failed to create local directory: {}",
                path.display()
            ))?;
            let store = object_store::local::LocalFileSystem::new_with_prefix(path)
                .context("Failed to create local object store")?;
            Ok(Arc::new(store))
        } else {
            Err(anyhow!("No directory provided for local fs storage"))
        }
    }

    fn s3_builder(&self) -> anyhow::Result<AmazonS3Builder> {
        let mut builder = AmazonS3Builder::new()
            .with_allow_http(self.aws_allow_http)
            .with_imdsv1_fallback();
        if let Some(region) = &self.aws_region {
            builder = builder.with_region(region);
        }
        if let Some(bucket) = &self.bucket {
            builder = builder.with_bucket_name(bucket);
        }
        if let Some(endpoint) = &self.aws_endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(key_id) = &self.aws_access_key_id {
            builder = builder.with_access_key_id(key_id);
        }
        if let Some(secret) = Self::resolve_env(&self.aws_secret_access_key_env)? {
            builder = builder.with_secret_access_key(secret);
        }
        if self.sse == SseOption::SseKms {
            let key = self
                .aws_kms_key_id
                .clone()
                .ok_or_else(|| anyhow!("sse-kms requires aws-kms-key-id"))?;
            builder = builder.with_sse_kms_encryption(key);
        }
        Ok(builder)
    }

    fn new_s3(&self) -> anyhow::Result<Arc<DynObjectStore>> {
        info!(bucket=?self.bucket, object_store_type="S3", "Object Store");
        Ok(Arc::new(LimitStore::new(
            self.s3_builder()?.build().context("Invalid s3 config")?,
            self.object_store_connection_limit,
        )))
    }

    fn gcs_builder(&self) -> object_store::gcp::GoogleCloudStorageBuilder {
        let mut builder = object_store::gcp::GoogleCloudStorageBuilder::new();
        if let Some(bucket) = &self.bucket {
            builder = builder.with_bucket_name(bucket);
        }
        if let Some(account) = &self.google_service_account {
            builder = builder.with_service_account_path(account);
        }
        builder
    }

    fn new_gcs(&self) -> anyhow::Result<Arc<DynObjectStore>> {
        info!(bucket=?self.bucket, object_store_type="GCS", "Object Store");
        Ok(Arc::new(LimitStore::new(
            self.gcs_builder().build().context("Invalid gcs config")?,
            self.object_store_connection_limit,
        )))
    }

    fn azure_builder(&self) -> anyhow::Result<object_store::azure::MicrosoftAzureBuilder> {
        let mut builder = object_store::azure::MicrosoftAzureBuilder::new();
        if let Some(bucket) = &self.bucket {
            builder = builder.with_container_name(bucket);
        }
        if let Some(account) = &self.azure_storage_account {
            builder = builder.with_account(account);
        }
        if let Some(key) = Self::resolve_env(&self.azure_storage_access_key_env)? {
            builder = builder.with_access_key(key);
        }
        Ok(builder)
    }

    fn new_azure(&self) -> anyhow::Result<Arc<DynObjectStore>> {
        info!(bucket=?self.bucket, account=?self.azure_storage_account,
          object_store_type="Azure", "Object Store");
        Ok(Arc::new(LimitStore::new(
            self.azure_builder()?.build().context("Invalid azure config")?,
            self.object_store_connection_limit,
        )))
    }

    pub fn make(&self) -> anyhow::Result<Arc<DynObjectStore>> {
        match &self.object_store {
            Some(ObjectStoreType::File) => self.new_local_fs(),
            Some(ObjectStoreType::S3) => self.new_s3(),
            Some(ObjectStoreType::GCS) => self.new_gcs(),
            Some(ObjectStoreType::Azure) => self.new_azure(),
            _ => Err(anyhow!("At least one storage backend should be provided")),
        }
    }

    /// Part-level multipart handle for backends that expose one. The local
    /// filesystem does not; uploads there always take the single-put path.
    pub fn make_multipart(&self) -> anyhow::Result<Option<Arc<dyn MultipartStore>>> {
        Ok(match &self.object_store {
            Some(ObjectStoreType::S3) => {
                Some(Arc::new(self.s3_builder()?.build().context("Invalid s3 config")?) as _)
            }
            Some(ObjectStoreType::GCS) => {
                Some(Arc::new(self.gcs_builder().build().context("Invalid gcs config")?) as _)
            }
            Some(ObjectStoreType::Azure) => {
                Some(Arc::new(self.azure_builder()?.build().context("Invalid azure config")?) as _)
            }
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_fs_requires_directory() {
        let config = ObjectStoreConfig {
            object_store: Some(ObjectStoreType::File),
            ..Default::default()
        };
        assert!(config.make().is_err());
    }

    #[test]
    fn local_fs_store_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ObjectStoreConfig {
            object_store: Some(ObjectStoreType::File),
            directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let store = config.make().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let path = object_store::path::Path::from("a/b/c.json");
            store.put(&path, bytes::Bytes::from_static(b"{}").into())
                .await
                .unwrap();
            let data = store.get(&path).await.unwrap().bytes().await.unwrap();
            assert_eq!(&data[..], b"{}");
        });
    }

    #[test]
    fn missing_secret_env_is_an_error() {
        let config = ObjectStoreConfig {
            object_store: Some(ObjectStoreType::S3),
            bucket: Some("archive".to_string()),
            aws_region: Some("us-east-1".to_string()),
            aws_secret_access_key_env: Some("ATTIC_TEST_UNSET_SECRET".to_string()),
            ..Default::default()
        };
        assert!(config.make().is_err());
    }
}
