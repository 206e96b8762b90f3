//! Remote object storage for backup artifacts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, WriteMultipart};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use strata_core::RemoteConfig;

use crate::error::StorageError;

/// Remote storage backend.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload a local file under `key`.
    async fn upload(&self, local: &Path, key: &str) -> Result<(), StorageError>;

    /// Download `key` into a local file.
    async fn download(&self, key: &str, local: &Path) -> Result<(), StorageError>;

    /// Delete `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List keys under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Files at least this large are uploaded in parts.
pub const MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;
const MAX_PARTS_IN_FLIGHT: usize = 4;

/// [`ObjectStorage`] over any `object_store` backend.
///
/// Artifacts are streamed in both directions; neither upload nor download
/// holds a whole artifact in memory.
#[derive(Debug, Clone)]
pub struct ObjectStoreStorage {
    store: Arc<dyn ObjectStore>,
    multipart_threshold: u64,
}

impl ObjectStoreStorage {
    /// Wrap an existing store.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            multipart_threshold: MULTIPART_THRESHOLD,
        }
    }

    /// Upload files of at least `bytes` in parts.
    pub fn with_multipart_threshold(mut self, bytes: u64) -> Self {
        self.multipart_threshold = bytes.max(1);
        self
    }

    async fn put_multipart(&self, local: &Path, location: &ObjectPath) -> Result<u64, StorageError> {
        let mut upload = WriteMultipart::new(self.store.put_multipart(location).await?);
        match copy_into(local, &mut upload).await {
            Ok(size) => {
                upload.finish().await?;
                Ok(size)
            }
            Err(e) => {
                if let Err(abort) = upload.abort().await {
                    warn!(error = %abort, "failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    /// Build an S3 store for `remote`. Credentials come from the environment.
    pub fn s3(remote: &RemoteConfig) -> Result<Self, StorageError> {
        if remote.bucket.trim().is_empty() {
            return Err(StorageError::InvalidConfig("bucket must not be empty".to_string()));
        }
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&remote.bucket);
        if let Some(region) = &remote.region {
            builder = builder.with_region(region);
        }
        let store = builder.build()?;
        info!(bucket = %remote.bucket, region = ?remote.region, "configured s3 backup storage");
        Ok(Self::new(Arc::new(store)))
    }
}

#[async_trait]
impl ObjectStorage for ObjectStoreStorage {
    #[tracing::instrument(skip_all, fields(key = key))]
    async fn upload(&self, local: &Path, key: &str) -> Result<(), StorageError> {
        let location = ObjectPath::from(key);
        let len = tokio::fs::metadata(local).await?.len();
        let size = if len >= self.multipart_threshold {
            self.put_multipart(local, &location).await?
        } else {
            let data = tokio::fs::read(local).await?;
            self.store.put(&location, Bytes::from(data).into()).await?;
            len
        };
        info!(size, multipart = len >= self.multipart_threshold, "uploaded backup artifact");
        Ok(())
    }

    async fn download(&self, key: &str, local: &Path) -> Result<(), StorageError> {
        let mut stream = self.store.get(&ObjectPath::from(key)).await?.into_stream();
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let partial = partial_path(local);
        let written = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            let mut size = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                size += chunk.len() as u64;
            }
            file.flush().await?;
            Ok::<_, StorageError>(size)
        }
        .await;

        match written {
            Ok(size) => {
                tokio::fs::rename(&partial, local).await?;
                debug!(key, size, "downloaded backup artifact");
                Ok(())
            }
            Err(e) => {
                if let Err(remove) = tokio::fs::remove_file(&partial).await {
                    warn!(path = %partial.display(), error = %remove, "failed to remove partial download");
                }
                Err(e)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.store.delete(&ObjectPath::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = ObjectPath::from(prefix);
        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;
        Ok(objects.into_iter().map(|meta| meta.location.to_string()).collect())
    }
}

/// Stream `local` into `upload` in fixed-size reads.
async fn copy_into(local: &Path, upload: &mut WriteMultipart) -> Result<u64, StorageError> {
    let mut file = tokio::fs::File::open(local).await?;
    let mut buf = vec![0u8; READ_CHUNK];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        upload.wait_for_capacity(MAX_PARTS_IN_FLIGHT).await?;
        upload.write(&buf[..n]);
        size += n as u64;
    }
    Ok(size)
}

fn partial_path(local: &Path) -> PathBuf {
    let mut name = local.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    local.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::local::LocalFileSystem;
    use object_store::memory::InMemory;

    #[tokio::test]
    async fn test_upload_download_delete() {
        let storage = ObjectStoreStorage::new(Arc::new(InMemory::new()));
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.dump");
        tokio::fs::write(&local, b"snapshot").await.unwrap();

        storage.upload(&local, "backups/full/a.dump").await.unwrap();
        assert_eq!(storage.list("backups").await.unwrap(), vec!["backups/full/a.dump"]);

        let copy = dir.path().join("nested/copy.dump");
        storage.download("backups/full/a.dump", &copy).await.unwrap();
        assert_eq!(tokio::fs::read(&copy).await.unwrap(), b"snapshot");

        storage.delete("backups/full/a.dump").await.unwrap();
        storage.delete("backups/full/a.dump").await.unwrap();
        assert!(storage.list("backups").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_filters_prefix() {
        let root = tempfile::tempdir().unwrap();
        let storage =
            ObjectStoreStorage::new(Arc::new(LocalFileSystem::new_with_prefix(root.path()).unwrap()));
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a.dump");
        tokio::fs::write(&local, b"x").await.unwrap();

        storage.upload(&local, "backups/full/a.dump").await.unwrap();
        storage.upload(&local, "other/a.dump").await.unwrap();

        let keys = storage.list("backups").await.unwrap();
        assert_eq!(keys, vec!["backups/full/a.dump"]);
    }

    #[tokio::test]
    async fn test_multipart_upload_streams_large_file() {
        let storage =
            ObjectStoreStorage::new(Arc::new(InMemory::new())).with_multipart_threshold(1024);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("big.dump");
        let data: Vec<u8> = (0..300 * 1024).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&local, &data).await.unwrap();

        storage.upload(&local, "backups/full/big.dump").await.unwrap();

        let copy = dir.path().join("restore/big.dump");
        storage.download("backups/full/big.dump", &copy).await.unwrap();
        assert_eq!(tokio::fs::read(&copy).await.unwrap(), data);
        assert!(!partial_path(&copy).exists());
    }

    #[tokio::test]
    async fn test_download_missing_key_fails() {
        let storage = ObjectStoreStorage::new(Arc::new(InMemory::new()));
        let dir = tempfile::tempdir().unwrap();
        let err = storage
            .download("backups/full/missing.dump", &dir.path().join("m.dump"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ObjectStore(object_store::Error::NotFound { .. })));
        assert!(!dir.path().join("m.dump").exists());
    }

    #[test]
    fn test_s3_requires_bucket() {
        assert!(matches!(
            ObjectStoreStorage::s3(&RemoteConfig::new(" ")),
            Err(StorageError::InvalidConfig(_))
        ));
    }
}
