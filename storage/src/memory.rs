use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, sync::RwLock};

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

/// Helper to convert io::Error to StorageError with appropriate kind detection
fn io_error_to_storage(engine: &'static str, err: std::io::Error) -> StorageError {
    let kind = match err.kind() {
        std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
        _ => StorageErrorKind::Io,
    };
    StorageError::new(engine, kind, err)
}

fn not_found(
    engine: &'static str,
    bucket: &str,
    path: Option<&Utf8Path>,
    what: &str,
) -> StorageError {
    let builder = StorageError::builder(
        engine,
        StorageErrorKind::NotFound,
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("{what} not found")),
    )
    .bucket(bucket)
    .context(format!("{what} not found"));

    match path {
        Some(path) => builder.path(path.as_str()).build(),
        None => builder.build(),
    }
}

#[derive(Debug)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl AsRef<[u8]> for MemoryFileItem {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

/// Storage driver that stores objects in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, HashMap<Utf8PathBuf, MemoryFileItem>>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let mut map = HashMap::new();
        for bucket in buckets {
            map.insert(bucket.to_string(), HashMap::new());
        }

        Self {
            buckets: RwLock::new(map),
        }
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.insert(bucket, HashMap::new());
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| not_found(self.name(), bucket, None, "bucket"))?;
        Ok(bucket_map
            .get(remote)
            .ok_or_else(|| not_found(self.name(), bucket, Some(remote), "path"))?
            .into())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| not_found(self.name(), bucket, None, "bucket"))?;
        bucket_map.remove(remote);

        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();

        tokio::io::copy(reader, &mut buf)
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?;

        buf.shutdown()
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        bucket_map.insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| not_found(self.name(), bucket, None, "bucket"))?;
        let mut buf = bucket_map
            .get(remote)
            .ok_or_else(|| not_found(self.name(), bucket, Some(remote), "path"))?
            .as_ref();

        tokio::io::copy(&mut buf, writer)
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?;

        writer
            .flush()
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| not_found(self.name(), bucket, None, "bucket"))?;

        let mut paths = Vec::new();
        for path in bucket_map.keys() {
            if let Some(prefix) = prefix {
                if path.starts_with(prefix) {
                    paths.push(path.to_string());
                }
            } else {
                paths.push(path.to_string());
            }
        }

        Ok(paths)
    }
}
