//! # Storage backends
//!
//! Configuration and unification for the storage backends available to the
//! registry: an in-memory driver for tests and a local filesystem driver.
//! Remote backends plug in by implementing [`Driver`].

use std::sync::Arc;

use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::Deserialize;

pub(crate) mod local;
pub(crate) mod memory;

#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[doc(inline)]
pub use storage_driver::{Driver, Metadata, StorageError, StorageErrorKind};

/// Configuration for constructing a [`Storage`] backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// In-memory storage, holding a single named bucket. Contents are lost
    /// when the process exits.
    Memory {
        /// The bucket to create at startup.
        bucket: String,
    },

    /// Local filesystem storage rooted at a directory.
    Local {
        /// The root directory; buckets are subdirectories.
        path: Utf8PathBuf,
    },
}

impl StorageConfig {
    /// Construct the configured storage backend.
    #[tracing::instrument]
    pub fn build(self) -> Storage {
        match self {
            StorageConfig::Memory { bucket } => MemoryStorage::with_buckets(&[&bucket]).into(),
            StorageConfig::Local { path } => LocalDriver::new(path).into(),
        }
    }
}

use tokio::io;

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cloneable handle to a storage backend.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver in a storage handle.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// Get the metadata for an object, by path.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn metadata(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<Metadata, StorageError> {
        self.driver.metadata(bucket, remote).await
    }

    /// Download an object into a writer stream.
    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name()))]
    pub async fn download<'d, W>(
        &'d self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Downloading from: {bucket}/{remote}");
        self.driver.download(bucket, remote, writer).await?;
        Ok(())
    }

    /// Upload an object from a reader stream.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name(), bucket))]
    pub async fn upload<'d, R>(
        &'d self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut R,
    ) -> Result<(), StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Uploading to: {bucket}/{remote}");
        self.driver.upload(bucket, remote, reader).await?;
        Ok(())
    }

    /// List the object paths in a bucket, optionally filtered by a prefix.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket))]
    pub async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.driver.list(bucket, prefix).await
    }

    /// Delete an object, by path.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn delete(&self, bucket: &str, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(bucket, path).await
    }
}
