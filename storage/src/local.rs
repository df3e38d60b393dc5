use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

fn io_error_to_storage(engine: &'static str, err: std::io::Error) -> StorageError {
    let kind = match err.kind() {
        std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
        _ => StorageErrorKind::Io,
    };
    StorageError::new(engine, kind, err)
}

/// Storage driver backed by a local filesystem directory.
///
/// Buckets are subdirectories of the root; object paths map directly to file
/// paths beneath the bucket.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a new local driver rooted at the given directory.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push(remote);
        path
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let remote = self.path(bucket, remote);
        let metadata = tokio::fs::metadata(&remote)
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?;
        Ok(Metadata {
            size: metadata.len(),
            created: metadata
                .created()
                .map_err(|err| io_error_to_storage(self.name(), err))?
                .into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let remote = self.path(bucket, remote);
        tokio::fs::remove_file(remote)
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let remote = self.path(bucket, remote);

        if let Some(parent) = remote.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| io_error_to_storage(self.name(), err))?;
        }

        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&remote)
                .await
                .map_err(|err| io_error_to_storage(self.name(), err))?,
        );

        tokio::io::copy(reader, &mut writer)
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?;

        writer
            .shutdown()
            .await
            .map_err(|err| io_error_to_storage(self.name(), err))?;
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let remote = self.path(bucket, remote);

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&remote)
                .await
                .map_err(|err| io_error_to_storage(self.name(), err))?,
        );

        tokio::io::copy(&mut reader, writer)
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
        let root = self.root.join(bucket);
        let start = match prefix {
            Some(part) => root.join(part),
            None => root.clone(),
        };

        let items = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            if start.is_dir() {
                visit(&start, &mut files)?;
            }
            Ok::<_, std::io::Error>(files)
        })
        .in_current_span()
        .await
        .map_err(|err| StorageError::new(self.name(), StorageErrorKind::Other, err))?
        .map_err(|err| io_error_to_storage(self.name(), err))?;

        tracing::debug!("Found {} entries", items.len());

        Ok(items
            .into_iter()
            .filter_map(|p| p.strip_prefix(&root).ok().map(|p| p.to_string()))
            .collect())
    }
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> std::io::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, LocalDriver::new(root))
    }

    #[tokio::test]
    async fn roundtrip_and_list() {
        let (_dir, driver) = driver();

        let mut reader = BufReader::new(&b"content"[..]);
        driver
            .upload("bucket", Utf8Path::new("blobs/sha256/abc"), &mut reader)
            .await
            .unwrap();

        let mut data = Vec::new();
        let mut cursor = Cursor::new(&mut data);
        driver
            .download("bucket", Utf8Path::new("blobs/sha256/abc"), &mut cursor)
            .await
            .unwrap();
        assert_eq!(&data[..], b"content");

        let listed = driver
            .list("bucket", Some(Utf8Path::new("blobs")))
            .await
            .unwrap();
        assert_eq!(listed, vec!["blobs/sha256/abc"]);

        driver
            .delete("bucket", Utf8Path::new("blobs/sha256/abc"))
            .await
            .unwrap();
        let err = driver
            .metadata("bucket", Utf8Path::new("blobs/sha256/abc"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_empty_bucket_is_empty() {
        let (_dir, driver) = driver();
        let listed = driver.list("missing", None).await.unwrap();
        assert!(listed.is_empty());
    }
}
