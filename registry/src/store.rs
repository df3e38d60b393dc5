//! Registry storage layout: blobs and link records.
//!
//! Blobs live under `blobs/<algorithm>/<hex>`. Reference metadata is stored
//! as link records, tiny files whose content is exactly one digest string:
//!
//! - `repositories/<name>/manifests/<algorithm>/<hex>/link`: a revision
//!   link, recording that a manifest was pushed under a repository
//! - `repositories/<name>/tags/<tag>/link`: a tag link, a mutable pointer
//!   to the current manifest for a tag
//! - `repositories/<name>/referrers/<subject>/<child>/link`: a referrer
//!   link, an index entry for manifests attached to a subject
//!
//! Manifests are content-addressed and stored in the blob namespace; the
//! link records are the edges of the reference graph.

use std::collections::BTreeSet;
use std::io::Cursor;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::BufReader;

use crate::digest::Digest;
use crate::error::{GcError, GcResult};
use crate::manifest::Manifest;
use crate::retry::{with_retries, Backoff};

/// Registry storage backend
#[derive(Clone, Debug)]
pub struct RegistryStore {
    storage: storage::Storage,
    bucket: String,
}

const BLOB_PREFIX: &str = "blobs";
const REPOSITORY_PREFIX: &str = "repositories";
const LINK_FILE: &str = "link";

impl RegistryStore {
    /// Create a new registry store over the given storage backend.
    pub fn new(storage: storage::Storage, bucket: impl Into<String>) -> Self {
        Self {
            storage,
            bucket: bucket.into(),
        }
    }

    fn blob_path(digest: &Digest) -> Utf8PathBuf {
        Utf8PathBuf::from(BLOB_PREFIX).join(digest.to_path())
    }

    fn revision_link_path(repository: &str, digest: &Digest) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "{REPOSITORY_PREFIX}/{repository}/manifests/{}/{LINK_FILE}",
            digest.to_path()
        ))
    }

    fn tag_link_path(repository: &str, tag: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "{REPOSITORY_PREFIX}/{repository}/tags/{tag}/{LINK_FILE}"
        ))
    }

    fn referrer_link_path(repository: &str, subject: &Digest, child: &Digest) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "{REPOSITORY_PREFIX}/{repository}/referrers/{}/{}/{LINK_FILE}",
            subject.to_path(),
            child.to_path()
        ))
    }

    pub(crate) async fn read_object(&self, path: &Utf8Path) -> Result<Vec<u8>, storage::StorageError> {
        with_retries(Backoff::default(), || async {
            let mut data = Vec::new();
            let mut cursor = Cursor::new(&mut data);
            self.storage.download(&self.bucket, path, &mut cursor).await?;
            Ok(data)
        })
        .await
    }

    pub(crate) async fn write_object(
        &self,
        path: &Utf8Path,
        data: &[u8],
    ) -> Result<(), storage::StorageError> {
        let mut reader = BufReader::new(data);
        self.storage.upload(&self.bucket, path, &mut reader).await
    }

    pub(crate) async fn delete_object(&self, path: &Utf8Path) -> Result<(), storage::StorageError> {
        with_retries(Backoff::default(), || async {
            self.storage.delete(&self.bucket, path).await
        })
        .await
    }

    async fn list_objects(&self, prefix: &Utf8Path) -> Result<Vec<String>, storage::StorageError> {
        with_retries(Backoff::default(), || async {
            self.storage.list(&self.bucket, Some(prefix)).await
        })
        .await
    }

    async fn read_link(&self, path: &Utf8Path) -> GcResult<Digest> {
        let data = self.read_object(path).await?;
        let content = String::from_utf8_lossy(&data);
        Ok(Digest::from_str(content.trim())?)
    }

    async fn write_link(&self, path: &Utf8Path, digest: &Digest) -> GcResult<()> {
        self.write_object(path, digest.as_str().as_bytes()).await?;
        Ok(())
    }

    // === Blobs ===

    /// Check if a blob exists
    pub async fn blob_exists(&self, digest: &Digest) -> GcResult<bool> {
        match self
            .storage
            .metadata(&self.bucket, &Self::blob_path(digest))
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// The size of a blob in bytes, if it exists
    pub async fn blob_size(&self, digest: &Digest) -> GcResult<Option<u64>> {
        match self
            .storage
            .metadata(&self.bucket, &Self::blob_path(digest))
            .await
        {
            Ok(metadata) => Ok(Some(metadata.size)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Get a blob's contents
    pub async fn get_blob(&self, digest: &Digest) -> GcResult<Vec<u8>> {
        self.read_object(&Self::blob_path(digest)).await.map_err(|err| {
            if err.is_not_found() {
                GcError::BlobNotFound(digest.clone())
            } else {
                err.into()
            }
        })
    }

    /// Store a blob, verifying the content hash against the claimed digest
    pub async fn put_blob(&self, digest: &Digest, data: &[u8]) -> GcResult<()> {
        let computed = Digest::sha256(data);
        if &computed != digest {
            return Err(GcError::DigestMismatch {
                expected: digest.clone(),
                actual: computed,
            });
        }

        self.write_object(&Self::blob_path(digest), data).await?;
        Ok(())
    }

    /// Delete a blob
    pub async fn delete_blob(&self, digest: &Digest) -> GcResult<()> {
        self.delete_object(&Self::blob_path(digest))
            .await
            .map_err(|err| {
                if err.is_not_found() {
                    GcError::BlobNotFound(digest.clone())
                } else {
                    err.into()
                }
            })
    }

    /// Enumerate the digests physically present in the blob store, sorted.
    ///
    /// The backend exposes one recursive listing primitive, so the blob
    /// namespace is listed exactly once per call and callers iterate the
    /// held result in batches. Paths under the blob prefix that do not
    /// look like digests are logged and skipped.
    pub async fn list_blobs(&self) -> GcResult<Vec<Digest>> {
        let files = self.list_objects(Utf8Path::new(BLOB_PREFIX)).await?;

        let mut digests: Vec<Digest> = files
            .iter()
            .filter_map(|path| match Self::parse_blob_path(path) {
                Some(digest) => Some(digest),
                None => {
                    tracing::warn!(%path, "ignoring unrecognized path in blob namespace");
                    None
                }
            })
            .collect();
        digests.sort();

        Ok(digests)
    }

    fn parse_blob_path(path: &str) -> Option<Digest> {
        let rest = path.strip_prefix(BLOB_PREFIX)?.strip_prefix('/')?;
        let (algorithm, hex) = rest.split_once('/')?;
        Digest::from_str(&format!("{algorithm}:{hex}")).ok()
    }

    // === Repositories ===

    /// List all repository names, sorted and deduplicated.
    pub async fn list_repositories(&self) -> GcResult<Vec<String>> {
        let files = self
            .list_objects(Utf8Path::new(REPOSITORY_PREFIX))
            .await?;

        let mut names = BTreeSet::new();
        for path in &files {
            let Some(rest) = path
                .strip_prefix(REPOSITORY_PREFIX)
                .and_then(|p| p.strip_prefix('/'))
            else {
                continue;
            };

            // Repository names may contain slashes, so find the reserved
            // namespace marker that terminates the name.
            let marker = ["/manifests/", "/tags/", "/referrers/"]
                .iter()
                .filter_map(|m| rest.find(m))
                .min();

            if let Some(index) = marker {
                names.insert(rest[..index].to_string());
            }
        }

        Ok(names.into_iter().collect())
    }

    /// List every manifest revision recorded under a repository.
    pub async fn list_manifest_revisions(&self, repository: &str) -> GcResult<Vec<Digest>> {
        let prefix = Utf8PathBuf::from(format!("{REPOSITORY_PREFIX}/{repository}/manifests"));
        let files = self.list_objects(&prefix).await?;

        let mut digests = Vec::new();
        for path in &files {
            let Some(rest) = path
                .strip_prefix(prefix.as_str())
                .and_then(|p| p.strip_prefix('/'))
            else {
                continue;
            };
            match Self::parse_link_components(rest) {
                Some(digest) => digests.push(digest),
                None => tracing::warn!(%path, "ignoring malformed revision link path"),
            }
        }
        digests.sort();

        Ok(digests)
    }

    fn parse_link_components(rest: &str) -> Option<Digest> {
        let mut parts = rest.split('/');
        let algorithm = parts.next()?;
        let hex = parts.next()?;
        if parts.next() != Some(LINK_FILE) || parts.next().is_some() {
            return None;
        }
        Digest::from_str(&format!("{algorithm}:{hex}")).ok()
    }

    /// List the tags of a repository, with the digest each points at.
    ///
    /// Tags whose link record cannot be read or parsed are logged and
    /// skipped.
    pub async fn list_tags(&self, repository: &str) -> GcResult<Vec<(String, Digest)>> {
        let prefix = Utf8PathBuf::from(format!("{REPOSITORY_PREFIX}/{repository}/tags"));
        let files = self.list_objects(&prefix).await?;

        let mut tags = Vec::new();
        for path in &files {
            let Some(name) = path
                .strip_prefix(prefix.as_str())
                .and_then(|p| p.strip_prefix('/'))
                .and_then(|p| p.strip_suffix(LINK_FILE))
                .and_then(|p| p.strip_suffix('/'))
            else {
                continue;
            };

            match self.read_link(Utf8Path::new(path)).await {
                Ok(digest) => tags.push((name.to_string(), digest)),
                Err(err) => {
                    tracing::warn!(%repository, tag = %name, "skipping unreadable tag link: {err}");
                }
            }
        }
        tags.sort();

        Ok(tags)
    }

    /// Resolve a tag to its current manifest digest.
    pub async fn resolve_tag(&self, repository: &str, tag: &str) -> GcResult<Digest> {
        self.read_link(&Self::tag_link_path(repository, tag)).await
    }

    /// List the referrer links of a repository as `(subject, child)` pairs.
    pub async fn list_referrer_links(&self, repository: &str) -> GcResult<Vec<(Digest, Digest)>> {
        let prefix = Utf8PathBuf::from(format!("{REPOSITORY_PREFIX}/{repository}/referrers"));
        let files = self.list_objects(&prefix).await?;

        let mut links = Vec::new();
        for path in &files {
            let Some(rest) = path
                .strip_prefix(prefix.as_str())
                .and_then(|p| p.strip_prefix('/'))
            else {
                continue;
            };

            let parts: Vec<&str> = rest.split('/').collect();
            let link = match parts.as_slice() {
                [salg, shex, calg, chex, LINK_FILE] => Digest::from_str(&format!("{salg}:{shex}"))
                    .ok()
                    .zip(Digest::from_str(&format!("{calg}:{chex}")).ok()),
                _ => None,
            };

            match link {
                Some(pair) => links.push(pair),
                None => tracing::warn!(%path, "ignoring malformed referrer link path"),
            }
        }
        links.sort();

        Ok(links)
    }

    // === Manifests ===

    /// Get a manifest's bytes, by repository and digest.
    ///
    /// The revision link is consulted first: a manifest blob that exists but
    /// was never pushed under this repository is not visible through it.
    pub async fn get_manifest(&self, repository: &str, digest: &Digest) -> GcResult<Vec<u8>> {
        let link = Self::revision_link_path(repository, digest);
        match self.read_object(&link).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                return Err(GcError::ManifestNotFound {
                    repository: repository.to_string(),
                    digest: digest.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        }

        self.get_blob(digest).await
    }

    /// Store a manifest under a repository, optionally tagging it.
    ///
    /// The manifest bytes are stored in the blob namespace under their
    /// content digest; a revision link is recorded, a tag link when a tag is
    /// given, and a referrer link when the manifest carries a subject.
    pub async fn put_manifest(
        &self,
        repository: &str,
        tag: Option<&str>,
        data: &[u8],
    ) -> GcResult<Digest> {
        let digest = Digest::sha256(data);

        self.put_blob(&digest, data).await?;
        self.write_link(&Self::revision_link_path(repository, &digest), &digest)
            .await?;

        if let Some(tag) = tag {
            self.write_link(&Self::tag_link_path(repository, tag), &digest)
                .await?;
        }

        // Referrer links are an index for discovery; push maintains them
        // best-effort for manifests that parse.
        if let Ok(manifest) = Manifest::parse(data) {
            if let Some(subject) = manifest.subject() {
                self.write_link(
                    &Self::referrer_link_path(repository, &subject.digest, &digest),
                    &digest,
                )
                .await?;
            }
        }

        Ok(digest)
    }

    /// Delete a manifest from a repository: removes its revision link, any
    /// tag links pointing at it, and its referrer link. The manifest blob
    /// itself is left for the sweep phase.
    pub async fn delete_manifest(&self, repository: &str, digest: &Digest) -> GcResult<()> {
        let link = Self::revision_link_path(repository, digest);
        match self.delete_object(&link).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                return Err(GcError::ManifestNotFound {
                    repository: repository.to_string(),
                    digest: digest.clone(),
                });
            }
            Err(err) => return Err(err.into()),
        }

        for (tag, target) in self.list_tags(repository).await? {
            if &target == digest {
                self.delete_tag(repository, &tag).await?;
            }
        }

        if let Ok(bytes) = self.get_blob(digest).await {
            if let Ok(manifest) = Manifest::parse(&bytes) {
                if let Some(subject) = manifest.subject() {
                    self.delete_referrer_link(repository, &subject.digest, digest)
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Delete a tag link.
    pub async fn delete_tag(&self, repository: &str, tag: &str) -> GcResult<()> {
        self.delete_object(&Self::tag_link_path(repository, tag))
            .await?;
        Ok(())
    }

    /// Delete a manifest revision link.
    pub async fn delete_revision_link(&self, repository: &str, digest: &Digest) -> GcResult<()> {
        self.delete_object(&Self::revision_link_path(repository, digest))
            .await?;
        Ok(())
    }

    /// Delete a referrer link.
    pub async fn delete_referrer_link(
        &self,
        repository: &str,
        subject: &Digest,
        child: &Digest,
    ) -> GcResult<()> {
        self.delete_object(&Self::referrer_link_path(repository, subject, child))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::RegistryStore;
    use crate::digest::Digest;
    use crate::manifest::media_type;
    use storage::MemoryStorage;

    pub(crate) fn test_store() -> RegistryStore {
        let storage = MemoryStorage::with_buckets(&["test"]);
        RegistryStore::new(storage.into(), "test")
    }

    pub(crate) fn image_manifest(layers: &[&Digest], config_seed: &[u8]) -> Vec<u8> {
        let config = Digest::sha256(config_seed);
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_type::OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config.as_str(),
                "size": config_seed.len(),
            },
            "layers": layers.iter().map(|layer| serde_json::json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": layer.as_str(),
                "size": 1,
            })).collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    pub(crate) fn index_manifest(children: &[&Digest]) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_type::OCI_INDEX,
            "manifests": children.iter().map(|child| serde_json::json!({
                "mediaType": media_type::OCI_MANIFEST,
                "digest": child.as_str(),
                "size": 1,
            })).collect::<Vec<_>>(),
        }))
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{image_manifest, test_store};
    use super::*;
    use crate::manifest::media_type;

    #[tokio::test]
    async fn blob_roundtrip() {
        let store = test_store();
        let data = b"layer bytes";
        let digest = Digest::sha256(data);

        store.put_blob(&digest, data).await.unwrap();
        assert!(store.blob_exists(&digest).await.unwrap());
        assert_eq!(store.blob_size(&digest).await.unwrap(), Some(11));
        assert_eq!(store.get_blob(&digest).await.unwrap(), data);

        store.delete_blob(&digest).await.unwrap();
        assert!(!store.blob_exists(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn put_blob_verifies_digest() {
        let store = test_store();
        let wrong = Digest::sha256(b"other content");
        let err = store.put_blob(&wrong, b"actual content").await.unwrap_err();
        assert!(matches!(err, GcError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn manifest_links_and_tags() {
        let store = test_store();
        let layer = Digest::sha256(b"layer");
        store.put_blob(&layer, b"layer").await.unwrap();

        let data = image_manifest(&[&layer], b"config");
        let digest = store
            .put_manifest("repo", Some("latest"), &data)
            .await
            .unwrap();

        assert_eq!(store.list_repositories().await.unwrap(), vec!["repo"]);
        assert_eq!(
            store.list_manifest_revisions("repo").await.unwrap(),
            vec![digest.clone()]
        );
        assert_eq!(
            store.list_tags("repo").await.unwrap(),
            vec![("latest".to_string(), digest.clone())]
        );
        assert_eq!(
            store.resolve_tag("repo", "latest").await.unwrap(),
            digest
        );
        assert_eq!(store.get_manifest("repo", &digest).await.unwrap(), data);
    }

    #[tokio::test]
    async fn retag_overwrites_pointer() {
        let store = test_store();
        let first = store
            .put_manifest("repo", Some("latest"), &image_manifest(&[], b"one"))
            .await
            .unwrap();
        let second = store
            .put_manifest("repo", Some("latest"), &image_manifest(&[], b"two"))
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(store.resolve_tag("repo", "latest").await.unwrap(), second);
        // Both revisions remain linked.
        assert_eq!(store.list_manifest_revisions("repo").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_manifest_removes_links_but_not_blob() {
        let store = test_store();
        let data = image_manifest(&[], b"config");
        let digest = store
            .put_manifest("repo", Some("latest"), &data)
            .await
            .unwrap();

        store.delete_manifest("repo", &digest).await.unwrap();

        assert!(store.list_manifest_revisions("repo").await.unwrap().is_empty());
        assert!(store.list_tags("repo").await.unwrap().is_empty());
        assert!(store.blob_exists(&digest).await.unwrap());
        assert!(matches!(
            store.get_manifest("repo", &digest).await.unwrap_err(),
            GcError::ManifestNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn subject_records_referrer_link() {
        let store = test_store();
        let subject_digest = store
            .put_manifest("repo", Some("base"), &image_manifest(&[], b"subject"))
            .await
            .unwrap();

        let attached = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_type::OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": Digest::sha256(b"sig config").as_str(),
                "size": 1,
            },
            "layers": [],
            "subject": {
                "mediaType": media_type::OCI_MANIFEST,
                "digest": subject_digest.as_str(),
                "size": 1,
            },
        }))
        .unwrap();
        let child = store.put_manifest("repo", None, &attached).await.unwrap();

        assert_eq!(
            store.list_referrer_links("repo").await.unwrap(),
            vec![(subject_digest, child)]
        );
    }

    #[tokio::test]
    async fn blob_enumeration_is_sorted_and_complete() {
        let store = test_store();
        let mut expected = Vec::new();
        for i in 0..5u8 {
            let data = vec![i];
            let digest = Digest::sha256(&data);
            store.put_blob(&digest, &data).await.unwrap();
            expected.push(digest);
        }
        expected.sort();

        // Stray files in the blob namespace are ignored.
        store
            .write_object(Utf8Path::new("blobs/README"), b"not a blob")
            .await
            .unwrap();

        assert_eq!(store.list_blobs().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn repository_names_may_contain_slashes() {
        let store = test_store();
        store
            .put_manifest("library/nested/app", Some("latest"), &image_manifest(&[], b"c"))
            .await
            .unwrap();

        assert_eq!(
            store.list_repositories().await.unwrap(),
            vec!["library/nested/app"]
        );
        assert_eq!(
            store
                .list_manifest_revisions("library/nested/app")
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
