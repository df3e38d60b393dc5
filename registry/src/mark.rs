//! The mark set and its on-disk checkpoint form.

use std::collections::HashSet;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{GcError, GcResult};

const CHECKPOINT_FILE: &str = "mark.json";
const CHECKPOINT_VERSION: u32 = 1;

/// The set of digests the reference walk found reachable.
///
/// Shared between walker tasks; membership only ever grows during a walk.
#[derive(Debug, Default)]
pub struct MarkSet {
    digests: RwLock<HashSet<Digest>>,
}

impl MarkSet {
    /// Create an empty mark set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a digest as reachable. Returns `true` if it was newly marked.
    pub fn insert(&self, digest: Digest) -> bool {
        self.digests.write().insert(digest)
    }

    /// Whether a digest is marked.
    pub fn contains(&self, digest: &Digest) -> bool {
        self.digests.read().contains(digest)
    }

    /// The number of marked digests.
    pub fn len(&self) -> usize {
        self.digests.read().len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.digests.read().is_empty()
    }

    /// The marked digests, in sorted order.
    pub fn digests(&self) -> Vec<Digest> {
        let mut digests: Vec<Digest> = self.digests.read().iter().cloned().collect();
        digests.sort();
        digests
    }
}

impl FromIterator<Digest> for MarkSet {
    fn from_iter<I: IntoIterator<Item = Digest>>(iter: I) -> Self {
        Self {
            digests: RwLock::new(iter.into_iter().collect()),
        }
    }
}

/// A persisted mark set, bridging a mark-only run to a later sweep-only run.
#[derive(Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint schema version
    pub version: u32,

    /// When the mark phase that produced this checkpoint completed
    pub created_at: DateTime<Utc>,

    /// Whether untagged manifests were excluded from the walk
    pub delete_untagged: bool,

    /// The marked digests
    pub digests: Vec<Digest>,
}

impl Checkpoint {
    /// Capture a checkpoint from a completed mark set.
    pub fn capture(marks: &MarkSet, delete_untagged: bool) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            created_at: Utc::now(),
            delete_untagged,
            digests: marks.digests(),
        }
    }

    /// Rebuild the mark set this checkpoint captured.
    pub fn into_marks(self) -> MarkSet {
        self.digests.into_iter().collect()
    }

    /// Write the checkpoint to `<dir>/mark.json`, creating the directory if
    /// needed.
    #[tracing::instrument(skip(self), fields(digests = self.digests.len()))]
    pub async fn persist(&self, dir: &Utf8Path) -> GcResult<()> {
        tokio::fs::create_dir_all(dir).await?;

        let data = serde_json::to_vec_pretty(self)
            .map_err(|err| GcError::CheckpointMalformed(err.to_string()))?;
        tokio::fs::write(dir.join(CHECKPOINT_FILE), data).await?;

        tracing::info!(%dir, digests = self.digests.len(), "checkpoint persisted");
        Ok(())
    }

    /// Load a checkpoint from `<dir>/mark.json`.
    #[tracing::instrument]
    pub async fn load(dir: &Utf8Path) -> GcResult<Self> {
        let path = dir.join(CHECKPOINT_FILE);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(GcError::CheckpointMissing(dir.to_owned()));
            }
            Err(err) => return Err(err.into()),
        };

        let checkpoint: Checkpoint = serde_json::from_slice(&data)
            .map_err(|err| GcError::CheckpointMalformed(err.to_string()))?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(GcError::CheckpointVersion {
                expected: CHECKPOINT_VERSION,
                found: checkpoint.version,
            });
        }

        tracing::info!(%dir, digests = checkpoint.digests.len(), "checkpoint loaded");
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        (dir, path)
    }

    #[test]
    fn mark_set_membership() {
        let marks = MarkSet::new();
        let digest = Digest::sha256(b"blob");

        assert!(marks.is_empty());
        assert!(marks.insert(digest.clone()));
        assert!(!marks.insert(digest.clone()));
        assert!(marks.contains(&digest));
        assert_eq!(marks.len(), 1);
    }

    #[tokio::test]
    async fn checkpoint_roundtrip() {
        let (_guard, dir) = tempdir();
        let marks = MarkSet::new();
        marks.insert(Digest::sha256(b"one"));
        marks.insert(Digest::sha256(b"two"));

        Checkpoint::capture(&marks, true).persist(&dir).await.unwrap();
        let loaded = Checkpoint::load(&dir).await.unwrap();

        assert_eq!(loaded.version, CHECKPOINT_VERSION);
        assert!(loaded.delete_untagged);
        assert_eq!(loaded.digests, marks.digests());

        let rebuilt = loaded.into_marks();
        assert!(rebuilt.contains(&Digest::sha256(b"one")));
        assert_eq!(rebuilt.len(), 2);
    }

    #[tokio::test]
    async fn missing_checkpoint_is_distinguished() {
        let (_guard, dir) = tempdir();
        let err = Checkpoint::load(&dir).await.unwrap_err();
        assert!(matches!(err, GcError::CheckpointMissing(_)));
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let (_guard, dir) = tempdir();
        let data = serde_json::json!({
            "version": 99,
            "created_at": Utc::now(),
            "delete_untagged": false,
            "digests": [],
        });
        tokio::fs::write(dir.join(CHECKPOINT_FILE), data.to_string())
            .await
            .unwrap();

        let err = Checkpoint::load(&dir).await.unwrap_err();
        assert!(matches!(
            err,
            GcError::CheckpointVersion {
                expected: 1,
                found: 99
            }
        ));
    }

    #[tokio::test]
    async fn garbage_checkpoint_is_malformed() {
        let (_guard, dir) = tempdir();
        tokio::fs::write(dir.join(CHECKPOINT_FILE), b"{not json")
            .await
            .unwrap();

        let err = Checkpoint::load(&dir).await.unwrap_err();
        assert!(matches!(err, GcError::CheckpointMalformed(_)));
    }
}
