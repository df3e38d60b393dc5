//! The reference walk: from link records to the set of live blobs.

use std::collections::HashSet;

use futures::stream::{self, StreamExt as _};
use tokio_util::sync::CancellationToken;

use crate::digest::Digest;
use crate::error::GcResult;
use crate::mark::MarkSet;
use crate::store::RegistryStore;

/// Manifest lists may nest, but not indefinitely. Chains deeper than this
/// are treated as structural corruption.
const MAX_MANIFEST_DEPTH: usize = 8;

/// Options controlling a reference walk
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Treat untagged manifest revisions as unreferenced
    pub delete_untagged: bool,

    /// How many repositories to walk concurrently
    pub workers: usize,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            delete_untagged: false,
            workers: 4,
        }
    }
}

/// Counters from a reference walk
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct WalkSummary {
    /// Repositories visited
    pub repositories: u64,

    /// Manifests marked
    pub manifests: u64,

    /// Untagged revisions excluded from the walk
    pub skipped_untagged: u64,

    /// Revisions that could not be fully walked
    pub errors: u64,
}

impl WalkSummary {
    fn merge(&mut self, other: WalkSummary) {
        self.repositories += other.repositories;
        self.manifests += other.manifests;
        self.skipped_untagged += other.skipped_untagged;
        self.errors += other.errors;
    }
}

/// Walks the reference graph and populates a [`MarkSet`].
///
/// The walk starts from every manifest revision link in every repository
/// and marks the transitive closure of manifests, configs, and layers.
/// Subject pointers are deliberately not followed: an attached manifest
/// keeps its subject discoverable, not alive.
///
/// The walk is conservative: any revision it cannot fully resolve is
/// counted as an error and whatever it did resolve stays marked. Errors
/// make the mark set larger, never smaller.
#[derive(Debug)]
pub struct ReferenceWalker {
    store: RegistryStore,
    options: WalkOptions,
}

impl ReferenceWalker {
    /// Create a walker over the given store.
    pub fn new(store: RegistryStore, options: WalkOptions) -> Self {
        Self { store, options }
    }

    /// Walk every repository, marking reachable digests into `marks`.
    ///
    /// Only a failure to enumerate repositories is fatal; per-repository
    /// and per-manifest failures are counted in the summary. Cancellation
    /// stops the walk early, leaving the mark set incomplete.
    #[tracing::instrument(skip_all)]
    pub async fn mark_all(
        &self,
        marks: &MarkSet,
        cancel: &CancellationToken,
    ) -> GcResult<WalkSummary> {
        let repositories = self.store.list_repositories().await?;
        tracing::info!(repositories = repositories.len(), "starting reference walk");

        let mut summary = WalkSummary::default();
        let mut results = stream::iter(repositories.iter().map(|repository| async move {
            self.mark_repository(repository, marks, cancel).await
        }))
        .buffer_unordered(self.options.workers.max(1));

        while let Some(repo_summary) = results.next().await {
            summary.merge(repo_summary);
        }

        tracing::info!(
            repositories = summary.repositories,
            manifests = summary.manifests,
            marked = marks.len(),
            errors = summary.errors,
            "reference walk complete"
        );
        Ok(summary)
    }

    /// Walk a single repository. Never fails: problems are counted and the
    /// walk moves on.
    #[tracing::instrument(skip(self, marks, cancel))]
    async fn mark_repository(
        &self,
        repository: &str,
        marks: &MarkSet,
        cancel: &CancellationToken,
    ) -> WalkSummary {
        let mut summary = WalkSummary {
            repositories: 1,
            ..Default::default()
        };

        let revisions = match self.store.list_manifest_revisions(repository).await {
            Ok(revisions) => revisions,
            Err(err) => {
                tracing::error!(%repository, "failed to list manifest revisions: {err}");
                summary.errors += 1;
                return summary;
            }
        };

        let tagged: Option<HashSet<Digest>> = if self.options.delete_untagged {
            match self.store.list_tags(repository).await {
                Ok(tags) => Some(tags.into_iter().map(|(_, digest)| digest).collect()),
                Err(err) => {
                    // Without the tag list we cannot tell tagged from
                    // untagged, so keep every revision.
                    tracing::error!(%repository, "failed to list tags, keeping all revisions: {err}");
                    summary.errors += 1;
                    None
                }
            }
        } else {
            None
        };

        for revision in revisions {
            if cancel.is_cancelled() {
                tracing::debug!(%repository, "walk cancelled");
                return summary;
            }

            if let Some(tagged) = &tagged {
                if !tagged.contains(&revision) {
                    tracing::debug!(%repository, digest = %revision, "skipping untagged revision");
                    summary.skipped_untagged += 1;
                    continue;
                }
            }

            self.mark_revision(repository, revision, marks, &mut summary)
                .await;
        }

        summary
    }

    /// Mark a revision and its transitive closure of children, configs, and
    /// layers.
    async fn mark_revision(
        &self,
        repository: &str,
        revision: Digest,
        marks: &MarkSet,
        summary: &mut WalkSummary,
    ) {
        let mut stack = vec![(revision, 0usize)];

        while let Some((digest, depth)) = stack.pop() {
            if depth > MAX_MANIFEST_DEPTH {
                tracing::error!(%repository, %digest, "manifest nesting exceeds depth limit");
                summary.errors += 1;
                continue;
            }

            // Already marked means already expanded, including diamonds
            // where two indexes share a child.
            if !marks.insert(digest.clone()) {
                continue;
            }

            let data = match self.store.get_blob(&digest).await {
                Ok(data) => data,
                Err(err) => {
                    // A dangling link: the manifest stays marked so the
                    // sweep never races a concurrent re-push.
                    tracing::error!(%repository, %digest, "failed to fetch manifest blob: {err}");
                    summary.errors += 1;
                    continue;
                }
            };

            let manifest = match crate::manifest::Manifest::parse(&data) {
                Ok(manifest) => manifest,
                Err(err) => {
                    tracing::error!(%repository, %digest, "unparseable manifest, keeping its blob: {err}");
                    summary.errors += 1;
                    continue;
                }
            };
            summary.manifests += 1;

            for descriptor in manifest.referenced_blobs() {
                marks.insert(descriptor.digest.clone());
            }

            for child in manifest.child_manifests() {
                stack.push((child.digest.clone(), depth + 1));
            }
        }
    }
}
