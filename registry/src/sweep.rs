//! The sweep phase: delete unmarked blobs and drop dangling links.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::stream::{self, StreamExt as _};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::digest::Digest;
use crate::error::{GcError, GcResult};
use crate::mark::MarkSet;
use crate::store::RegistryStore;

/// Options controlling a sweep
#[derive(Debug, Clone)]
pub struct SweepOptions {
    /// Log deletions instead of performing them
    pub dry_run: bool,

    /// How many blobs to process concurrently
    pub workers: usize,

    /// How many blob digests to fetch per enumeration page
    pub page_size: usize,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            workers: 4,
            page_size: 256,
        }
    }
}

/// Counters from a sweep
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SweepSummary {
    /// Blobs examined
    pub examined: u64,

    /// Blobs deleted
    pub deleted: u64,

    /// Bytes reclaimed by deletion (or reclaimable, under a dry run)
    pub bytes_reclaimed: u64,

    /// Blobs missing from the mark set but found reachable by the
    /// verification set, and therefore kept
    pub rescued: u64,

    /// Blobs or links that could not be processed
    pub failed: u64,

    /// Dangling link records removed
    pub links_removed: u64,

    /// The blobs a dry run would have deleted
    pub would_delete: Vec<Digest>,
}

/// Deletes blobs that neither the mark set nor the verification set can
/// reach, then removes link records left dangling by those deletions.
///
/// The mark set is advisory: it may be stale (a loaded checkpoint) or
/// incomplete. The verification set is a walk taken at sweep time and acts
/// as the authority, so a blob absent from the mark set but present in the
/// verification set is kept. Deletion therefore requires absence from BOTH
/// sets, which makes a stale checkpoint safe: content pushed after the mark
/// phase is rescued by verification.
#[derive(Debug)]
pub struct SweepEngine {
    store: RegistryStore,
    options: SweepOptions,
    examined: AtomicU64,
    deleted: AtomicU64,
    bytes_reclaimed: AtomicU64,
    rescued: AtomicU64,
    failed: AtomicU64,
    links_removed: AtomicU64,
    would_delete: Mutex<Vec<Digest>>,
}

impl SweepEngine {
    /// Create a sweep engine over the given store.
    pub fn new(store: RegistryStore, options: SweepOptions) -> Self {
        Self {
            store,
            options,
            examined: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            bytes_reclaimed: AtomicU64::new(0),
            rescued: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            links_removed: AtomicU64::new(0),
            would_delete: Mutex::new(Vec::new()),
        }
    }

    /// A snapshot of the sweep counters so far.
    pub fn summary(&self) -> SweepSummary {
        let mut would_delete = self.would_delete.lock().clone();
        would_delete.sort();
        SweepSummary {
            examined: self.examined.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
            rescued: self.rescued.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            links_removed: self.links_removed.load(Ordering::Relaxed),
            would_delete,
        }
    }

    /// Sweep the blob namespace.
    ///
    /// The namespace is enumerated once; blobs are then processed in
    /// batches of `page_size`, each batch fanned out over the worker pool.
    /// Only a failure to enumerate blobs is fatal; per-blob failures are
    /// counted and the sweep moves on. Cancellation stops the sweep between
    /// batches.
    #[tracing::instrument(skip_all, fields(dry_run = self.options.dry_run))]
    pub async fn sweep(
        &self,
        marked: &MarkSet,
        verified: &MarkSet,
        cancel: &CancellationToken,
    ) -> GcResult<()> {
        let blobs = self.store.list_blobs().await?;
        tracing::debug!(blobs = blobs.len(), "enumerated blob namespace");

        for page in blobs.chunks(self.options.page_size.max(1)) {
            if cancel.is_cancelled() {
                tracing::debug!("sweep cancelled");
                return Ok(());
            }

            stream::iter(page.iter().cloned())
                .for_each_concurrent(self.options.workers.max(1), |digest| async move {
                    self.process_blob(digest, marked, verified).await;
                })
                .await;
        }

        let summary = self.summary();
        tracing::info!(
            examined = summary.examined,
            deleted = summary.deleted,
            bytes = summary.bytes_reclaimed,
            rescued = summary.rescued,
            failed = summary.failed,
            "sweep complete"
        );
        Ok(())
    }

    async fn process_blob(&self, digest: Digest, marked: &MarkSet, verified: &MarkSet) {
        self.examined.fetch_add(1, Ordering::Relaxed);

        if marked.contains(&digest) {
            return;
        }

        if verified.contains(&digest) {
            tracing::info!(%digest, "verification found blob reachable, keeping");
            self.rescued.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let size = match self.store.blob_size(&digest).await {
            Ok(Some(size)) => size,
            // Already gone, nothing to do.
            Ok(None) => return,
            Err(err) => {
                tracing::error!(%digest, "failed to stat blob: {err}");
                self.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if self.options.dry_run {
            tracing::info!(%digest, size, "dry run: would delete blob");
            self.would_delete.lock().push(digest);
            self.bytes_reclaimed.fetch_add(size, Ordering::Relaxed);
            return;
        }

        match self.store.delete_blob(&digest).await {
            Ok(()) => {
                tracing::info!(%digest, size, "deleted unreferenced blob");
                self.deleted.fetch_add(1, Ordering::Relaxed);
                self.bytes_reclaimed.fetch_add(size, Ordering::Relaxed);
            }
            Err(GcError::BlobNotFound(_)) => {}
            Err(err) => {
                tracing::error!(%digest, "failed to delete blob: {err}");
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove link records whose target blob no longer exists.
    ///
    /// Runs after the blob pass so that revision, tag, and referrer links
    /// pointing at swept manifests do not accumulate. Under a dry run no
    /// blobs were deleted, so the links they anchor are untouched.
    #[tracing::instrument(skip_all)]
    pub async fn clean_links(&self, cancel: &CancellationToken) -> GcResult<()> {
        for repository in self.store.list_repositories().await? {
            if cancel.is_cancelled() {
                tracing::debug!("link cleanup cancelled");
                return Ok(());
            }

            self.clean_repository_links(&repository).await;
        }
        Ok(())
    }

    async fn clean_repository_links(&self, repository: &str) {
        match self.store.list_manifest_revisions(repository).await {
            Ok(revisions) => {
                for revision in revisions {
                    self.clean_link(repository, &revision, LinkKind::Revision)
                        .await;
                }
            }
            Err(err) => {
                tracing::error!(%repository, "failed to list revision links: {err}");
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        match self.store.list_tags(repository).await {
            Ok(tags) => {
                for (tag, target) in tags {
                    self.clean_link(repository, &target, LinkKind::Tag(&tag))
                        .await;
                }
            }
            Err(err) => {
                tracing::error!(%repository, "failed to list tags: {err}");
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        match self.store.list_referrer_links(repository).await {
            Ok(links) => {
                for (subject, child) in links {
                    self.clean_link(repository, &child, LinkKind::Referrer(&subject))
                        .await;
                }
            }
            Err(err) => {
                tracing::error!(%repository, "failed to list referrer links: {err}");
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn clean_link(&self, repository: &str, target: &Digest, kind: LinkKind<'_>) {
        match self.store.blob_exists(target).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => {
                tracing::error!(%repository, %target, "failed to check link target: {err}");
                self.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        if self.options.dry_run {
            tracing::info!(%repository, %target, ?kind, "dry run: would remove dangling link");
            return;
        }

        let result = match kind {
            LinkKind::Revision => self.store.delete_revision_link(repository, target).await,
            LinkKind::Tag(tag) => self.store.delete_tag(repository, tag).await,
            LinkKind::Referrer(subject) => {
                self.store
                    .delete_referrer_link(repository, subject, target)
                    .await
            }
        };

        match result {
            Ok(()) => {
                tracing::info!(%repository, %target, ?kind, "removed dangling link");
                self.links_removed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::error!(%repository, %target, "failed to remove dangling link: {err}");
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Debug)]
enum LinkKind<'l> {
    Revision,
    Tag(&'l str),
    Referrer(&'l Digest),
}
