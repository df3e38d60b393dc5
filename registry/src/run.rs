//! The garbage collection run: lease, mark, verify, sweep.

use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::GcResult;
use crate::lease::GcLease;
use crate::mark::{Checkpoint, MarkSet};
use crate::store::RegistryStore;
use crate::sweep::{SweepEngine, SweepOptions, SweepSummary};
use crate::walker::{ReferenceWalker, WalkOptions, WalkSummary};

const PROGRESS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Which phases a garbage collection run performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GcMode {
    /// Mark and sweep in a single run
    MarkAndSweep,

    /// Mark only, persisting a checkpoint for a later sweep
    MarkOnly,

    /// Sweep only, loading the mark set from a checkpoint
    SweepOnly,
}

/// Where a garbage collection run is, or how it ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GcState {
    /// Walking the reference graph
    Marking,

    /// Deleting unreferenced blobs
    Sweeping,

    /// Mark phase complete and checkpointed; no sweep was requested
    MarkOnlyDone,

    /// The run completed
    Done,

    /// The run stopped early because its wall-clock budget elapsed
    Cancelled,
}

impl fmt::Display for GcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcState::Marking => "marking",
            GcState::Sweeping => "sweeping",
            GcState::MarkOnlyDone => "mark-only-done",
            GcState::Done => "done",
            GcState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Options for a garbage collection run
#[derive(Debug, Clone)]
pub struct GcOptions {
    /// Which phases to run
    pub mode: GcMode,

    /// Treat untagged manifest revisions as unreferenced
    pub delete_untagged: bool,

    /// Log deletions instead of performing them
    pub dry_run: bool,

    /// Concurrency for the walk and sweep phases
    pub workers: usize,

    /// Wall-clock budget for the whole run
    pub timeout: Option<std::time::Duration>,

    /// Lease time-to-live for the lock record
    pub lease_ttl: std::time::Duration,

    /// Directory holding the mark checkpoint
    pub checkpoint_dir: Utf8PathBuf,

    /// Suppress periodic progress reports
    pub quiet: bool,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            mode: GcMode::MarkAndSweep,
            delete_untagged: false,
            dry_run: false,
            workers: 4,
            timeout: None,
            lease_ttl: GcLease::DEFAULT_TTL,
            checkpoint_dir: Utf8PathBuf::from("."),
            quiet: false,
        }
    }
}

/// The outcome of a garbage collection run
#[derive(Debug, Clone, Serialize)]
pub struct GcReport {
    /// How the run ended
    pub state: GcState,

    /// Which phases the run performed
    pub mode: GcMode,

    /// Whether deletions were suppressed
    pub dry_run: bool,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run finished
    pub finished_at: DateTime<Utc>,

    /// How many digests the mark set held going into the sweep
    pub marked_blobs: u64,

    /// Counters from the mark walk, absent for sweep-only runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub walk: Option<WalkSummary>,

    /// Counters from the verification walk taken before sweeping
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<WalkSummary>,

    /// Counters from the sweep
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep: Option<SweepSummary>,
}

/// Orchestrates a garbage collection run.
///
/// A run holds the lease for its whole duration: acquire, mark, verify,
/// sweep, clean links, release. The lease is renewed from a background
/// heartbeat; losing it cancels the run, as does an elapsed wall-clock
/// budget.
#[derive(Debug)]
pub struct GarbageCollector {
    store: RegistryStore,
    options: GcOptions,
}

impl GarbageCollector {
    /// Create a collector over the given store.
    pub fn new(store: RegistryStore, options: GcOptions) -> Self {
        Self { store, options }
    }

    /// Perform a garbage collection run.
    ///
    /// Returns [`crate::GcError::LockHeld`] when another run is active.
    /// Cancellation is not an error: the report's state says how far the
    /// run got. The lease is released on every path out of the run.
    #[tracing::instrument(skip_all, fields(mode = ?self.options.mode, dry_run = self.options.dry_run))]
    pub async fn run(&self) -> GcResult<GcReport> {
        let lease = Arc::new(GcLease::acquire(self.store.clone(), self.options.lease_ttl).await?);
        let cancel = CancellationToken::new();

        let watchdog = self.options.timeout.map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                tracing::warn!(?timeout, "wall-clock budget elapsed, cancelling run");
                cancel.cancel();
            })
        });

        let heartbeat = tokio::spawn(Self::heartbeat(
            lease.clone(),
            self.options.lease_ttl,
            cancel.clone(),
        ));

        let result = self.execute(&cancel).await;

        heartbeat.abort();
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        if let Err(err) = lease.release().await {
            tracing::error!("failed to release lease: {err}");
        }

        result
    }

    async fn heartbeat(
        lease: Arc<GcLease>,
        ttl: std::time::Duration,
        cancel: CancellationToken,
    ) {
        let period = ttl / 3;
        loop {
            tokio::time::sleep(period).await;
            if let Err(err) = lease.renew().await {
                tracing::error!("lease renewal failed, cancelling run: {err}");
                cancel.cancel();
                return;
            }
        }
    }

    /// Spawn a task that logs a progress line every interval: the current
    /// phase, elapsed wall-clock time, the phase's item count, and its rate.
    /// Suppressed when running quiet.
    fn spawn_progress(
        &self,
        phase: GcState,
        started: std::time::Instant,
        counter: impl Fn() -> u64 + Send + 'static,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if self.options.quiet {
            return None;
        }

        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(PROGRESS_INTERVAL).await;
                let elapsed = started.elapsed();
                let count = counter();
                let rate = count as f64 / elapsed.as_secs_f64();
                tracing::info!(
                    %phase,
                    elapsed = ?elapsed,
                    count,
                    rate = format!("{rate:.1}/s"),
                    "garbage collection progress"
                );
            }
        }))
    }

    async fn execute(&self, cancel: &CancellationToken) -> GcResult<GcReport> {
        let started_at = Utc::now();
        let started = std::time::Instant::now();
        let mut report = GcReport {
            state: GcState::Marking,
            mode: self.options.mode,
            dry_run: self.options.dry_run,
            started_at,
            finished_at: started_at,
            marked_blobs: 0,
            walk: None,
            verify: None,
            sweep: None,
        };
        tracing::info!("garbage collection starting");

        let walk_options = WalkOptions {
            delete_untagged: self.options.delete_untagged,
            workers: self.options.workers,
        };
        let walker = ReferenceWalker::new(self.store.clone(), walk_options);

        let marked = match self.options.mode {
            GcMode::SweepOnly => {
                let checkpoint = Checkpoint::load(&self.options.checkpoint_dir).await?;
                if checkpoint.delete_untagged != self.options.delete_untagged {
                    tracing::warn!(
                        checkpoint = checkpoint.delete_untagged,
                        requested = self.options.delete_untagged,
                        "untagged-deletion setting differs from the checkpoint"
                    );
                }
                Arc::new(checkpoint.into_marks())
            }
            GcMode::MarkOnly | GcMode::MarkAndSweep => {
                let marks = Arc::new(MarkSet::new());
                let progress = self.spawn_progress(GcState::Marking, started, {
                    let marks = marks.clone();
                    move || marks.len() as u64
                });
                let walk = walker.mark_all(&marks, cancel).await;
                if let Some(progress) = progress {
                    progress.abort();
                }
                report.walk = Some(walk?);
                marks
            }
        };

        report.marked_blobs = marked.len() as u64;

        if cancel.is_cancelled() {
            // An incomplete mark set must never reach a sweep or a
            // checkpoint.
            return Ok(self.finish(report, GcState::Cancelled));
        }

        if self.options.mode == GcMode::MarkOnly {
            Checkpoint::capture(&marked, self.options.delete_untagged)
                .persist(&self.options.checkpoint_dir)
                .await?;
            return Ok(self.finish(report, GcState::MarkOnlyDone));
        }

        // The verification walk is taken at sweep time; deletion requires a
        // blob to be absent from both it and the mark set.
        let verified = Arc::new(MarkSet::new());
        let progress = self.spawn_progress(GcState::Marking, started, {
            let verified = verified.clone();
            move || verified.len() as u64
        });
        let verify = walker.mark_all(&verified, cancel).await;
        if let Some(progress) = progress {
            progress.abort();
        }
        report.verify = Some(verify?);

        if cancel.is_cancelled() {
            return Ok(self.finish(report, GcState::Cancelled));
        }

        report.state = GcState::Sweeping;
        let engine = Arc::new(SweepEngine::new(
            self.store.clone(),
            SweepOptions {
                dry_run: self.options.dry_run,
                workers: self.options.workers,
                ..Default::default()
            },
        ));

        let progress = self.spawn_progress(GcState::Sweeping, started, {
            let engine = engine.clone();
            move || engine.summary().examined
        });

        let swept = engine.sweep(&marked, &verified, cancel).await;
        if let Some(progress) = progress {
            progress.abort();
        }
        swept?;
        report.sweep = Some(engine.summary());

        if cancel.is_cancelled() {
            return Ok(self.finish(report, GcState::Cancelled));
        }

        engine.clean_links(cancel).await?;
        report.sweep = Some(engine.summary());

        if cancel.is_cancelled() {
            return Ok(self.finish(report, GcState::Cancelled));
        }

        Ok(self.finish(report, GcState::Done))
    }

    fn finish(&self, mut report: GcReport, state: GcState) -> GcReport {
        report.state = state;
        report.finished_at = Utc::now();
        let elapsed = report.finished_at - report.started_at;
        tracing::info!(%state, ?elapsed, "garbage collection finished");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use crate::error::GcError;
    use crate::store::testutil::{image_manifest, test_store};

    async fn push_image(
        store: &RegistryStore,
        repository: &str,
        tag: &str,
        layers: &[&[u8]],
        config_seed: &[u8],
    ) -> Digest {
        let mut layer_digests = Vec::new();
        for layer in layers {
            let digest = Digest::sha256(layer);
            store.put_blob(&digest, layer).await.unwrap();
            layer_digests.push(digest);
        }
        let config = Digest::sha256(config_seed);
        store.put_blob(&config, config_seed).await.unwrap();

        let refs: Vec<&Digest> = layer_digests.iter().collect();
        store
            .put_manifest(repository, Some(tag), &image_manifest(&refs, config_seed))
            .await
            .unwrap()
    }

    fn collector(store: &RegistryStore, options: GcOptions) -> GarbageCollector {
        GarbageCollector::new(store.clone(), options)
    }

    #[tokio::test]
    async fn full_run_deletes_only_unreferenced_content() {
        let store = test_store();
        let kept = push_image(&store, "app", "v1", &[b"shared-layer"], b"config-a").await;
        let doomed = push_image(&store, "app", "v2", &[b"shared-layer", b"only-b"], b"config-b").await;
        store.delete_manifest("app", &doomed).await.unwrap();

        let report = collector(&store, GcOptions::default()).run().await.unwrap();

        assert_eq!(report.state, GcState::Done);
        assert_eq!(report.marked_blobs, 3);
        let sweep = report.sweep.unwrap();
        // Manifest b, config b, and its exclusive layer go; the shared
        // layer stays.
        assert_eq!(sweep.deleted, 3);
        assert!(store.blob_exists(&kept).await.unwrap());
        assert!(store.blob_exists(&Digest::sha256(b"shared-layer")).await.unwrap());
        assert!(!store.blob_exists(&doomed).await.unwrap());
        assert!(!store.blob_exists(&Digest::sha256(b"only-b")).await.unwrap());
        assert!(!store.blob_exists(&Digest::sha256(b"config-b")).await.unwrap());
    }

    #[tokio::test]
    async fn empty_registry_completes_cleanly() {
        let store = test_store();
        let report = collector(&store, GcOptions::default()).run().await.unwrap();

        assert_eq!(report.state, GcState::Done);
        assert_eq!(report.walk.unwrap().repositories, 0);
        assert_eq!(report.sweep.unwrap().deleted, 0);
    }

    #[tokio::test]
    async fn checkpointed_sweep_protects_later_pushes() {
        let store = test_store();
        let dir = tempfile::tempdir().unwrap();
        let checkpoint_dir =
            camino::Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        push_image(&store, "app", "v1", &[], b"config-a").await;

        let mark_options = GcOptions {
            mode: GcMode::MarkOnly,
            checkpoint_dir: checkpoint_dir.clone(),
            ..Default::default()
        };
        let report = collector(&store, mark_options).run().await.unwrap();
        assert_eq!(report.state, GcState::MarkOnlyDone);

        // Pushed between mark and sweep; absent from the checkpoint.
        let late = push_image(&store, "app", "v2", &[b"late-layer"], b"config-late").await;
        let orphan = Digest::sha256(b"orphan-blob");
        store.put_blob(&orphan, b"orphan-blob").await.unwrap();

        let sweep_options = GcOptions {
            mode: GcMode::SweepOnly,
            checkpoint_dir,
            ..Default::default()
        };
        let report = collector(&store, sweep_options).run().await.unwrap();

        assert_eq!(report.state, GcState::Done);
        assert!(report.walk.is_none());
        let sweep = report.sweep.unwrap();
        assert_eq!(sweep.deleted, 1);
        assert!(sweep.rescued >= 1);
        assert!(store.blob_exists(&late).await.unwrap());
        assert!(store.blob_exists(&Digest::sha256(b"late-layer")).await.unwrap());
        assert!(!store.blob_exists(&orphan).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_only_without_checkpoint_fails() {
        let store = test_store();
        let dir = tempfile::tempdir().unwrap();
        let options = GcOptions {
            mode: GcMode::SweepOnly,
            checkpoint_dir: camino::Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap(),
            ..Default::default()
        };

        let err = collector(&store, options).run().await.unwrap_err();
        assert!(matches!(err, GcError::CheckpointMissing(_)));
    }

    #[tokio::test]
    async fn dry_run_reports_without_deleting() {
        let store = test_store();
        let orphan = Digest::sha256(b"orphan");
        store.put_blob(&orphan, b"orphan").await.unwrap();

        let options = GcOptions {
            dry_run: true,
            ..Default::default()
        };
        let report = collector(&store, options.clone()).run().await.unwrap();

        assert_eq!(report.state, GcState::Done);
        let sweep = report.sweep.unwrap();
        assert_eq!(sweep.deleted, 0);
        assert_eq!(sweep.would_delete, vec![orphan.clone()]);
        assert!(store.blob_exists(&orphan).await.unwrap());

        // A dry run changes nothing, so a second one reports the same.
        let again = collector(&store, options).run().await.unwrap();
        assert_eq!(again.sweep.unwrap().would_delete, vec![orphan]);
    }

    #[tokio::test]
    async fn concurrent_run_is_rejected() {
        let store = test_store();
        let lease = crate::lease::GcLease::acquire(store.clone(), GcLease::DEFAULT_TTL)
            .await
            .unwrap();

        let err = collector(&store, GcOptions::default()).run().await.unwrap_err();
        assert!(matches!(err, GcError::LockHeld));

        lease.release().await.unwrap();
        collector(&store, GcOptions::default()).run().await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_before_checkpoint_and_sweep() {
        let store = test_store();
        push_image(&store, "app", "v1", &[b"layer"], b"config").await;
        let orphan = Digest::sha256(b"orphan");
        store.put_blob(&orphan, b"orphan").await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let checkpoint_dir =
            camino::Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        // The watchdog and heartbeat cancel through the same token, so an
        // already-cancelled token stands in for an elapsed budget.
        let cancel = CancellationToken::new();
        cancel.cancel();

        let options = GcOptions {
            mode: GcMode::MarkOnly,
            checkpoint_dir: checkpoint_dir.clone(),
            ..Default::default()
        };
        let report = collector(&store, options).execute(&cancel).await.unwrap();
        assert_eq!(report.state, GcState::Cancelled);
        // An interrupted mark must leave nothing for a later sweep to load.
        assert!(!checkpoint_dir.join("mark.json").exists());

        let report = collector(&store, GcOptions::default())
            .execute(&cancel)
            .await
            .unwrap();
        assert_eq!(report.state, GcState::Cancelled);
        assert!(report.sweep.is_none());
        assert!(store.blob_exists(&orphan).await.unwrap());
    }

    #[tokio::test]
    async fn release_happens_even_when_the_run_fails() {
        let store = test_store();
        let dir = tempfile::tempdir().unwrap();
        let options = GcOptions {
            mode: GcMode::SweepOnly,
            checkpoint_dir: camino::Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap(),
            ..Default::default()
        };

        collector(&store, options).run().await.unwrap_err();

        // The lease must not leak from the failed run.
        crate::lease::GcLease::acquire(store, GcLease::DEFAULT_TTL)
            .await
            .unwrap();
    }
}
