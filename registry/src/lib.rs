//! # Registry Garbage Collection
//!
//! This crate implements offline mark-and-sweep garbage collection for a
//! content-addressed container image registry backed by the `storage`
//! crate.
//!
//! Blobs are content-addressed and shared freely between images and
//! repositories; nothing at push time records who depends on what. Instead
//! the registry keeps link records (revision, tag, and referrer links) that
//! form a reference graph over manifests. Garbage collection walks that
//! graph to mark every reachable blob, then sweeps the blob namespace and
//! deletes what nothing reaches.
//!
//! ## Safety model
//!
//! The mark set is advisory and the sweep is authoritative: before deleting
//! a blob the sweep also consults a verification walk taken at sweep time,
//! so a stale or checkpointed mark set can only ever under-delete. Runs are
//! serialized by a lease-based lock stored in the registry's own backend.
//!
//! ## Example
//!
//! ```no_run
//! use registry::{GarbageCollector, GcOptions, RegistryStore};
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let store = RegistryStore::new(storage.into(), "registry");
//!
//! let collector = GarbageCollector::new(store, GcOptions::default());
//! let report = collector.run().await?;
//! println!("deleted {} blobs", report.sweep.map_or(0, |s| s.deleted));
//! # Ok(())
//! # }
//! ```

mod digest;
mod error;
mod lease;
mod manifest;
mod mark;
mod retry;
mod run;
mod store;
mod sweep;
mod walker;

pub use digest::{Digest, InvalidDigest};
pub use error::{GcError, GcResult};
pub use lease::GcLease;
pub use manifest::{media_type, Descriptor, ImageIndex, ImageManifest, InvalidManifest, Manifest};
pub use mark::{Checkpoint, MarkSet};
pub use run::{GarbageCollector, GcMode, GcOptions, GcReport, GcState};
pub use store::RegistryStore;
pub use sweep::{SweepEngine, SweepOptions, SweepSummary};
pub use walker::{ReferenceWalker, WalkOptions, WalkSummary};
