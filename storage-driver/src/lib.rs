//! # Storage driver interface
//!
//! The [`Driver`] trait is the narrow, path-oriented content interface that
//! the registry consumes: stat, upload, download, delete and enumerate, keyed
//! by bucket and UTF-8 path. Backends implement this trait; everything above
//! it is backend-agnostic.

mod driver;
mod error;

pub use driver::{Driver, Metadata, Reader, Writer};
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
