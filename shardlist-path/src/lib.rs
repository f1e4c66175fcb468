//! Uniform path layer over local and blob storage.
//!
//! A [`UPath`] names a file on a local filesystem, in a cloud bucket, or in
//! an in-memory store, and offers one method surface for all of them:
//! atomic reads and writes, listing, removal, and a cross-process advisory
//! lock. Directories are implied by the files beneath them; there is no
//! empty-directory state on any backend.
//!
//! Writes are always a single atomic PUT. `write_bytes(.., overwrite=false)`
//! uses create-if-not-exists semantics, so independent writers can race for
//! a name and exactly one wins.

pub mod error;
mod lock;
mod retry;
mod upath;

pub use error::{PathError, Result};
pub use lock::LockGuard;
pub use upath::{BlobKind, BlobPath, LocalPath, UPath};
