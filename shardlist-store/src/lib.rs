//! A chunked, append-only list store over local or blob storage.
//!
//! Elements append into an in-memory buffer; every full batch becomes one
//! immutable, uniquely named data file under `store/`. The `info.json`
//! manifest is the single source of truth for readers: it lists the files
//! with their element counts. Appends from many processes and hosts need
//! no coordination beyond the manifest lock taken during `flush`.
//!
//! [`ShardList`] is the native read/write store; [`ExternalShardList`]
//! presents pre-existing columnar files (Parquet) as one logical sequence
//! with row-group-granular lazy loading and column projection.

pub mod error;
pub mod external;
pub mod file_reader;
pub mod file_seq;
pub mod manifest;
pub mod parquet;
pub mod shard_list;

pub use self::error::{Result, StoreError};
pub use self::external::{ExternalShardList, ParquetFileSeq};
pub use self::file_reader::{FileReader, FileReaderSpec};
pub use self::file_seq::FileSeq;
pub use self::manifest::Manifest;
pub use self::parquet::{BatchData, ParquetFileReader};
pub use self::shard_list::{ListOptions, ShardList};
