//! The `info.json` manifest: the authoritative record of a store's data
//! files. Readers trust the manifest, never directory listings, so a
//! consistent manifest is what keeps concurrent writers and readers sane.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use shardlist_serial::StorageFormat;

use crate::error::{Result, StoreError};

pub const INFO_FILE: &str = "info.json";
pub const STORE_DIR: &str = "store";
pub const EAGER_DIR: &str = "_flush_eager";

/// Bumped on breaking changes to the on-disk layout, independent of the
/// storage format of the data files.
pub const STORAGE_VERSION: u32 = 3;

/// One data file: `(file name, element count, cumulative element count)`.
pub type DataFileEntry = (String, u64, u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub storage_format: String,
    pub storage_version: u32,
    pub batch_size: usize,
    pub data_files_info: Vec<DataFileEntry>,
    /// User tags and schema hints; preserved verbatim across rewrites.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Manifest {
    pub fn new(
        storage_format: &StorageFormat,
        batch_size: usize,
        extra: serde_json::Map<String, serde_json::Value>,
    ) -> Manifest {
        Manifest {
            storage_format: storage_format.name(),
            storage_version: STORAGE_VERSION,
            batch_size,
            data_files_info: Vec::new(),
            extra,
        }
    }

    /// Total element count across all listed data files.
    pub fn total(&self) -> u64 {
        self.data_files_info.last().map(|e| e.2).unwrap_or(0)
    }

    pub fn cumulative_counts(&self) -> Vec<u64> {
        self.data_files_info.iter().map(|e| e.2).collect()
    }

    /// Check the invariants every reader relies on and resolve the storage
    /// format. `path` is only used in error messages.
    pub fn validate(&self, path: &str) -> Result<StorageFormat> {
        let format = StorageFormat::parse(&self.storage_format).map_err(|e| {
            StoreError::CorruptManifest {
                path: path.to_string(),
                reason: e.to_string(),
            }
        })?;
        if self.batch_size == 0 {
            return Err(StoreError::CorruptManifest {
                path: path.to_string(),
                reason: "batch_size must be positive".to_string(),
            });
        }
        let mut names = HashSet::new();
        let mut running = 0u64;
        for (name, count, cumulative) in &self.data_files_info {
            if !names.insert(name.as_str()) {
                return Err(StoreError::CorruptManifest {
                    path: path.to_string(),
                    reason: format!("duplicate data file name '{name}'"),
                });
            }
            running += count;
            if *cumulative != running {
                return Err(StoreError::CorruptManifest {
                    path: path.to_string(),
                    reason: format!(
                        "cumulative count {cumulative} for '{name}' does not equal \
                         the running sum {running}"
                    ),
                });
            }
        }
        Ok(format)
    }

    /// Merge newly flushed `(name, count)` pairs into the listing. The union
    /// is keyed by file name and re-sorted; names embed their creation time,
    /// so the sort restores the global order regardless of which writer
    /// merges last. Merging the same pair twice is a no-op.
    pub fn merge_entries(&mut self, additions: Vec<(String, u64)>) {
        let mut merged: BTreeMap<String, u64> = self
            .data_files_info
            .iter()
            .map(|(name, count, _)| (name.clone(), *count))
            .collect();
        for (name, count) in additions {
            merged.insert(name, count);
        }
        let mut running = 0u64;
        self.data_files_info = merged
            .into_iter()
            .map(|(name, count)| {
                running += count;
                (name, count, running)
            })
            .collect();
    }
}
