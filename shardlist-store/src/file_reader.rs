//! Lazy handle for one data file.
//!
//! A `FileReader` is a small value: a path, a storage format, and the
//! element count recorded in the manifest. Nothing is read until the first
//! access; the decoded payload then lives behind a once-initialized cell
//! shared by clones. The small prefix ships across processes via
//! [`FileReaderSpec`]; the receiving side re-reads the file on first access.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shardlist_path::UPath;
use shardlist_serial::StorageFormat;
use tokio::sync::OnceCell;

use crate::error::{Result, StoreError};

pub struct FileReader<T> {
    path: UPath,
    format: StorageFormat,
    count: Option<u64>,
    cache: Arc<OnceCell<Arc<Vec<T>>>>,
}

impl<T> Clone for FileReader<T> {
    fn clone(&self) -> Self {
        FileReader {
            path: self.path.clone(),
            format: self.format,
            count: self.count,
            cache: self.cache.clone(),
        }
    }
}

impl<T> std::fmt::Debug for FileReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReader")
            .field("path", &self.path)
            .field("format", &self.format.name())
            .field("count", &self.count)
            .field("loaded", &self.cache.initialized())
            .finish()
    }
}

/// The shippable prefix of a [`FileReader`]: everything except the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReaderSpec {
    pub url: String,
    pub format: String,
    pub count: Option<u64>,
}

impl<T: DeserializeOwned + Send + Sync + 'static> FileReader<T> {
    pub fn new(path: UPath, format: StorageFormat, count: Option<u64>) -> FileReader<T> {
        FileReader {
            path,
            format,
            count,
            cache: Arc::new(OnceCell::new()),
        }
    }

    pub fn path(&self) -> &UPath {
        &self.path
    }

    /// The element count recorded in the manifest, if known.
    pub fn count_hint(&self) -> Option<u64> {
        self.count
    }

    pub fn spec(&self) -> FileReaderSpec {
        FileReaderSpec {
            url: self.path.as_uri(),
            format: self.format.name(),
            count: self.count,
        }
    }

    pub fn from_spec(spec: &FileReaderSpec) -> Result<FileReader<T>> {
        Ok(FileReader::new(
            UPath::parse(&spec.url)?,
            StorageFormat::parse(&spec.format)?,
            spec.count,
        ))
    }

    /// Read and decode the whole file; idempotent, cached across clones.
    pub async fn load(&self) -> Result<Arc<Vec<T>>> {
        let rows = self
            .cache
            .get_or_try_init(|| async {
                let bytes = self.path.read_bytes().await?;
                let rows: Vec<T> =
                    self.format
                        .decode_batch(&bytes)
                        .map_err(|e| StoreError::CorruptData {
                            path: self.path.as_uri(),
                            reason: e.to_string(),
                        })?;
                if let Some(count) = self.count {
                    if rows.len() as u64 != count {
                        return Err(StoreError::CorruptData {
                            path: self.path.as_uri(),
                            reason: format!(
                                "manifest records {count} elements but the file decoded to {}",
                                rows.len()
                            ),
                        });
                    }
                }
                Ok(Arc::new(rows))
            })
            .await?;
        Ok(rows.clone())
    }

    /// Element count; free when the manifest recorded it, otherwise a load.
    pub async fn len(&self) -> Result<u64> {
        match self.count {
            Some(count) => Ok(count),
            None => Ok(self.load().await?.len() as u64),
        }
    }

    pub async fn get(&self, idx: u64) -> Result<T>
    where
        T: Clone,
    {
        let rows = self.load().await?;
        rows.get(idx as usize)
            .cloned()
            .ok_or(StoreError::IndexOutOfRange {
                index: idx as i64,
                len: rows.len() as u64,
            })
    }
}
