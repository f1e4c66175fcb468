//! A read-only view over pre-existing data files.
//!
//! `ExternalShardList` never writes to the data it describes. Discovery
//! walks the given roots, peeks cheap per-file metadata (the Parquet
//! footer), and persists what it found as a manifest in an independent
//! directory; later opens read only that manifest. Row order across files
//! is the lexicographic order of their full paths, stable regardless of
//! listing order on any backend.

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shardlist_config::CONFIG;
use shardlist_path::{PathError, UPath};
use shardlist_serial::StorageFormat;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::file_reader::FileReader;
use crate::manifest::INFO_FILE;
use crate::parquet::ParquetFileReader;

/// Bumped on breaking changes to the external-manifest layout.
pub const EXTERNAL_STORAGE_VERSION: u32 = 1;

/// How many files have their metadata peeked concurrently at discovery.
const DISCOVERY_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalFileEntry {
    pub url: String,
    /// Known only for formats with a cheap metadata peek (Parquet).
    pub num_rows: Option<u64>,
    pub cumulative: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalManifest {
    pub datapath: Vec<String>,
    pub storage_format: String,
    pub storage_version: u32,
    pub datafile_ext: String,
    pub data_files_info: Vec<ExternalFileEntry>,
}

pub struct ExternalShardList {
    path: UPath,
    info: ExternalManifest,
    format: StorageFormat,
    temp: bool,
    keep: bool,
}

impl ExternalShardList {
    /// Discover data files under `data_paths` and persist their metadata
    /// at `path` (a fresh temporary directory when `None`; such a view
    /// destroys itself when the handle drops). Each entry of `data_paths`
    /// may be a file or a directory; directories are walked recursively
    /// and their files ordered by full path. `ext_filter` defaults to the
    /// format's own extension, with a leading dot.
    pub async fn new(
        data_paths: Vec<UPath>,
        path: Option<UPath>,
        storage_format: StorageFormat,
        ext_filter: Option<&str>,
    ) -> Result<ExternalShardList> {
        let ext = ext_filter
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!(".{}", storage_format.extension()));

        let candidates = discover(&data_paths, &ext).await?;
        let entries = peek_all(candidates, storage_format).await?;

        let (path, temp) = match path {
            Some(p) => (p, false),
            None => (
                UPath::local(
                    std::env::temp_dir().join(format!("shardlist-external-{}", Uuid::new_v4())),
                )?,
                true,
            ),
        };
        if path.exists().await? {
            return Err(PathError::AlreadyExists {
                path: path.as_uri(),
            }
            .into());
        }
        let info = ExternalManifest {
            datapath: data_paths.iter().map(|p| p.as_uri()).collect(),
            storage_format: storage_format.name(),
            storage_version: EXTERNAL_STORAGE_VERSION,
            datafile_ext: ext,
            data_files_info: entries,
        };
        path.joinpath(INFO_FILE).write_json(&info, false).await?;
        Ok(ExternalShardList {
            path,
            info,
            format: storage_format,
            temp,
            keep: false,
        })
    }

    /// Open a previously persisted view.
    pub async fn open(path: UPath) -> Result<ExternalShardList> {
        let info: ExternalManifest = path.joinpath(INFO_FILE).read_json().await?;
        let format = StorageFormat::parse(&info.storage_format).map_err(|e| {
            StoreError::CorruptManifest {
                path: path.as_uri(),
                reason: e.to_string(),
            }
        })?;
        Ok(ExternalShardList {
            path,
            info,
            format,
            temp: false,
            keep: false,
        })
    }

    /// Re-scan the external roots and rewrite the manifest, picking up
    /// files that appeared since discovery.
    pub async fn reload(&mut self) -> Result<()> {
        let mut data_paths = Vec::with_capacity(self.info.datapath.len());
        for uri in &self.info.datapath {
            data_paths.push(UPath::parse(uri)?);
        }
        let candidates = discover(&data_paths, &self.info.datafile_ext).await?;
        self.info.data_files_info = peek_all(candidates, self.format).await?;
        self.path
            .joinpath(INFO_FILE)
            .write_json(&self.info, true)
            .await?;
        Ok(())
    }

    pub fn path(&self) -> &UPath {
        &self.path
    }

    pub fn storage_format(&self) -> StorageFormat {
        self.format
    }

    pub fn num_data_files(&self) -> usize {
        self.info.data_files_info.len()
    }

    /// Whether per-file row counts are known, enabling `len` and `get`.
    pub fn supports_indexing(&self) -> bool {
        self.info
            .data_files_info
            .first()
            .map(|e| e.num_rows.is_some())
            .unwrap_or(true)
    }

    pub fn len(&self) -> Result<u64> {
        if !self.supports_indexing() {
            return Err(StoreError::Unindexable {
                reason: format!(
                    "storage format '{}' has no cheap row count",
                    self.info.storage_format
                ),
            });
        }
        Ok(self
            .info
            .data_files_info
            .last()
            .and_then(|e| e.cumulative)
            .unwrap_or(0))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Keep a temporary view on disk after this handle drops.
    pub fn keep(&mut self) {
        self.keep = true;
    }

    /// The columnar file sequence. Only meaningful for `parquet`.
    pub fn files(&self) -> Result<ParquetFileSeq> {
        if !self.format.is_columnar() {
            return Err(StoreError::Unindexable {
                reason: format!(
                    "storage format '{}' is not columnar",
                    self.info.storage_format
                ),
            });
        }
        let mut files = Vec::with_capacity(self.info.data_files_info.len());
        for entry in &self.info.data_files_info {
            let count = entry.num_rows.ok_or_else(|| StoreError::CorruptManifest {
                path: self.path.as_uri(),
                reason: format!("missing row count for '{}'", entry.url),
            })?;
            files.push((ParquetFileReader::new(UPath::parse(&entry.url)?), count));
        }
        Ok(ParquetFileSeq::new(self.path.clone(), files))
    }

    /// Whole-file lazy handles for row-oriented external formats.
    pub fn row_readers(&self) -> Result<Vec<FileReader<Value>>> {
        let mut out = Vec::with_capacity(self.info.data_files_info.len());
        for entry in &self.info.data_files_info {
            out.push(FileReader::new(
                UPath::parse(&entry.url)?,
                self.format,
                entry.num_rows,
            ));
        }
        Ok(out)
    }

    /// Random access by row index across all files; negative counts from
    /// the end. Requires a format whose discovery records row counts.
    pub async fn get(&self, idx: i64) -> Result<Value> {
        let len = self.len()? as i64;
        let resolved = if idx < 0 { idx + len } else { idx };
        if resolved < 0 || resolved >= len {
            return Err(StoreError::IndexOutOfRange {
                index: idx,
                len: len as u64,
            });
        }
        self.files()?.get(resolved as u64).await
    }

    /// Stream all rows in manifest order with file prefetch.
    pub fn stream(&self) -> Result<impl Stream<Item = Result<Value>> + Send + 'static> {
        if self.format.is_columnar() {
            return Ok(futures::future::Either::Left(self.files()?.stream_rows()));
        }
        let readers = self.row_readers()?;
        let prefetch = CONFIG.read_prefetch.max(1);
        let stream = stream::iter(readers)
            .map(|reader| async move { reader.load().await })
            .buffered(prefetch)
            .flat_map(|loaded| match loaded {
                Ok(rows) => {
                    let rows: Vec<Result<Value>> = rows.iter().cloned().map(Ok).collect();
                    stream::iter(rows)
                }
                Err(e) => stream::iter(vec![Err(e)]),
            });
        Ok(futures::future::Either::Right(stream))
    }

    /// Remove the persisted view (never the external data itself).
    pub async fn destroy(mut self) -> Result<()> {
        self.temp = false;
        self.path.remove_dir_recursive().await?;
        Ok(())
    }
}

impl Drop for ExternalShardList {
    fn drop(&mut self) {
        if self.temp && !self.keep {
            if let Some(p) = self.path.as_std_path() {
                if let Err(e) = std::fs::remove_dir_all(&p) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("failed to remove temporary view '{}': {e}", self.path);
                    }
                }
            }
        }
    }
}

/// Enumerate candidate files: explicit files in entry order, directory
/// contents recursively, sorted by full path within each directory.
async fn discover(data_paths: &[UPath], ext: &str) -> Result<Vec<UPath>> {
    let mut candidates = Vec::new();
    for p in data_paths {
        if p.is_file().await? {
            if p.name().ends_with(ext) {
                candidates.push(p.clone());
            }
        } else {
            let mut found: Vec<UPath> = p
                .riterdir()
                .await?
                .into_iter()
                .filter(|f| f.name().ends_with(ext))
                .collect();
            found.sort_by_key(|f| f.as_uri());
            candidates.extend(found);
        }
    }
    Ok(candidates)
}

/// Peek per-file metadata concurrently, preserving order, and accumulate
/// cumulative counts when every file reports one.
async fn peek_all(
    candidates: Vec<UPath>,
    format: StorageFormat,
) -> Result<Vec<ExternalFileEntry>> {
    let total = candidates.len();
    let mut entries: Vec<ExternalFileEntry> = stream::iter(candidates)
        .map(|p| async move {
            let num_rows = if format.is_columnar() {
                Some(ParquetFileReader::new(p.clone()).num_rows().await?)
            } else {
                None
            };
            Ok(ExternalFileEntry {
                url: p.as_uri(),
                num_rows,
                cumulative: None,
            })
        })
        .buffered(DISCOVERY_CONCURRENCY)
        .collect::<Vec<Result<ExternalFileEntry>>>()
        .await
        .into_iter()
        .collect::<Result<Vec<_>>>()?;
    tracing::debug!("discovered {total} external data files");

    if entries.iter().all(|e| e.num_rows.is_some()) {
        let mut running = 0u64;
        for e in &mut entries {
            running += e.num_rows.expect("checked above");
            e.cumulative = Some(running);
        }
    }
    Ok(entries)
}

/// An indexable, streamable sequence of Parquet files.
pub struct ParquetFileSeq {
    root: UPath,
    readers: Vec<ParquetFileReader>,
    cumulative: Vec<u64>,
}

impl ParquetFileSeq {
    pub fn new(root: UPath, files: Vec<(ParquetFileReader, u64)>) -> ParquetFileSeq {
        let mut readers = Vec::with_capacity(files.len());
        let mut cumulative = Vec::with_capacity(files.len());
        let mut running = 0u64;
        for (reader, count) in files {
            running += count;
            readers.push(reader);
            cumulative.push(running);
        }
        ParquetFileSeq {
            root,
            readers,
            cumulative,
        }
    }

    pub fn num_files(&self) -> usize {
        self.readers.len()
    }

    pub fn total(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }

    pub fn readers(&self) -> &[ParquetFileReader] {
        &self.readers
    }

    pub fn reader(&self, idx: usize) -> Option<&ParquetFileReader> {
        self.readers.get(idx)
    }

    pub fn locate(&self, idx: u64) -> Option<(usize, u64)> {
        if idx >= self.total() {
            return None;
        }
        let file = self.cumulative.partition_point(|c| *c <= idx);
        let before = if file == 0 {
            0
        } else {
            self.cumulative[file - 1]
        };
        Some((file, idx - before))
    }

    pub async fn get(&self, idx: u64) -> Result<Value> {
        let (file, offset) = self.locate(idx).ok_or(StoreError::IndexOutOfRange {
            index: idx as i64,
            len: self.total(),
        })?;
        self.readers[file].get_row(offset as i64).await
    }

    /// Stream every row in file order, loading ahead of the consumer.
    pub fn stream_rows(&self) -> impl Stream<Item = Result<Value>> + Send + 'static {
        let readers = self.readers.clone();
        let prefetch = CONFIG.read_prefetch.max(1);
        stream::iter(readers)
            .map(|reader| async move { reader.load().await })
            .buffered(prefetch)
            .flat_map(|loaded| match loaded {
                Ok(data) => stream::iter(data.iter_rows()),
                Err(e) => stream::iter(vec![Err(e)]),
            })
    }
}

impl std::fmt::Debug for ParquetFileSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ParquetFileSeq({} rows in {} files at '{}')",
            self.total(),
            self.num_files(),
            self.root,
        )
    }
}
