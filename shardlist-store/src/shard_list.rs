//! The chunked, append-only list store.
//!
//! A `ShardList` is a directory holding an `info.json` manifest and a
//! `store/` directory of immutable data files. Many independent writers may
//! hold handles on the same root: data files carry globally unique names so
//! their creation needs no coordination, and only the manifest update
//! inside [`ShardList::flush`] contends, serialized by the lock on
//! `info.json`. Readers see whatever the manifest lists; files not yet
//! merged in, including orphans left by crashed writers, are invisible.

use std::time::Duration;

use chrono::Utc;
use futures::stream::Stream;
use serde::{de::DeserializeOwned, Serialize};
use shardlist_config::CONFIG;
use shardlist_path::{PathError, UPath};
use shardlist_serial::StorageFormat;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::file_reader::FileReader;
use crate::file_seq::FileSeq;
use crate::manifest::{Manifest, EAGER_DIR, INFO_FILE, STORE_DIR};

/// Settings fixed at store creation; they persist in the manifest.
#[derive(Debug, Clone)]
pub struct ListOptions {
    /// Max elements per data file. Full batches flush implicitly.
    pub batch_size: usize,
    pub storage_format: StorageFormat,
    /// Free-form metadata stored alongside the required manifest fields.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for ListOptions {
    fn default() -> Self {
        ListOptions {
            batch_size: 1000,
            storage_format: StorageFormat::default(),
            extra: serde_json::Map::new(),
        }
    }
}

type WriteOutcome = std::result::Result<String, (String, String)>;

pub struct ShardList<T> {
    path: UPath,
    info: Manifest,
    format: StorageFormat,
    buffer: Vec<T>,
    /// Data files this writer has produced but not yet merged into the
    /// manifest: `(file name, element count)`.
    pending: Vec<(String, u64)>,
    writes: JoinSet<WriteOutcome>,
    write_slots: std::sync::Arc<Semaphore>,
    seq_cache: parking_lot::Mutex<Option<FileSeq<T>>>,
    eager_file: Option<String>,
    temp: bool,
    keep: bool,
}

impl<T> std::fmt::Debug for ShardList<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardList")
            .field("path", &self.path)
            .field("info", &self.info)
            .field("format", &self.format)
            .field("pending", &self.pending)
            .field("eager_file", &self.eager_file)
            .field("temp", &self.temp)
            .field("keep", &self.keep)
            .finish()
    }
}

impl<T> ShardList<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Create a new store. The root must not exist yet. With `path = None`
    /// a unique temporary directory is chosen and the store is destroyed
    /// when this handle drops, unless [`ShardList::keep`] is called.
    pub async fn new(path: Option<UPath>, opts: ListOptions) -> Result<ShardList<T>> {
        if opts.batch_size == 0 {
            return Err(StoreError::InvalidOptions {
                reason: "batch_size must be positive".to_string(),
            });
        }
        let (path, temp) = match path {
            Some(p) => (p, false),
            None => (
                UPath::local(std::env::temp_dir().join(format!("shardlist-{}", Uuid::new_v4())))?,
                true,
            ),
        };
        if path.exists().await? {
            return Err(PathError::AlreadyExists {
                path: path.as_uri(),
            }
            .into());
        }
        let info = Manifest::new(&opts.storage_format, opts.batch_size, opts.extra);
        path.joinpath(INFO_FILE).write_json(&info, false).await?;
        Ok(ShardList {
            path,
            format: opts.storage_format,
            info,
            buffer: Vec::new(),
            pending: Vec::new(),
            writes: JoinSet::new(),
            write_slots: std::sync::Arc::new(Semaphore::new(CONFIG.write_concurrency.max(1))),
            seq_cache: parking_lot::Mutex::new(None),
            eager_file: None,
            temp,
            keep: false,
        })
    }

    /// Open an existing store.
    pub async fn open(path: UPath) -> Result<ShardList<T>> {
        let info: Manifest = path.joinpath(INFO_FILE).read_json().await?;
        let format = info.validate(&path.as_uri())?;
        Ok(ShardList {
            path,
            info,
            format,
            buffer: Vec::new(),
            pending: Vec::new(),
            writes: JoinSet::new(),
            write_slots: std::sync::Arc::new(Semaphore::new(CONFIG.write_concurrency.max(1))),
            seq_cache: parking_lot::Mutex::new(None),
            eager_file: None,
            temp: false,
            keep: false,
        })
    }

    pub fn path(&self) -> &UPath {
        &self.path
    }

    pub fn data_path(&self) -> UPath {
        self.path.joinpath(STORE_DIR)
    }

    pub fn batch_size(&self) -> usize {
        self.info.batch_size
    }

    pub fn storage_format(&self) -> StorageFormat {
        self.format
    }

    /// Number of flushed elements. Elements still in this writer's buffer
    /// or pending list are not counted.
    pub fn len(&self) -> u64 {
        self.info.total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_data_files(&self) -> usize {
        self.info.data_files_info.len()
    }

    /// Keep a temporary store on disk after this handle drops.
    pub fn keep(&mut self) {
        self.keep = true;
    }

    /// Append one element to the in-memory buffer. When the buffer reaches
    /// `batch_size`, it is handed to a background task that writes a new
    /// data file; the manifest is only updated by [`ShardList::flush`].
    pub async fn append(&mut self, x: T) -> Result<()> {
        self.buffer.push(x);
        if self.buffer.len() >= self.info.batch_size {
            self.spawn_batch_write().await?;
        }
        Ok(())
    }

    pub async fn extend(&mut self, xs: impl IntoIterator<Item = T>) -> Result<()> {
        for x in xs {
            self.append(x).await?;
        }
        Ok(())
    }

    /// Serialize the current buffer into a uniquely named data file, in the
    /// background. Returns once a write slot is available.
    async fn spawn_batch_write(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rows = std::mem::take(&mut self.buffer);
        let count = rows.len() as u64;
        let name = make_file_name(rows.len(), &self.format.extension());
        let target = self.data_path().joinpath(&name);
        let format = self.format;
        let permit = self
            .write_slots
            .clone()
            .acquire_owned()
            .await
            .expect("write semaphore is never closed");
        self.pending.push((name.clone(), count));
        self.writes.spawn(async move {
            let _permit = permit;
            let bytes = format
                .encode_batch(&rows)
                .map_err(|e| (name.clone(), e.to_string()))?;
            target
                .write_bytes(bytes, false)
                .await
                .map_err(|e| (name.clone(), e.to_string()))?;
            Ok(name)
        });
        Ok(())
    }

    /// Wait for all background data-file writes. Failed writes are dropped
    /// from the pending list and their half-written files removed; the
    /// failures are returned for the caller to surface.
    async fn drain_writes(&mut self) -> Vec<(String, String)> {
        let mut failed = Vec::new();
        while let Some(joined) = self.writes.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err((name, reason))) => failed.push((name, reason)),
                Err(e) => failed.push(("<unknown>".to_string(), e.to_string())),
            }
        }
        for (name, reason) in &failed {
            tracing::error!("failed to write data file '{name}': {reason}");
            self.pending.retain(|(n, _)| n != name);
            let file = self.data_path().joinpath(name);
            if matches!(file.is_file().await, Ok(true)) {
                if let Err(e) = file.remove_file().await {
                    tracing::error!("failed to delete partial data file '{name}': {e}");
                }
            }
        }
        failed
    }

    /// Persist everything this writer holds and publish it in the manifest.
    ///
    /// The tail batch is written even if smaller than `batch_size`. Under
    /// the lock on `info.json`, this writer's pending files plus any
    /// eager-interim files (from any writer) are merged into the manifest
    /// and the manifest rewritten atomically. If the manifest update fails,
    /// the pending entries are retained so a later `flush` can retry.
    pub async fn flush(&mut self) -> Result<()> {
        self.spawn_batch_write().await?;
        let failures = self.drain_writes().await;

        let own = std::mem::take(&mut self.pending);
        let info_file = self.path.joinpath(INFO_FILE);
        let timeout = Duration::from_secs(CONFIG.flush_lock_timeout_secs);
        let guard = match info_file.lock(Some(timeout)).await {
            Ok(guard) => guard,
            Err(e) => {
                self.pending = own;
                return Err(e.into());
            }
        };

        let merged: Result<Manifest> = async {
            let mut info: Manifest = info_file.read_json().await?;
            let mut additions = own.clone();
            let mut eager_files = Vec::new();
            match self.path.joinpath(EAGER_DIR).riterdir().await {
                Ok(files) => {
                    for f in files {
                        let entries: Vec<(String, u64)> = f.read_json().await?;
                        additions.extend(entries);
                        eager_files.push(f);
                    }
                }
                Err(PathError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            if !additions.is_empty() {
                info.merge_entries(additions);
                info_file.write_json(&info, true).await?;
            }
            for f in eager_files {
                if let Err(e) = f.remove_file().await {
                    tracing::warn!("failed to remove interim flush file '{f}': {e}");
                }
            }
            Ok(info)
        }
        .await;

        match merged {
            Ok(info) => {
                self.info = info;
                *self.seq_cache.lock() = None;
                self.eager_file = None;
                if let Err(e) = guard.release().await {
                    // The lease lapsed while we held it; our merge may have
                    // raced. Re-queue our entries so a retry re-merges them
                    // (merging is idempotent).
                    self.pending = own;
                    return Err(e.into());
                }
            }
            Err(e) => {
                self.pending = own;
                let _ = guard.release().await;
                return Err(e);
            }
        }

        if let Some((name, reason)) = failures.into_iter().next() {
            return Err(StoreError::DataFileWrite { name, reason });
        }
        Ok(())
    }

    /// Persist data files and record their names in a private interim file
    /// under `_flush_eager/`, without taking the manifest lock. The entries
    /// become globally visible when any writer next calls [`flush`].
    ///
    /// This trades visibility for lock-free writes; useful with many
    /// distributed writers hammering a blob-storage manifest.
    ///
    /// [`flush`]: ShardList::flush
    pub async fn flush_eager(&mut self) -> Result<()> {
        self.spawn_batch_write().await?;
        let failures = self.drain_writes().await;
        if let Some((name, reason)) = failures.into_iter().next() {
            return Err(StoreError::DataFileWrite { name, reason });
        }
        if self.pending.is_empty() {
            return Ok(());
        }
        let name = match &self.eager_file {
            Some(name) => name.clone(),
            None => {
                let name = format!(
                    "{}_{}",
                    Utc::now().format("%Y%m%d%H%M%S%.6f"),
                    Uuid::new_v4().simple(),
                );
                self.eager_file = Some(name.clone());
                name
            }
        };
        let file = self.path.joinpath(EAGER_DIR).joinpath(&name);
        // The file may have been consumed by another writer's `flush` since
        // we last wrote it; start over from whatever is there now.
        let mut entries: Vec<(String, u64)> = match file.read_json().await {
            Ok(entries) => entries,
            Err(PathError::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        entries.extend(self.pending.iter().cloned());
        file.write_json(&entries, true).await?;
        // Fold into the local view so len() and reads reflect this writer's
        // own data; the on-disk manifest is updated by the next `flush`.
        self.info
            .merge_entries(std::mem::take(&mut self.pending));
        *self.seq_cache.lock() = None;
        Ok(())
    }

    /// Re-read the manifest to pick up files flushed by other writers.
    pub async fn reload(&mut self) -> Result<()> {
        let info: Manifest = self.path.joinpath(INFO_FILE).read_json().await?;
        self.format = info.validate(&self.path.as_uri())?;
        self.info = info;
        *self.seq_cache.lock() = None;
        Ok(())
    }

    /// The data files as an indexable, streamable sequence. Handles are
    /// cheap and shippable to workers.
    pub fn files(&self) -> FileSeq<T> {
        let data = self.data_path();
        let files = self
            .info
            .data_files_info
            .iter()
            .map(|(name, count, _)| {
                (
                    FileReader::new(data.joinpath(name), self.format, Some(*count)),
                    *count,
                )
            })
            .collect();
        FileSeq::new(self.path.clone(), files)
    }

    /// Random access by index; a negative index counts from the end.
    /// Iteration is the efficient path; this is a convenience.
    pub async fn get(&self, idx: i64) -> Result<T> {
        let len = self.len();
        let resolved = if idx < 0 { idx + len as i64 } else { idx };
        if resolved < 0 || resolved as u64 >= len {
            return Err(StoreError::IndexOutOfRange { index: idx, len });
        }
        let seq = {
            let mut cache = self.seq_cache.lock();
            cache.get_or_insert_with(|| self.files()).clone()
        };
        seq.get(resolved as u64).await
    }

    /// Stream all flushed elements in order, with file prefetch.
    pub fn stream(&self) -> impl Stream<Item = Result<T>> + Send + 'static {
        if !self.buffer.is_empty() || !self.pending.is_empty() {
            tracing::warn!(
                "iterating '{}' with unflushed data; buffered elements are not included",
                self.path,
            );
        }
        self.files().stream()
    }

    /// Data files present under `store/` but absent from the manifest.
    /// These are left by writers that crashed between the data-file write
    /// and the manifest merge; they are invisible to reads and harmless,
    /// and may be deleted by an offline gc pass.
    pub async fn orphans(&self) -> Result<Vec<UPath>> {
        let listed = match self.data_path().riterdir().await {
            Ok(listed) => listed,
            Err(PathError::NotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let known: std::collections::HashSet<&str> = self
            .info
            .data_files_info
            .iter()
            .map(|(name, _, _)| name.as_str())
            .collect();
        Ok(listed
            .into_iter()
            .filter(|p| !known.contains(p.name().as_str()))
            .collect())
    }

    /// Remove the store root and everything under it. Calling this while
    /// other processes hold handles on the same root is the caller's
    /// responsibility; no cross-process synchronization is attempted.
    pub async fn destroy(mut self) -> Result<()> {
        self.buffer.clear();
        self.pending.clear();
        self.writes.abort_all();
        self.temp = false;
        self.path.remove_dir_recursive().await?;
        Ok(())
    }
}

impl<T> Drop for ShardList<T> {
    fn drop(&mut self) {
        if !self.buffer.is_empty() || !self.pending.is_empty() {
            tracing::warn!(
                "dropping ShardList at '{}' with unflushed data; did you forget to flush()?",
                self.path,
            );
        }
        if self.temp && !self.keep {
            if let Some(p) = self.path.as_std_path() {
                if let Err(e) = std::fs::remove_dir_all(&p) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("failed to remove temporary store '{}': {e}", self.path);
                    }
                }
            }
        }
    }
}

/// `<UTC timestamp with microseconds>_<uuid4>_<count>.<ext>`: lexicographic
/// order equals creation order, the uuid rules out collisions between
/// concurrent writers, and the count is redundant self-description.
fn make_file_name(count: usize, ext: &str) -> String {
    format!(
        "{}_{}_{}.{}",
        Utc::now().format("%Y%m%d%H%M%S%.6f"),
        Uuid::new_v4(),
        count,
        ext,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_sort_by_creation_time() {
        let a = make_file_name(10, "pickle_zstd");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = make_file_name(10, "pickle_zstd");
        assert!(a < b);
        assert!(a.ends_with("_10.pickle_zstd"));
    }

    #[tokio::test]
    async fn new_refuses_existing_root() {
        let root = UPath::memory(&format!("shard-list-tests/{}", Uuid::new_v4()));
        let _list: ShardList<i64> = ShardList::new(Some(root.clone()), ListOptions::default())
            .await
            .unwrap();
        let again: Result<ShardList<i64>> =
            ShardList::new(Some(root), ListOptions::default()).await;
        assert!(matches!(
            again.unwrap_err(),
            StoreError::Path(PathError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn temp_store_removes_itself_on_drop() {
        let path = {
            let mut list: ShardList<i64> = ShardList::new(None, ListOptions::default())
                .await
                .unwrap();
            list.append(1).await.unwrap();
            list.flush().await.unwrap();
            list.path().clone()
        };
        assert!(!path.exists().await.unwrap());
    }
}
