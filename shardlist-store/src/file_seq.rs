//! An indexable, streamable sequence over a list of data files.

use futures::stream::{self, Stream, StreamExt};
use serde::de::DeserializeOwned;
use shardlist_config::CONFIG;
use shardlist_path::UPath;

use crate::error::{Result, StoreError};
use crate::file_reader::FileReader;

/// A sequence of [`FileReader`]s plus cumulative element counts, which turn
/// a global element index into `(file, offset)` with one binary search.
pub struct FileSeq<T> {
    root: UPath,
    readers: Vec<FileReader<T>>,
    cumulative: Vec<u64>,
}

impl<T> Clone for FileSeq<T> {
    fn clone(&self) -> Self {
        FileSeq {
            root: self.root.clone(),
            readers: self.readers.clone(),
            cumulative: self.cumulative.clone(),
        }
    }
}

impl<T: DeserializeOwned + Send + Sync + 'static> std::fmt::Debug for FileSeq<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FileSeq({} elements in {} files at '{}')",
            self.total(),
            self.num_files(),
            self.root,
        )
    }
}

impl<T: DeserializeOwned + Send + Sync + 'static> FileSeq<T> {
    pub fn new(root: UPath, files: Vec<(FileReader<T>, u64)>) -> FileSeq<T> {
        let mut readers = Vec::with_capacity(files.len());
        let mut cumulative = Vec::with_capacity(files.len());
        let mut running = 0u64;
        for (reader, count) in files {
            running += count;
            readers.push(reader);
            cumulative.push(running);
        }
        FileSeq {
            root,
            readers,
            cumulative,
        }
    }

    pub fn num_files(&self) -> usize {
        self.readers.len()
    }

    /// Total element count across all files.
    pub fn total(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }

    pub fn cumulative_counts(&self) -> &[u64] {
        &self.cumulative
    }

    /// The underlying handles, for shipping to workers.
    pub fn readers(&self) -> &[FileReader<T>] {
        &self.readers
    }

    pub fn reader(&self, idx: usize) -> Option<&FileReader<T>> {
        self.readers.get(idx)
    }

    /// Map a global element index to `(file index, offset within file)`.
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

    pub async fn get(&self, idx: u64) -> Result<T>
    where
        T: Clone,
    {
        let (file, offset) = self.locate(idx).ok_or(StoreError::IndexOutOfRange {
            index: idx as i64,
            len: self.total(),
        })?;
        self.readers[file].get(offset).await
    }

    /// Stream every element in file order. The next few files are loaded
    /// ahead of the consumer so that decoding overlaps consumption;
    /// dropping the stream abandons any loads still in flight.
    pub fn stream(&self) -> impl Stream<Item = Result<T>> + Send + 'static
    where
        T: Clone,
    {
        let readers = self.readers.clone();
        let prefetch = CONFIG.read_prefetch.max(1);
        stream::iter(readers)
            .map(|reader| async move { reader.load().await })
            .buffered(prefetch)
            .flat_map(|loaded| match loaded {
                Ok(rows) => {
                    let rows: Vec<Result<T>> = rows.iter().cloned().map(Ok).collect();
                    stream::iter(rows)
                }
                Err(e) => stream::iter(vec![Err(e)]),
            })
    }
}
