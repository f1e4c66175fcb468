use std::fmt::{self, Debug, Display};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use lazy_static::lazy_static;
use object_store::{
    aws::AmazonS3Builder, gcp::GoogleCloudStorageBuilder, local::LocalFileSystem,
    memory::InMemory, path::Path, ObjectStore, PutMode, PutOptions, PutPayload,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{PathError, Result};
use crate::lock::LockGuard;
use crate::retry::with_retry;

lazy_static! {
    /// One local store rooted at `/`, shared by every local path.
    static ref LOCAL_STORE: Arc<LocalFileSystem> = Arc::new(LocalFileSystem::new());
    /// Process-global in-memory store, so every `memory://` path in the
    /// process sees the same contents.
    static ref MEMORY_STORE: Arc<InMemory> = Arc::new(InMemory::new());
}

/// Which blob backend a [`UPath`] talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobKind {
    Gcs { bucket: String },
    S3 { bucket: String },
    Memory,
}

#[derive(Clone)]
pub struct LocalPath {
    store: Arc<dyn ObjectStore>,
    location: Path,
}

#[derive(Clone)]
pub struct BlobPath {
    store: Arc<dyn ObjectStore>,
    kind: BlobKind,
    location: Path,
}

/// A location in local or blob storage with a uniform operation surface.
///
/// `UPath` values are small and cheap to clone; clones share the underlying
/// store client. The identity of a path is its URI, not its client.
#[derive(Clone)]
pub enum UPath {
    Local(LocalPath),
    Blob(BlobPath),
}

impl UPath {
    /// A path on the local filesystem. Relative inputs are resolved against
    /// the current working directory.
    pub fn local(p: impl AsRef<std::path::Path>) -> Result<UPath> {
        let p = p.as_ref();
        let abs = if p.is_absolute() {
            p.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|source| PathError::Io {
                    path: p.display().to_string(),
                    source,
                })?
                .join(p)
        };
        let location = Path::from_absolute_path(&abs).map_err(|e| PathError::InvalidUri {
            uri: abs.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(UPath::Local(LocalPath {
            store: LOCAL_STORE.clone(),
            location,
        }))
    }

    /// A path in the process-global in-memory store. Mostly useful in tests
    /// and for short-lived scratch data; contents do not survive the process.
    pub fn memory(key: &str) -> UPath {
        UPath::Blob(BlobPath {
            store: MEMORY_STORE.clone(),
            kind: BlobKind::Memory,
            location: join_parts(&Path::default(), key),
        })
    }

    /// Parse `gs://bucket/key`, `s3://bucket/key`, `memory:///key`,
    /// `file:///abs/path`, or a bare absolute filesystem path.
    pub fn parse(uri: &str) -> Result<UPath> {
        if let Some(rest) = uri.strip_prefix("gs://") {
            let (bucket, key) = split_bucket(uri, rest)?;
            let store = GoogleCloudStorageBuilder::new()
                .with_bucket_name(bucket.clone())
                .build()
                .map_err(|e| PathError::from_store(uri, e))?;
            return Ok(UPath::Blob(BlobPath {
                store: Arc::new(store),
                kind: BlobKind::Gcs { bucket },
                location: Path::from(key),
            }));
        }
        if let Some(rest) = uri.strip_prefix("s3://") {
            let (bucket, key) = split_bucket(uri, rest)?;
            let store = AmazonS3Builder::from_env()
                .with_bucket_name(bucket.clone())
                .build()
                .map_err(|e| PathError::from_store(uri, e))?;
            return Ok(UPath::Blob(BlobPath {
                store: Arc::new(store),
                kind: BlobKind::S3 { bucket },
                location: Path::from(key),
            }));
        }
        if let Some(rest) = uri.strip_prefix("memory://") {
            return Ok(UPath::memory(rest.trim_start_matches('/')));
        }
        if let Some(rest) = uri.strip_prefix("file://") {
            return UPath::local(rest);
        }
        if uri.starts_with('/') {
            return UPath::local(uri);
        }
        Err(PathError::InvalidUri {
            uri: uri.to_string(),
            reason: "expected gs://, s3://, memory://, file:// or an absolute path".to_string(),
        })
    }

    fn location(&self) -> &Path {
        match self {
            UPath::Local(p) => &p.location,
            UPath::Blob(p) => &p.location,
        }
    }

    fn with_location(&self, location: Path) -> UPath {
        match self {
            UPath::Local(p) => UPath::Local(LocalPath {
                store: p.store.clone(),
                location,
            }),
            UPath::Blob(p) => UPath::Blob(BlobPath {
                store: p.store.clone(),
                kind: p.kind.clone(),
                location,
            }),
        }
    }

    /// The raw store and object location, for callers that integrate with
    /// `object_store`-native readers directly.
    pub fn store_and_location(&self) -> (Arc<dyn ObjectStore>, Path) {
        match self {
            UPath::Local(p) => (p.store.clone(), p.location.clone()),
            UPath::Blob(p) => (p.store.clone(), p.location.clone()),
        }
    }

    /// Render the path as a URI that [`UPath::parse`] accepts.
    pub fn as_uri(&self) -> String {
        match self {
            UPath::Local(p) => format!("/{}", p.location.as_ref()),
            UPath::Blob(p) => match &p.kind {
                BlobKind::Gcs { bucket } => format!("gs://{}/{}", bucket, p.location.as_ref()),
                BlobKind::S3 { bucket } => format!("s3://{}/{}", bucket, p.location.as_ref()),
                BlobKind::Memory => format!("memory:///{}", p.location.as_ref()),
            },
        }
    }

    /// For local paths, the equivalent `std::path` form.
    pub fn as_std_path(&self) -> Option<std::path::PathBuf> {
        match self {
            UPath::Local(p) => Some(std::path::PathBuf::from(format!(
                "/{}",
                p.location.as_ref()
            ))),
            UPath::Blob(_) => None,
        }
    }

    /// Join a relative path onto this one. `.` segments are dropped and
    /// `..` segments collapse into the parent.
    pub fn joinpath(&self, rel: &str) -> UPath {
        self.with_location(join_parts(self.location(), rel))
    }

    /// The parent path. The parent of a root is the root itself.
    pub fn parent(&self) -> UPath {
        let parts: Vec<String> = self
            .location()
            .parts()
            .map(|p| p.as_ref().to_string())
            .collect();
        let n = parts.len().saturating_sub(1);
        self.with_location(Path::from_iter(parts[..n].iter().map(|s| s.as_str())))
    }

    /// The final path segment, or `""` at a root.
    pub fn name(&self) -> String {
        self.location()
            .parts()
            .last()
            .map(|p| p.as_ref().to_string())
            .unwrap_or_default()
    }

    pub async fn is_file(&self) -> Result<bool> {
        let (store, location) = self.store_and_location();
        match store.head(&location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(PathError::from_store(&self.as_uri(), e)),
        }
    }

    /// A path is a directory iff at least one file lives beneath it.
    pub async fn is_dir(&self) -> Result<bool> {
        let (store, location) = self.store_and_location();
        let prefix = (!location.as_ref().is_empty()).then_some(&location);
        let listing = store
            .list_with_delimiter(prefix)
            .await
            .map_err(|e| PathError::from_store(&self.as_uri(), e))?;
        Ok(!listing.objects.is_empty() || !listing.common_prefixes.is_empty())
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(self.is_file().await? || self.is_dir().await?)
    }

    /// Read the whole file.
    pub async fn read_bytes(&self) -> Result<Bytes> {
        let (store, location) = self.store_and_location();
        with_retry("read", &self.as_uri(), || {
            let store = store.clone();
            let location = location.clone();
            async move { store.get(&location).await?.bytes().await }
        })
        .await
    }

    /// Write the whole file in one atomic PUT. With `overwrite = false` the
    /// write fails with [`PathError::AlreadyExists`] if the target exists;
    /// either way a reader never observes a torn file.
    pub async fn write_bytes(&self, data: impl Into<Bytes>, overwrite: bool) -> Result<()> {
        let (store, location) = self.store_and_location();
        let data: Bytes = data.into();
        let mode = if overwrite {
            PutMode::Overwrite
        } else {
            PutMode::Create
        };
        with_retry("write", &self.as_uri(), || {
            let store = store.clone();
            let location = location.clone();
            let payload = PutPayload::from(data.clone());
            let opts = PutOptions::from(mode.clone());
            async move { store.put_opts(&location, payload, opts).await }
        })
        .await?;
        Ok(())
    }

    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = self.read_bytes().await?;
        serde_json::from_slice(&bytes).map_err(|source| PathError::Json {
            path: self.as_uri(),
            source,
        })
    }

    pub async fn write_json<T: Serialize>(&self, value: &T, overwrite: bool) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(|source| PathError::Json {
            path: self.as_uri(),
            source,
        })?;
        self.write_bytes(bytes, overwrite).await
    }

    /// Immediate children: files and (implied) directories.
    pub async fn iterdir(&self) -> Result<Vec<UPath>> {
        let (store, location) = self.store_and_location();
        let prefix = (!location.as_ref().is_empty()).then_some(&location);
        let listing = store
            .list_with_delimiter(prefix)
            .await
            .map_err(|e| PathError::from_store(&self.as_uri(), e))?;
        let mut out = Vec::with_capacity(listing.objects.len() + listing.common_prefixes.len());
        for meta in listing.objects {
            out.push(self.with_location(meta.location));
        }
        for prefix in listing.common_prefixes {
            out.push(self.with_location(prefix));
        }
        Ok(out)
    }

    /// All files beneath this path, recursively.
    pub async fn riterdir(&self) -> Result<Vec<UPath>> {
        let (store, location) = self.store_and_location();
        let prefix = (!location.as_ref().is_empty()).then_some(&location);
        let mut stream = store.list(prefix);
        let mut out = Vec::new();
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(|e| PathError::from_store(&self.as_uri(), e))?;
            out.push(self.with_location(meta.location));
        }
        Ok(out)
    }

    pub async fn remove_file(&self) -> Result<()> {
        let (store, location) = self.store_and_location();
        with_retry("delete", &self.as_uri(), || {
            let store = store.clone();
            let location = location.clone();
            async move { store.delete(&location).await }
        })
        .await
    }

    /// Remove every file beneath this path; returns the number removed.
    /// On a local filesystem the emptied directory tree is removed as well.
    pub async fn remove_dir_recursive(&self) -> Result<usize> {
        let files = self.riterdir().await?;
        let mut n = 0;
        for f in &files {
            match f.remove_file().await {
                Ok(()) => n += 1,
                Err(PathError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if let Some(p) = self.as_std_path() {
            match tokio::fs::remove_dir_all(&p).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(PathError::Io {
                        path: self.as_uri(),
                        source,
                    })
                }
            }
        }
        Ok(n)
    }

    /// Acquire an exclusive advisory lock associated with this path.
    ///
    /// `timeout` semantics: `Some(Duration::ZERO)` makes a single attempt;
    /// `None` waits indefinitely; anything else waits until the deadline and
    /// then fails with [`PathError::LockTimeout`]. The lock is not
    /// re-entrant: locking a path already held by this process blocks like
    /// any other contender.
    pub async fn lock(&self, timeout: Option<Duration>) -> Result<LockGuard> {
        match self {
            UPath::Local(_) => {
                let sentinel = {
                    let mut p = self.as_std_path().expect("local path");
                    let name = format!("{}.lock", self.name());
                    p.set_file_name(name);
                    p
                };
                LockGuard::acquire_local(self.as_uri(), sentinel, timeout).await
            }
            UPath::Blob(p) => {
                let parent = self.parent();
                let sentinel = join_parts(parent.location(), &format!("{}.lock", self.name()));
                LockGuard::acquire_lease(self.as_uri(), p.store.clone(), sentinel, timeout).await
            }
        }
    }
}

impl Display for UPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_uri())
    }
}

impl Debug for UPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UPath({})", self.as_uri())
    }
}

impl PartialEq for UPath {
    fn eq(&self, other: &Self) -> bool {
        self.as_uri() == other.as_uri()
    }
}

impl Eq for UPath {}

fn split_bucket(uri: &str, rest: &str) -> Result<(String, String)> {
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(PathError::InvalidUri {
            uri: uri.to_string(),
            reason: "missing bucket name".to_string(),
        });
    }
    Ok((bucket.to_string(), key.to_string()))
}

/// Join `rel` onto `base`, collapsing `.` and `..` segments.
fn join_parts(base: &Path, rel: &str) -> Path {
    let mut parts: Vec<String> = base.parts().map(|p| p.as_ref().to_string()).collect();
    for seg in rel.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            seg => parts.push(seg.to_string()),
        }
    }
    Path::from_iter(parts.iter().map(|s| s.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> UPath {
        UPath::memory(&format!("upath-tests/{}/{}", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn joinpath_collapses_dots() {
        let p = UPath::memory("a/b/c");
        assert_eq!(p.joinpath("../d").as_uri(), "memory:///a/b/d");
        assert_eq!(p.joinpath("./e/../f").as_uri(), "memory:///a/b/c/f");
        assert_eq!(p.parent().as_uri(), "memory:///a/b");
        assert_eq!(p.name(), "c");
    }

    #[test]
    fn parse_round_trips() {
        for uri in ["/tmp/some/file.json", "memory:///x/y"] {
            assert_eq!(UPath::parse(uri).unwrap().as_uri(), uri);
        }
        assert!(UPath::parse("relative/path").is_err());
    }

    #[tokio::test]
    async fn write_without_overwrite_fails_on_existing() {
        let p = scratch("create").joinpath("f.bin");
        p.write_bytes(&b"one"[..], false).await.unwrap();
        let err = p.write_bytes(&b"two"[..], false).await.unwrap_err();
        assert!(matches!(err, PathError::AlreadyExists { .. }));
        p.write_bytes(&b"three"[..], true).await.unwrap();
        assert_eq!(&p.read_bytes().await.unwrap()[..], b"three");
    }

    #[tokio::test]
    async fn directories_exist_only_through_files() {
        let root = scratch("dirs");
        assert!(!root.exists().await.unwrap());
        let f = root.joinpath("sub/inner/data.bin");
        f.write_bytes(&b"x"[..], false).await.unwrap();
        assert!(root.is_dir().await.unwrap());
        assert!(root.joinpath("sub").is_dir().await.unwrap());
        assert!(f.is_file().await.unwrap());

        let children = root.iterdir().await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name(), "sub");

        let removed = root.remove_dir_recursive().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!root.exists().await.unwrap());
    }

    #[tokio::test]
    async fn riterdir_yields_files_recursively() {
        let root = scratch("riter");
        for name in ["a.bin", "d/b.bin", "d/e/c.bin"] {
            root.joinpath(name)
                .write_bytes(&b"x"[..], false)
                .await
                .unwrap();
        }
        let mut names: Vec<String> = root
            .riterdir()
            .await
            .unwrap()
            .iter()
            .map(|p| p.name())
            .collect();
        names.sort();
        assert_eq!(names, ["a.bin", "b.bin", "c.bin"]);
    }

    #[tokio::test]
    async fn local_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let root = UPath::local(dir.path()).unwrap();
        let f = root.joinpath("nested/out.json");
        f.write_json(&serde_json::json!({"k": 1}), false).await.unwrap();
        let v: serde_json::Value = f.read_json().await.unwrap();
        assert_eq!(v["k"], 1);
        assert!(root.is_dir().await.unwrap());
        root.remove_dir_recursive().await.unwrap();
        assert!(!dir.path().exists());
    }
}
