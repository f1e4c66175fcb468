//! A persistent work-distribution queue.
//!
//! A `Multiplexer` hands the elements of a small, pre-enumerated dataset
//! to cooperating workers so that each element is consumed by exactly one
//! worker. The dataset and a per-session counter live under a [`UPath`];
//! workers may be threads, processes, or machines, as long as they can
//! reach the path. Every claim is one read-increment-write of the counter
//! under the path lock, so the overhead per element is real: elements are
//! meant to be control parameters that trigger substantial work, not raw
//! data.
//!
//! Layout under the multiplexer root:
//!
//! ```text
//! info.json                     the items, their count, creation time
//! sessions/<uuid>/next_index    high-water index, overwritten under lock
//! sessions/<uuid>/finished      sentinel, written once exhausted
//! ```

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shardlist_path::{PathError, UPath};
use uuid::Uuid;

pub const INFO_FILE: &str = "info.json";
pub const SESSIONS_DIR: &str = "sessions";
pub const NEXT_INDEX_FILE: &str = "next_index";
pub const FINISHED_FILE: &str = "finished";

pub type Result<T> = std::result::Result<T, MuxError>;

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("this multiplexer is not participating in a read session")]
    NoSession,

    #[error("a multiplexer needs at least one item")]
    EmptyItems,

    #[error("corrupt session counter at '{path}': {reason}")]
    CorruptCounter { path: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MuxInfo<T> {
    n_items: u64,
    items: Vec<T>,
    created_at: String,
}

/// Status of a read session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStat {
    pub total: u64,
    pub next: u64,
    pub finished: bool,
}

pub struct Multiplexer<T> {
    path: UPath,
    session_id: Option<String>,
    items: Vec<Option<T>>,
    n_items: u64,
    timeout: Option<Duration>,
    worker_id: String,
}

impl<T> Multiplexer<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Persist `items` under `path` and return a coordinator handle. The
    /// handle participates in no session; call
    /// [`create_read_session`](Multiplexer::create_read_session) and hand
    /// the session id to workers.
    pub async fn new(items: Vec<T>, path: UPath) -> Result<Multiplexer<T>> {
        if items.is_empty() {
            return Err(MuxError::EmptyItems);
        }
        let info = MuxInfo {
            n_items: items.len() as u64,
            items,
            created_at: Utc::now().to_rfc3339(),
        };
        path.joinpath(INFO_FILE).write_json(&info, false).await?;
        Ok(Multiplexer {
            path,
            session_id: None,
            n_items: info.n_items,
            items: info.items.into_iter().map(Some).collect(),
            timeout: None,
            worker_id: default_worker_id(),
        })
    }

    /// Open the multiplexer at `path` as a participant in `session_id`.
    pub async fn join(path: UPath, session_id: &str) -> Result<Multiplexer<T>> {
        let info: MuxInfo<T> = path.joinpath(INFO_FILE).read_json().await?;
        Ok(Multiplexer {
            path,
            session_id: Some(session_id.to_string()),
            n_items: info.n_items,
            items: info.items.into_iter().map(Some).collect(),
            timeout: None,
            worker_id: default_worker_id(),
        })
    }

    /// Max wait for the per-claim counter lock. `None` (the default)
    /// waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// A label for this worker, used only in logs.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn path(&self) -> &UPath {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.n_items
    }

    pub fn is_empty(&self) -> bool {
        self.n_items == 0
    }

    fn session_dir(&self, session_id: &str) -> UPath {
        self.path.joinpath(SESSIONS_DIR).joinpath(session_id)
    }

    /// Start a new read session and return its id. Sessions are
    /// independent: each consumes the full dataset once, split across the
    /// workers that join it. This call does not make the current handle a
    /// participant.
    pub async fn create_read_session(&self) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        self.session_dir(&session_id)
            .joinpath(NEXT_INDEX_FILE)
            .write_bytes(Bytes::from_static(b"0"), false)
            .await?;
        Ok(session_id)
    }

    /// Claim the next unconsumed element of the session, or `None` when
    /// the dataset is exhausted. Each element is claimed by exactly one
    /// worker across the whole session.
    pub async fn next(&mut self) -> Result<Option<T>> {
        let session_id = self.session_id.clone().ok_or(MuxError::NoSession)?;
        let counter = self.session_dir(&session_id).joinpath(NEXT_INDEX_FILE);
        let guard = counter.lock(self.timeout).await?;
        let claimed: Result<Option<u64>> = async {
            let n = read_counter(&counter).await?;
            if n >= self.n_items {
                let finished = self.session_dir(&session_id).joinpath(FINISHED_FILE);
                match finished.write_bytes(Bytes::new(), false).await {
                    Ok(()) | Err(PathError::AlreadyExists { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                return Ok(None);
            }
            counter
                .write_bytes(Bytes::from((n + 1).to_string()), true)
                .await?;
            Ok(Some(n))
        }
        .await;
        let released = guard.release().await;
        let claimed = claimed?;
        // A lost lease means the increment may have raced with another
        // claim; the element must not be handed out.
        released?;

        match claimed {
            None => Ok(None),
            Some(n) => {
                tracing::debug!(
                    "worker '{}' claimed index {n} of '{}'",
                    self.worker_id,
                    self.path,
                );
                Ok(self.items[n as usize].take())
            }
        }
    }

    /// Status of a session, by id.
    pub async fn stat(&self, session_id: &str) -> Result<SessionStat> {
        let next = read_counter(&self.session_dir(session_id).joinpath(NEXT_INDEX_FILE)).await?;
        Ok(SessionStat {
            total: self.n_items,
            next,
            finished: next >= self.n_items,
        })
    }

    /// Whether every element of the session has been claimed.
    pub async fn done(&self, session_id: &str) -> Result<bool> {
        Ok(self.stat(session_id).await?.finished)
    }

    /// Delete the dataset and all session state.
    pub async fn destroy(self) -> Result<()> {
        self.path.remove_dir_recursive().await?;
        Ok(())
    }
}

async fn read_counter(counter: &UPath) -> Result<u64> {
    let bytes = counter.read_bytes().await?;
    std::str::from_utf8(&bytes)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| MuxError::CorruptCounter {
            path: counter.as_uri(),
            reason: "expected a decimal integer".to_string(),
        })
}

fn default_worker_id() -> String {
    format!("pid-{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn coordinator_handle_is_not_a_participant() {
        let path = UPath::memory(&format!("mux-tests/{}", Uuid::new_v4()));
        let mut mux = Multiplexer::new(vec![1i64, 2, 3], path).await.unwrap();
        assert_eq!(mux.len(), 3);
        assert!(matches!(mux.next().await.unwrap_err(), MuxError::NoSession));
    }

    #[tokio::test]
    async fn single_worker_drains_in_order() {
        let path = UPath::memory(&format!("mux-tests/{}", Uuid::new_v4()));
        let mux = Multiplexer::new((0..5i64).collect(), path.clone())
            .await
            .unwrap();
        let session = mux.create_read_session().await.unwrap();

        let mut worker: Multiplexer<i64> = Multiplexer::join(path, &session).await.unwrap();
        let mut got = Vec::new();
        while let Some(v) = worker.next().await.unwrap() {
            got.push(v);
        }
        assert_eq!(got, [0, 1, 2, 3, 4]);
        assert!(mux.done(&session).await.unwrap());
        assert_eq!(
            mux.stat(&session).await.unwrap(),
            SessionStat {
                total: 5,
                next: 5,
                finished: true,
            }
        );
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let path = UPath::memory(&format!("mux-tests/{}", Uuid::new_v4()));
        let mux = Multiplexer::new(vec!["a".to_string(), "b".to_string()], path.clone())
            .await
            .unwrap();
        let s1 = mux.create_read_session().await.unwrap();
        let s2 = mux.create_read_session().await.unwrap();

        let mut w1: Multiplexer<String> = Multiplexer::join(path.clone(), &s1).await.unwrap();
        while w1.next().await.unwrap().is_some() {}
        assert!(mux.done(&s1).await.unwrap());
        assert!(!mux.done(&s2).await.unwrap());
    }
}
