use envconfig::Envconfig;
use lazy_static::lazy_static;

/// Tunables for the path layer and the store, loaded once from the
/// environment. Every knob has a default; nothing is mandatory.
#[derive(Debug, Envconfig)]
pub struct Config {
    /// A blob lease older than this is considered stale and may be broken
    /// by a challenger.
    #[envconfig(from = "SHARDLIST_LOCK_LEASE_SECS", default = "120")]
    pub lock_lease_secs: u64,
    /// Interval at which a lease holder refreshes its lease blob.
    #[envconfig(from = "SHARDLIST_LOCK_HEARTBEAT_SECS", default = "20")]
    pub lock_heartbeat_secs: u64,
    /// Poll interval while waiting for a contended lock.
    #[envconfig(from = "SHARDLIST_LOCK_POLL_MS", default = "30")]
    pub lock_poll_ms: u64,
    /// Attempts for transient storage errors (first try included).
    #[envconfig(from = "SHARDLIST_RETRY_ATTEMPTS", default = "3")]
    pub retry_attempts: u32,
    /// Base backoff delay; doubled per attempt, with jitter.
    #[envconfig(from = "SHARDLIST_RETRY_BASE_MS", default = "200")]
    pub retry_base_ms: u64,
    /// Number of data files loaded ahead of the consumer during iteration.
    #[envconfig(from = "SHARDLIST_READ_PREFETCH", default = "2")]
    pub read_prefetch: usize,
    /// Max number of in-flight background data-file writes per writer.
    #[envconfig(from = "SHARDLIST_WRITE_CONCURRENCY", default = "4")]
    pub write_concurrency: usize,
    /// How long `flush` waits for the manifest lock.
    #[envconfig(from = "SHARDLIST_FLUSH_LOCK_TIMEOUT_SECS", default = "300")]
    pub flush_lock_timeout_secs: u64,
}

impl Config {
    pub fn init() -> Config {
        Config::init_from_env().expect("failed to load shardlist config")
    }
}

lazy_static! {
    pub static ref CONFIG: Config = Config::init();
}
