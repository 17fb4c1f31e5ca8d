use serde::Deserialize;

/// Which backing store the queue runs on. Selected once at startup; call
/// sites never branch on the backend after that.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Redis,
    Memory,
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Sqlite
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendKind,

    /// Path to the SQLite database file. `None` selects an in-memory
    /// database, which is only useful for tests.
    pub db_path: Option<String>,

    /// Redis connection URL, required when `backend = redis`.
    pub redis_url: Option<String>,

    /// Key prefix for all redis keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    #[serde(default = "default_lease_seconds")]
    pub default_lease_seconds: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub default_poll_interval_ms: u64,

    /// Cadence of the sweep that returns expired `processing` leases to
    /// the retry path.
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,

    /// First retry is delayed `backoff_base_seconds * 2`, then doubles per
    /// attempt up to `backoff_cap_seconds`.
    #[serde(default = "default_backoff_base_seconds")]
    pub backoff_base_seconds: u64,

    #[serde(default = "default_backoff_cap_seconds")]
    pub backoff_cap_seconds: u64,
}

fn default_key_prefix() -> String {
    "relayq".to_owned()
}

fn default_max_retries() -> u32 {
    3
}

fn default_lease_seconds() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_reaper_interval_ms() -> u64 {
    1000
}

fn default_backoff_base_seconds() -> u64 {
    1
}

fn default_backoff_cap_seconds() -> u64 {
    300
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("RELAYQ_").from_env::<Self>()?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            db_path: None,
            redis_url: None,
            key_prefix: default_key_prefix(),
            default_max_retries: default_max_retries(),
            default_lease_seconds: default_lease_seconds(),
            default_poll_interval_ms: default_poll_interval_ms(),
            reaper_interval_ms: default_reaper_interval_ms(),
            backoff_base_seconds: default_backoff_base_seconds(),
            backoff_cap_seconds: default_backoff_cap_seconds(),
        }
    }
}
