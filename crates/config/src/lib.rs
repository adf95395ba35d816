//! # Config - TideDB engine configuration
//!
//! Every knob the engine consumes lives in [`EngineConfig`]. Values are
//! either set programmatically through the `with_*` builders or loaded from
//! `TIDEDB_*` environment variables with [`EngineConfig::from_env`].
//!
//! | Variable                    | Field                  | Default          |
//! |-----------------------------|------------------------|------------------|
//! | `TIDEDB_BASE_DIR`           | `base_dir`             | `data`           |
//! | `TIDEDB_LOG_DIR`            | `log_dir`              | `<base_dir>/log` |
//! | `TIDEDB_WORKERS`            | `worker_count`         | `1`              |
//! | `TIDEDB_MAX_QUEUE`          | `max_queue_len`        | `0` (unbounded)  |
//! | `TIDEDB_SYNC_MODE`          | `sync_mode`            | `sync_write`     |
//! | `TIDEDB_PSEUDO_SYNC_MS`     | pseudo-sync interval   | `200`            |
//! | `TIDEDB_CHECKPOINT_SECS`    | `checkpoint_interval`  | off              |
//! | `TIDEDB_MAX_LOG_SIZE`       | `max_log_size`         | 16 MiB           |
//! | `TIDEDB_COMPACTION_TRIGGER` | `compaction_trigger`   | `4`              |
//! | `TIDEDB_ROLE`               | replication role       | no replication   |

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default interval between batched fsyncs in pseudo-sync mode.
pub const DEFAULT_PSEUDO_SYNC_WAIT_MS: u64 = 200;
/// Default size of the active WAL segment that triggers a checkpoint.
pub const DEFAULT_MAX_LOG_SIZE: u64 = 16 * 1024 * 1024;
/// Default number of runs per index that triggers a merge.
pub const DEFAULT_COMPACTION_TRIGGER: usize = 4;
/// Default byte length of one CHUNK request during a full load.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;
/// Default number of missing entries a slave will request via REPLICA before
/// falling back to a full LOAD.
pub const DEFAULT_MAX_REPLICA_GAP: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Durability policy of the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// fsync (data + metadata) before acknowledging an append.
    SyncWrite,
    /// fdatasync before acknowledging an append.
    FDataSync,
    /// Acknowledge on enqueue; the logger fsyncs on its own schedule.
    Async,
    /// Acknowledge once written to the OS, fsync in batches every `wait_ms`.
    PseudoSync { wait_ms: u64 },
}

impl SyncMode {
    /// True when appends are acknowledged before reaching stable storage.
    pub fn is_async(&self) -> bool {
        matches!(self, SyncMode::Async)
    }

    /// Interval of the logger's background fsync, if this mode has one.
    pub fn sync_interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Async => Some(Duration::from_millis(1000)),
            SyncMode::PseudoSync { wait_ms } => Some(Duration::from_millis((*wait_ms).max(1))),
            SyncMode::SyncWrite | SyncMode::FDataSync => None,
        }
    }
}

impl FromStr for SyncMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sync_write" | "sync" => Ok(SyncMode::SyncWrite),
            "fdatasync" => Ok(SyncMode::FDataSync),
            "async" => Ok(SyncMode::Async),
            "pseudo_sync" => Ok(SyncMode::PseudoSync {
                wait_ms: DEFAULT_PSEUDO_SYNC_WAIT_MS,
            }),
            _ => Err(ConfigError::InvalidValue {
                key: "sync_mode".into(),
                value: s.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(Role::Master),
            "slave" => Ok(Role::Slave),
            _ => Err(ConfigError::InvalidValue {
                key: "role".into(),
                value: s.into(),
            }),
        }
    }
}

/// Settings for master/slave log shipping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationConfig {
    pub local_address: String,
    pub role: Role,
    /// Address of the master. Required for slaves.
    pub master: Option<String>,
    pub slaves: Vec<String>,
    /// Acknowledgments required before a write completes. 0 means no waiting,
    /// `slaves.len()` means fully synchronous.
    pub sync_n: usize,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub chunk_size: u64,
    pub max_replica_gap: u64,
    pub heartbeat_interval: Option<Duration>,
}

impl ReplicationConfig {
    pub fn master(local_address: impl Into<String>, slaves: Vec<String>, sync_n: usize) -> Self {
        Self {
            local_address: local_address.into(),
            role: Role::Master,
            master: None,
            slaves,
            sync_n,
            ..Self::base()
        }
    }

    pub fn slave(local_address: impl Into<String>, master: impl Into<String>) -> Self {
        Self {
            local_address: local_address.into(),
            role: Role::Slave,
            master: Some(master.into()),
            ..Self::base()
        }
    }

    fn base() -> Self {
        Self {
            local_address: String::new(),
            role: Role::Master,
            master: None,
            slaves: Vec::new(),
            sync_n: 0,
            request_timeout: Duration::from_secs(5),
            max_retries: 3,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_replica_gap: DEFAULT_MAX_REPLICA_GAP,
            heartbeat_interval: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_replica_gap(mut self, gap: u64) -> Self {
        self.max_replica_gap = gap;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }
        match self.role {
            Role::Master if self.sync_n > self.slaves.len() => Err(ConfigError::Invalid(format!(
                "sync_n {} exceeds the number of slaves ({})",
                self.sync_n,
                self.slaves.len()
            ))),
            Role::Slave if self.master.is_none() => {
                Err(ConfigError::Invalid("a slave needs a master address".into()))
            }
            _ => Ok(()),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub base_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Number of worker threads. 0 executes requests on the caller thread.
    pub worker_count: usize,
    /// Maximum queued requests per worker. 0 means unbounded.
    pub max_queue_len: usize,
    pub sync_mode: SyncMode,
    pub checkpoint_interval: Option<Duration>,
    /// Active segment size that triggers a checkpoint. 0 disables the trigger.
    pub max_log_size: u64,
    /// Runs per index that trigger a merge. 0 disables compaction.
    pub compaction_trigger: usize,
    pub replication: Option<ReplicationConfig>,
}

impl EngineConfig {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let base_dir = base_dir.as_ref().to_path_buf();
        Self {
            log_dir: base_dir.join("log"),
            base_dir,
            worker_count: 1,
            max_queue_len: 0,
            sync_mode: SyncMode::SyncWrite,
            checkpoint_interval: None,
            max_log_size: DEFAULT_MAX_LOG_SIZE,
            compaction_trigger: DEFAULT_COMPACTION_TRIGGER,
            replication: None,
        }
    }

    pub fn with_log_dir(mut self, log_dir: impl AsRef<Path>) -> Self {
        self.log_dir = log_dir.as_ref().to_path_buf();
        self
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_max_queue_len(mut self, max_queue_len: usize) -> Self {
        self.max_queue_len = max_queue_len;
        self
    }

    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Option<Duration>) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_max_log_size(mut self, max_log_size: u64) -> Self {
        self.max_log_size = max_log_size;
        self
    }

    pub fn with_compaction_trigger(mut self, trigger: usize) -> Self {
        self.compaction_trigger = trigger;
        self
    }

    pub fn with_replication(mut self, replication: ReplicationConfig) -> Self {
        self.replication = Some(replication);
        self
    }

    /// Loads a configuration from `TIDEDB_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup. `from_env` uses
    /// the process environment; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_dir = lookup("TIDEDB_BASE_DIR").unwrap_or_else(|| "data".to_string());
        let mut cfg = EngineConfig::new(base_dir);

        if let Some(dir) = lookup("TIDEDB_LOG_DIR") {
            cfg.log_dir = PathBuf::from(dir);
        }
        cfg.worker_count = parse_or(&lookup, "TIDEDB_WORKERS", cfg.worker_count)?;
        cfg.max_queue_len = parse_or(&lookup, "TIDEDB_MAX_QUEUE", cfg.max_queue_len)?;
        if let Some(mode) = lookup("TIDEDB_SYNC_MODE") {
            cfg.sync_mode = mode.parse()?;
        }
        if let SyncMode::PseudoSync { wait_ms } = &mut cfg.sync_mode {
            *wait_ms = parse_or(&lookup, "TIDEDB_PSEUDO_SYNC_MS", *wait_ms)?;
        }
        let secs: u64 = parse_or(&lookup, "TIDEDB_CHECKPOINT_SECS", 0)?;
        cfg.checkpoint_interval = (secs > 0).then(|| Duration::from_secs(secs));
        cfg.max_log_size = parse_or(&lookup, "TIDEDB_MAX_LOG_SIZE", cfg.max_log_size)?;
        cfg.compaction_trigger =
            parse_or(&lookup, "TIDEDB_COMPACTION_TRIGGER", cfg.compaction_trigger)?;

        if let Some(role) = lookup("TIDEDB_ROLE") {
            let local = lookup("TIDEDB_LOCAL_ADDR").unwrap_or_default();
            let mut repl = match role.parse::<Role>()? {
                Role::Master => {
                    let slaves = lookup("TIDEDB_SLAVES")
                        .map(|s| {
                            s.split(',')
                                .map(str::trim)
                                .filter(|s| !s.is_empty())
                                .map(String::from)
                                .collect()
                        })
                        .unwrap_or_default();
                    ReplicationConfig::master(local, slaves, 0)
                }
                Role::Slave => {
                    let master = lookup("TIDEDB_MASTER").ok_or_else(|| {
                        ConfigError::Invalid("TIDEDB_MASTER is required for slaves".into())
                    })?;
                    ReplicationConfig::slave(local, master)
                }
            };
            repl.sync_n = parse_or(&lookup, "TIDEDB_SYNC_N", 0)?;
            cfg.replication = Some(repl);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("base_dir must not be empty".into()));
        }
        if let SyncMode::PseudoSync { wait_ms: 0 } = self.sync_mode {
            return Err(ConfigError::Invalid(
                "pseudo-sync interval must be positive".into(),
            ));
        }
        if let Some(repl) = &self.replication {
            repl.validate()?;
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests;
