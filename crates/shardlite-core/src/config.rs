//! Configuration for a shardlite deployment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardError};
use crate::pool::PoolConfig;
use crate::strategy::ShardId;
use crate::txn::coordinator::CoordinatorConfig;

/// Longest accepted connection or phase timeout (one week).
pub const MAX_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Configuration for a set of shards stored under one directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardliteConfig {
    /// Number of shards to distribute data across.
    pub num_shards: u32,
    /// Directory holding the `shard_<id>.db` files.
    pub db_dir: PathBuf,
    /// Connection acquisition and SQLite busy timeout (seconds).
    pub connection_timeout_secs: f64,
    /// Create `db_dir` when it does not exist.
    pub auto_create_dirs: bool,
    /// Hard cap on concurrently checked-out connections per shard.
    pub max_connections_per_shard: usize,
    /// Only hand a pooled connection back to the thread that opened it.
    pub same_thread_required: bool,
    /// Worker threads used for 2PC phases and fan-out operations.
    pub max_workers: usize,
    /// Upper bound on one 2PC phase (seconds).
    pub phase_timeout_secs: f64,
}

impl Default for ShardliteConfig {
    fn default() -> Self {
        Self {
            num_shards: 4,
            db_dir: PathBuf::from("./data"),
            connection_timeout_secs: 30.0,
            auto_create_dirs: true,
            max_connections_per_shard: 10,
            same_thread_required: false,
            max_workers: 4,
            phase_timeout_secs: 60.0,
        }
    }
}

impl ShardliteConfig {
    /// Default configuration rooted at `db_dir`.
    pub fn with_dir(db_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_dir: db_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(yaml)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build from an already-parsed key/value document.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let cfg: Self = serde_json::from_value(value)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a `.json`, `.yaml` or `.yml` configuration file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let parse: fn(&str) -> Result<Self> = match ext.as_str() {
            "json" => Self::from_json_str,
            "yaml" | "yml" => Self::from_yaml_str,
            _ => {
                return Err(ShardError::Config(format!(
                    "unsupported configuration format {ext:?} for {}",
                    path.display()
                )))
            }
        };
        let text = std::fs::read_to_string(path)?;
        parse(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_shards == 0 {
            return Err(ShardError::Config("num_shards must be positive".into()));
        }
        if self.db_dir.as_os_str().is_empty() {
            return Err(ShardError::Config("db_dir must not be empty".into()));
        }
        check_timeout("connection_timeout_secs", self.connection_timeout_secs)?;
        if self.max_connections_per_shard == 0 {
            return Err(ShardError::Config(
                "max_connections_per_shard must be positive".into(),
            ));
        }
        if self.max_workers == 0 {
            return Err(ShardError::Config("max_workers must be positive".into()));
        }
        check_timeout("phase_timeout_secs", self.phase_timeout_secs)?;
        Ok(())
    }

    /// Path of the database file backing `shard_id`.
    pub fn shard_file_path(&self, shard_id: ShardId) -> Result<PathBuf> {
        if shard_id >= self.num_shards {
            return Err(ShardError::UnknownShard(shard_id));
        }
        Ok(self.db_dir.join(format!("shard_{shard_id}.db")))
    }

    pub fn all_shard_paths(&self) -> BTreeMap<ShardId, PathBuf> {
        (0..self.num_shards)
            .map(|id| (id, self.db_dir.join(format!("shard_{id}.db"))))
            .collect()
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.max_connections_per_shard,
            acquire_timeout: timeout_from_secs(self.connection_timeout_secs),
            same_thread_required: self.same_thread_required,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_workers: self.max_workers,
            phase_timeout: timeout_from_secs(self.phase_timeout_secs),
        }
    }
}

fn check_timeout(field: &str, secs: f64) -> Result<()> {
    if secs > 0.0 && secs <= MAX_TIMEOUT.as_secs_f64() {
        return Ok(());
    }
    Err(ShardError::Config(format!(
        "{field} must be greater than 0 and at most {} seconds, got {secs}",
        MAX_TIMEOUT.as_secs()
    )))
}

/// Out-of-range values saturate instead of panicking; `validate` rejects them.
fn timeout_from_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.min(MAX_TIMEOUT.as_secs_f64())).unwrap_or(Duration::ZERO)
}
