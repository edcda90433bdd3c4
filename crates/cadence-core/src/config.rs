use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_MAX_INTERVAL_SECS: u64 = 5; // upper bound between two ticks
pub const DEFAULT_STANDBY_POLL_SECS: u64 = 5; // leadership retry cadence
pub const DEFAULT_LOCK_TTL_SECS: u64 = 30;
pub const DEFAULT_LOCK_KEY: &str = "cadence:beat:leader";
pub const DEFAULT_QUEUE: &str = "cadence";

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Tick loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA timezone used to evaluate crontab entries (e.g. "Europe/Berlin").
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// The engine never sleeps longer than this, so change-marker bumps are
    /// noticed within this bound.
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,
    /// Minimum spacing between two write-backs of the dirty set.
    /// 0 flushes on every tick that has something to write.
    #[serde(default)]
    pub sync_every_secs: u64,
    /// Sleep between leadership attempts while another instance leads.
    #[serde(default = "default_standby_poll")]
    pub standby_poll_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            max_interval_secs: DEFAULT_MAX_INTERVAL_SECS,
            sync_every_secs: 0,
            standby_poll_secs: DEFAULT_STANDBY_POLL_SECS,
        }
    }
}

/// Leadership lock settings.
///
/// Without `redis_url` the lock lives in-process, which is only correct when
/// a single beat instance runs against the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_key")]
    pub key: String,
    #[serde(default = "default_lock_ttl")]
    pub ttl_secs: u64,
    pub redis_url: Option<String>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key: default_lock_key(),
            ttl_secs: DEFAULT_LOCK_TTL_SECS,
            redis_url: None,
        }
    }
}

/// Where fired entries are handed off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Redis broker for `LPUSH` hand-off. `None` logs fired entries only.
    pub redis_url: Option<String>,
    /// Queue used when an entry carries no queue routing hint.
    #[serde(default = "default_queue")]
    pub default_queue: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            default_queue: default_queue(),
        }
    }
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_max_interval() -> u64 {
    DEFAULT_MAX_INTERVAL_SECS
}
fn default_standby_poll() -> u64 {
    DEFAULT_STANDBY_POLL_SECS
}
fn default_lock_key() -> String {
    DEFAULT_LOCK_KEY.to_string()
}
fn default_lock_ttl() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}
fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CADENCE_SCHEDULER__MAX_INTERVAL_SECS=10`. A missing file is not an
    /// error; every section falls back to its defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))?;

        tracing::debug!(path = %path, "configuration loaded");
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
