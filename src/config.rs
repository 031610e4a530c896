//! Configuration for the state layer and its namespaces.

use std::path::{Path, PathBuf};
use std::time::Duration;

pub const USERS_NAMESPACE: &str = "users";
pub const BANK_NAMESPACE: &str = "bank";
pub const CHANNEL_SETTINGS_NAMESPACE: &str = "channel-settings";
pub const CHANNEL_COOLDOWNS_NAMESPACE: &str = "channels";
pub const CHANNEL_COOLDOWNS_FILE: &str = "CDD";

/// Where an entity's document lives under its namespace directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentLayout {
    /// `<root>/<namespace>/<platform>/<id>.json`
    Flat,
    /// `<root>/<namespace>/<platform>/<id>/<file_stem>.json`
    EntityDirectory { file_stem: String },
}

/// What a read of an absent attribute does with the default it creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDefaultPolicy {
    /// Default goes into the cached document only (persisted with the next flush).
    CacheOnly,
    /// Default is persisted immediately.
    WriteThrough,
}

/// One namespace: storage root, layout, cache bound, read-default policy.
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    pub name: String,
    pub root: PathBuf,
    pub layout: DocumentLayout,
    pub cache_ceiling: usize,
    pub read_default_policy: ReadDefaultPolicy,
}

impl NamespaceConfig {
    pub fn new(name: &str, root: impl AsRef<Path>) -> Self {
        Self {
            name: name.to_string(),
            root: root.as_ref().to_path_buf(),
            layout: DocumentLayout::Flat,
            cache_ceiling: 1000,
            read_default_policy: ReadDefaultPolicy::WriteThrough,
        }
    }

    pub fn layout(mut self, layout: DocumentLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn cache_ceiling(mut self, ceiling: usize) -> Self {
        self.cache_ceiling = ceiling;
        self
    }

    pub fn read_default_policy(mut self, policy: ReadDefaultPolicy) -> Self {
        self.read_default_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() || self.name.contains(['/', '\\']) {
            return Err(format!("Invalid namespace name '{}'", self.name));
        }
        if self.cache_ceiling == 0 {
            return Err(format!("Namespace '{}': cache_ceiling must be > 0", self.name));
        }
        if let DocumentLayout::EntityDirectory { file_stem } = &self.layout {
            if file_stem.is_empty() || file_stem.contains(['/', '\\']) {
                return Err(format!("Namespace '{}': invalid file stem '{}'", self.name, file_stem));
            }
        }
        Ok(())
    }
}

/// State layer configuration
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Root for users, channel settings and channel cooldown documents
    pub base_dir: PathBuf,

    /// Root for the bank namespace
    pub bank_dir: PathBuf,

    pub users_cache_ceiling: usize,

    pub bank_cache_ceiling: usize,

    /// Shared by channel settings and channel cooldown documents
    pub channel_cache_ceiling: usize,

    /// Idle time after which an unheld entity slot may be swept
    pub lock_idle_horizon: Duration,

    /// How often the slot sweeper runs
    pub sweep_interval: Duration,

    /// Whether defaults created by reads are written through to disk
    pub persist_read_defaults: bool,
}

impl StateConfig {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let base_dir = base_dir.as_ref().to_path_buf();
        Self {
            bank_dir: base_dir.join("economy"),
            base_dir,
            users_cache_ceiling: 5000,
            bank_cache_ceiling: 2000,
            channel_cache_ceiling: 500,
            lock_idle_horizon: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            persist_read_defaults: true,
        }
    }

    /// Reads `CHATSTATE_*` variables, falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, String> {
        let base_dir = env_string("CHATSTATE_BASE_DIR", "./data");
        let mut config = Self::new(&base_dir);

        if let Ok(bank_dir) = std::env::var("CHATSTATE_BANK_DIR") {
            config.bank_dir = PathBuf::from(bank_dir);
        }
        config.users_cache_ceiling =
            env_parse("CHATSTATE_USERS_CACHE", config.users_cache_ceiling)?;
        config.bank_cache_ceiling = env_parse("CHATSTATE_BANK_CACHE", config.bank_cache_ceiling)?;
        config.channel_cache_ceiling =
            env_parse("CHATSTATE_CHANNEL_CACHE", config.channel_cache_ceiling)?;
        config.lock_idle_horizon = Duration::from_secs(env_parse(
            "CHATSTATE_LOCK_IDLE_SECS",
            config.lock_idle_horizon.as_secs(),
        )?);
        config.sweep_interval = Duration::from_secs(env_parse(
            "CHATSTATE_SWEEP_SECS",
            config.sweep_interval.as_secs(),
        )?);
        config.persist_read_defaults =
            env_parse("CHATSTATE_PERSIST_READ_DEFAULTS", config.persist_read_defaults)?;

        config.validate()?;
        Ok(config)
    }

    pub fn bank_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.bank_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn users_cache_ceiling(mut self, ceiling: usize) -> Self {
        self.users_cache_ceiling = ceiling;
        self
    }

    pub fn bank_cache_ceiling(mut self, ceiling: usize) -> Self {
        self.bank_cache_ceiling = ceiling;
        self
    }

    pub fn channel_cache_ceiling(mut self, ceiling: usize) -> Self {
        self.channel_cache_ceiling = ceiling;
        self
    }

    pub fn lock_idle_horizon(mut self, horizon: Duration) -> Self {
        self.lock_idle_horizon = horizon;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn persist_read_defaults(mut self, persist: bool) -> Self {
        self.persist_read_defaults = persist;
        self
    }

    fn read_default_policy(&self) -> ReadDefaultPolicy {
        if self.persist_read_defaults {
            ReadDefaultPolicy::WriteThrough
        } else {
            ReadDefaultPolicy::CacheOnly
        }
    }

    pub fn users_namespace(&self) -> NamespaceConfig {
        NamespaceConfig::new(USERS_NAMESPACE, &self.base_dir)
            .cache_ceiling(self.users_cache_ceiling)
            .read_default_policy(self.read_default_policy())
    }

    pub fn bank_namespace(&self) -> NamespaceConfig {
        NamespaceConfig::new(BANK_NAMESPACE, &self.bank_dir)
            .cache_ceiling(self.bank_cache_ceiling)
            .read_default_policy(self.read_default_policy())
    }

    pub fn channel_settings_namespace(&self) -> NamespaceConfig {
        NamespaceConfig::new(CHANNEL_SETTINGS_NAMESPACE, &self.base_dir)
            .cache_ceiling(self.channel_cache_ceiling)
            .read_default_policy(self.read_default_policy())
    }

    pub fn channel_cooldowns_namespace(&self) -> NamespaceConfig {
        NamespaceConfig::new(CHANNEL_COOLDOWNS_NAMESPACE, &self.base_dir)
            .layout(DocumentLayout::EntityDirectory {
                file_stem: CHANNEL_COOLDOWNS_FILE.to_string(),
            })
            .cache_ceiling(self.channel_cache_ceiling)
            .read_default_policy(ReadDefaultPolicy::CacheOnly)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.base_dir.as_os_str().is_empty() {
            return Err("base_dir cannot be empty".to_string());
        }
        if self.bank_dir.as_os_str().is_empty() {
            return Err("bank_dir cannot be empty".to_string());
        }
        if self.users_cache_ceiling == 0
            || self.bank_cache_ceiling == 0
            || self.channel_cache_ceiling == 0
        {
            return Err("cache ceilings must be > 0".to_string());
        }
        if self.lock_idle_horizon.is_zero() {
            return Err("lock_idle_horizon must be > 0".to_string());
        }
        if self.sweep_interval.is_zero() {
            return Err("sweep_interval must be > 0".to_string());
        }
        Ok(())
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self::new("./data")
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{} has an invalid value '{}'", key, raw)),
        Err(_) => Ok(default),
    }
}
