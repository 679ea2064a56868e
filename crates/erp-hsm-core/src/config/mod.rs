//! Configuration management with file persistence
//!
//! Settings live in `config.toml`; every keyed setting can be overridden by an
//! environment variable. HSM passwords are accepted from the environment only.

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that relocates the config directory
pub const CONFIG_DIR_ENV: &str = "ERP_HSM_CONFIG_DIR";

/// erp-hsm configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hsm: HsmConfig,
    pub pool: PoolConfig,
    pub jobs: JobsConfig,
    pub blob_store: BlobStoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HsmConfig {
    /// Comma separated `<port>@<address>` list, or `simulated`
    pub device: String,
    pub work_username: Option<String>,
    pub work_keyspec: Option<String>,
    pub setup_username: Option<String>,
    pub setup_keyspec: Option<String>,
    /// Deprecated, used when `work_username` is not set
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub work_password: Option<String>,
    #[serde(skip_serializing)]
    pub setup_password: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound of concurrently connected sessions; derived from the CPU count when unset
    pub max_sessions: Option<usize>,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub tee_token_update_secs: u64,
    pub tee_token_retry_secs: u64,
    pub tee_token_validity_secs: u64,
    pub trust_store_refresh_secs: u64,
    pub cache_refresh_secs: u64,
    pub pseudonym_key_enabled: bool,
    pub pseudonym_key_check_secs: u64,
    pub pseudonym_key_failed_check_secs: u64,
    pub pseudonym_key_expire_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobStoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobStoreConfig {
    pub backend: BlobStoreBackend,
    /// SQLite file; defaults to `blobs.db` in the config directory
    pub path: Option<PathBuf>,
}

impl Default for HsmConfig {
    fn default() -> Self {
        Self {
            device: "simulated".to_string(),
            work_username: None,
            work_keyspec: None,
            setup_username: None,
            setup_keyspec: None,
            username: None,
            work_password: None,
            setup_password: None,
            password: None,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: None,
            acquire_timeout_ms: 5_000,
            idle_timeout_secs: 900,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            tee_token_update_secs: 300,
            tee_token_retry_secs: 10,
            tee_token_validity_secs: 1_800,
            trust_store_refresh_secs: 3_600,
            cache_refresh_secs: 60,
            pseudonym_key_enabled: false,
            pseudonym_key_check_secs: 86_400,
            pseudonym_key_failed_check_secs: 300,
            pseudonym_key_expire_secs: 15_552_000,
        }
    }
}

impl PoolConfig {
    /// Session bound: `max_sessions`, or one more than the available parallelism
    pub fn session_bound(&self) -> usize {
        self.max_sessions.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                + 1
        })
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Keep-alive runs four times per idle timeout
    pub fn keep_alive_interval(&self) -> Duration {
        self.idle_timeout() / 4
    }
}

impl JobsConfig {
    pub fn tee_token_update(&self) -> Duration {
        Duration::from_secs(self.tee_token_update_secs)
    }

    pub fn tee_token_retry(&self) -> Duration {
        Duration::from_secs(self.tee_token_retry_secs)
    }

    pub fn tee_token_validity(&self) -> Duration {
        Duration::from_secs(self.tee_token_validity_secs)
    }

    pub fn trust_store_refresh(&self) -> Duration {
        Duration::from_secs(self.trust_store_refresh_secs)
    }

    pub fn cache_refresh(&self) -> Duration {
        Duration::from_secs(self.cache_refresh_secs)
    }

    pub fn pseudonym_key_check(&self) -> Duration {
        Duration::from_secs(self.pseudonym_key_check_secs)
    }

    pub fn pseudonym_key_failed_check(&self) -> Duration {
        Duration::from_secs(self.pseudonym_key_failed_check_secs)
    }

    pub fn pseudonym_key_expire(&self) -> Duration {
        Duration::from_secs(self.pseudonym_key_expire_secs)
    }
}

/// A keyed setting with an environment variable name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    HsmDevice,
    HsmWorkUsername,
    HsmWorkPassword,
    HsmWorkKeyspec,
    HsmSetupUsername,
    HsmSetupPassword,
    HsmSetupKeyspec,
    DeprecatedHsmUsername,
    DeprecatedHsmPassword,
    HsmMaxSessionCount,
    HsmIdleTimeoutSeconds,
    HsmCacheRefreshSeconds,
    TeeTokenUpdateSeconds,
    TeeTokenRetrySeconds,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 14] = [
        Self::HsmDevice,
        Self::HsmWorkUsername,
        Self::HsmWorkPassword,
        Self::HsmWorkKeyspec,
        Self::HsmSetupUsername,
        Self::HsmSetupPassword,
        Self::HsmSetupKeyspec,
        Self::DeprecatedHsmUsername,
        Self::DeprecatedHsmPassword,
        Self::HsmMaxSessionCount,
        Self::HsmIdleTimeoutSeconds,
        Self::HsmCacheRefreshSeconds,
        Self::TeeTokenUpdateSeconds,
        Self::TeeTokenRetrySeconds,
    ];

    /// Environment variable that overrides the file value
    pub fn env_var(&self) -> &'static str {
        match self {
            Self::HsmDevice => "ERP_HSM_DEVICE",
            Self::HsmWorkUsername => "ERP_HSM_WORK_USERNAME",
            Self::HsmWorkPassword => "ERP_HSM_WORK_PASSWORD",
            Self::HsmWorkKeyspec => "ERP_HSM_WORK_KEYSPEC",
            Self::HsmSetupUsername => "ERP_HSM_SETUP_USERNAME",
            Self::HsmSetupPassword => "ERP_HSM_SETUP_PASSWORD",
            Self::HsmSetupKeyspec => "ERP_HSM_SETUP_KEYSPEC",
            Self::DeprecatedHsmUsername => "ERP_HSM_USERNAME",
            // Misspelled in deployed environments; kept for compatibility
            Self::DeprecatedHsmPassword => "ERP_HSM_PASWORD",
            Self::HsmMaxSessionCount => "ERP_HSM_MAX_SESSION_COUNT",
            Self::HsmIdleTimeoutSeconds => "ERP_HSM_IDLE_TIMEOUT_SECONDS",
            Self::HsmCacheRefreshSeconds => "ERP_HSM_CACHE_REFRESH_SECONDS",
            Self::TeeTokenUpdateSeconds => "ERP_TEE_TOKEN_UPDATE_SECONDS",
            Self::TeeTokenRetrySeconds => "ERP_TEE_TOKEN_RETRY_SECONDS",
        }
    }

    /// Secret values, redacted in listings
    pub fn is_credential(&self) -> bool {
        matches!(
            self,
            Self::HsmWorkPassword
                | Self::HsmSetupPassword
                | Self::DeprecatedHsmPassword
                | Self::HsmWorkKeyspec
                | Self::HsmSetupKeyspec
        )
    }

    pub fn is_deprecated(&self) -> bool {
        matches!(self, Self::DeprecatedHsmUsername | Self::DeprecatedHsmPassword)
    }
}

/// Source of keyed configuration values
pub trait ConfigLookup {
    fn get(&self, key: ConfigKey) -> Option<String>;
}

impl ConfigLookup for HashMap<ConfigKey, String> {
    fn get(&self, key: ConfigKey) -> Option<String> {
        HashMap::get(self, &key).cloned()
    }
}

impl ConfigLookup for Config {
    fn get(&self, key: ConfigKey) -> Option<String> {
        self.lookup_with(key, |name| env::var(name).ok())
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var(CONFIG_DIR_ENV) {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("erp-hsm")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or the defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            config
        } else {
            Config::default()
        };

        config.apply_env_overrides(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.hsm.work_password.is_some()
            || self.hsm.setup_password.is_some()
            || self.hsm.password.is_some()
        {
            return Err(anyhow!(
                "HSM passwords must be provided via environment variables, not stored in configuration"
            ));
        }
        if self.pool.max_sessions == Some(0) {
            return Err(anyhow!("pool.max_sessions must be at least 1"));
        }
        if self.pool.acquire_timeout_ms == 0 {
            return Err(anyhow!("pool.acquire_timeout_ms must be positive"));
        }
        if self.pool.idle_timeout_secs < 4 {
            return Err(anyhow!("pool.idle_timeout_secs must be at least 4"));
        }

        let intervals = [
            ("jobs.tee_token_update_secs", self.jobs.tee_token_update_secs),
            ("jobs.tee_token_retry_secs", self.jobs.tee_token_retry_secs),
            ("jobs.tee_token_validity_secs", self.jobs.tee_token_validity_secs),
            ("jobs.trust_store_refresh_secs", self.jobs.trust_store_refresh_secs),
            ("jobs.cache_refresh_secs", self.jobs.cache_refresh_secs),
            ("jobs.pseudonym_key_check_secs", self.jobs.pseudonym_key_check_secs),
            ("jobs.pseudonym_key_failed_check_secs", self.jobs.pseudonym_key_failed_check_secs),
            ("jobs.pseudonym_key_expire_secs", self.jobs.pseudonym_key_expire_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(anyhow!("{} must be positive", name));
            }
        }
        Ok(())
    }

    /// Blob store file, defaulting into the config directory
    pub fn blob_store_path(&self) -> anyhow::Result<PathBuf> {
        match &self.blob_store.path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("blobs.db")),
        }
    }

    /// Value from the file alone; passwords are never taken from here
    pub fn file_value(&self, key: ConfigKey) -> Option<String> {
        match key {
            ConfigKey::HsmDevice => Some(self.hsm.device.clone()),
            ConfigKey::HsmWorkUsername => self.hsm.work_username.clone(),
            ConfigKey::HsmSetupUsername => self.hsm.setup_username.clone(),
            ConfigKey::DeprecatedHsmUsername => self.hsm.username.clone(),
            ConfigKey::HsmWorkKeyspec => self.hsm.work_keyspec.clone(),
            ConfigKey::HsmSetupKeyspec => self.hsm.setup_keyspec.clone(),
            ConfigKey::HsmMaxSessionCount => self.pool.max_sessions.map(|n| n.to_string()),
            ConfigKey::HsmIdleTimeoutSeconds => Some(self.pool.idle_timeout_secs.to_string()),
            ConfigKey::HsmCacheRefreshSeconds => Some(self.jobs.cache_refresh_secs.to_string()),
            ConfigKey::TeeTokenUpdateSeconds => Some(self.jobs.tee_token_update_secs.to_string()),
            ConfigKey::TeeTokenRetrySeconds => Some(self.jobs.tee_token_retry_secs.to_string()),
            ConfigKey::HsmWorkPassword
            | ConfigKey::HsmSetupPassword
            | ConfigKey::DeprecatedHsmPassword => None,
        }
    }

    /// Keyed lookup with an explicit environment; a non-empty variable wins over the file
    pub fn lookup_with(&self, key: ConfigKey, env: impl Fn(&str) -> Option<String>) -> Option<String> {
        env(key.env_var())
            .filter(|value| !value.is_empty())
            .or_else(|| self.file_value(key))
    }

    /// Apply numeric and device overrides from the environment
    pub fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        fn parse<T: std::str::FromStr>(key: ConfigKey, value: &str) -> anyhow::Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| anyhow!("Invalid value for {}: {}", key.env_var(), value))
        }

        for key in ConfigKey::ALL {
            let Some(value) = env(key.env_var()).filter(|v| !v.is_empty()) else {
                continue;
            };
            match key {
                ConfigKey::HsmDevice => self.hsm.device = value,
                ConfigKey::HsmMaxSessionCount => self.pool.max_sessions = Some(parse(key, &value)?),
                ConfigKey::HsmIdleTimeoutSeconds => self.pool.idle_timeout_secs = parse(key, &value)?,
                ConfigKey::HsmCacheRefreshSeconds => self.jobs.cache_refresh_secs = parse(key, &value)?,
                ConfigKey::TeeTokenUpdateSeconds => self.jobs.tee_token_update_secs = parse(key, &value)?,
                ConfigKey::TeeTokenRetrySeconds => self.jobs.tee_token_retry_secs = parse(key, &value)?,
                // Identity settings are resolved lazily through ConfigLookup
                _ => {}
            }
        }
        Ok(())
    }

    /// List configuration keys and their effective values, credentials redacted
    pub fn list(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = ConfigKey::ALL
            .into_iter()
            .map(|key| {
                let value = match (key.is_credential(), self.get(key)) {
                    (true, Some(_)) => "(set)".to_string(),
                    (_, None) => "(not set)".to_string(),
                    (false, Some(value)) => value,
                };
                (key.env_var().to_string(), value)
            })
            .collect();

        entries.push((
            "pool.session_bound".to_string(),
            self.pool.session_bound().to_string(),
        ));
        entries.push((
            "pool.acquire_timeout_ms".to_string(),
            self.pool.acquire_timeout_ms.to_string(),
        ));
        entries.push((
            "blob_store.backend".to_string(),
            format!("{:?}", self.blob_store.backend).to_lowercase(),
        ));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pool.acquire_timeout(), Duration::from_secs(5));
        assert_eq!(config.pool.keep_alive_interval(), Duration::from_secs(225));
        assert_eq!(config.jobs.tee_token_update_secs, 300);
        assert_eq!(config.jobs.pseudonym_key_expire_secs, 15_552_000);
        assert!(config.pool.session_bound() >= 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_session_bound() {
        let mut config = Config::default();
        config.pool.max_sessions = Some(3);
        assert_eq!(config.pool.session_bound(), 3);

        config.pool.max_sessions = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_passwords_rejected_in_file() {
        let config: Config = toml::from_str(
            r#"
            [hsm]
            work_username = "ERP_WORK"
            work_password = "secret"
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("environment"));
    }

    #[test]
    fn test_passwords_never_serialized() {
        let mut config = Config::default();
        config.hsm.work_password = Some("secret".into());
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(!text.contains("secret"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [pool]
            max_sessions = 4

            [blob_store]
            backend = "sqlite"
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.max_sessions, Some(4));
        assert_eq!(config.pool.idle_timeout_secs, 900);
        assert_eq!(config.blob_store.backend, BlobStoreBackend::Sqlite);
        assert_eq!(config.hsm.device, "simulated");
    }

    #[test]
    fn test_env_wins_over_file() {
        let mut config = Config::default();
        config.hsm.work_username = Some("FILE_USER".into());

        let env = env_of(&[("ERP_HSM_WORK_USERNAME", "ENV_USER")]);
        assert_eq!(
            config.lookup_with(ConfigKey::HsmWorkUsername, &env),
            Some("ENV_USER".to_string())
        );

        let empty = env_of(&[("ERP_HSM_WORK_USERNAME", "")]);
        assert_eq!(
            config.lookup_with(ConfigKey::HsmWorkUsername, &empty),
            Some("FILE_USER".to_string())
        );
    }

    #[test]
    fn test_passwords_only_from_env() {
        let config = Config::default();
        let none = env_of(&[]);
        assert_eq!(config.lookup_with(ConfigKey::HsmWorkPassword, &none), None);

        let env = env_of(&[("ERP_HSM_PASWORD", "legacy")]);
        assert_eq!(
            config.lookup_with(ConfigKey::DeprecatedHsmPassword, &env),
            Some("legacy".to_string())
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_overrides(env_of(&[
                ("ERP_HSM_MAX_SESSION_COUNT", "7"),
                ("ERP_TEE_TOKEN_RETRY_SECONDS", "3"),
            ]))
            .unwrap();
        assert_eq!(config.pool.max_sessions, Some(7));
        assert_eq!(config.jobs.tee_token_retry_secs, 3);

        let result = config.apply_env_overrides(env_of(&[("ERP_HSM_IDLE_TIMEOUT_SECONDS", "soon")]));
        assert!(result.is_err());
    }
}
