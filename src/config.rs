use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::filter::LevelFilter;

/// Environment variable that overrides `billing.tool_path`.
pub const TOOL_PATH_ENV: &str = "BILLING_TOOL_PATH";
/// Environment variable that switches delivery to HTTP against the given host URL.
pub const HOST_URL_ENV: &str = "BILLHOOK_HOST_URL";

/// Top-level configuration loaded from config.toml.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HookConfig {
    pub billing: BillingConfig,
    pub log: LogConfig,
    pub host: HostConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BillingConfig {
    pub tool_path: PathBuf,
    /// Deadline for one billing query; 0 disables it.
    pub timeout_secs: u64,
    pub currency_symbol: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub file_name: String,
    pub max_size_bytes: u64,
    /// Active file plus numbered backups.
    pub max_files: u32,
    pub level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostMode {
    Stdout,
    Http,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HostConfig {
    pub mode: HostMode,
    pub base_url: String,
    pub request_timeout_secs: u64,
}

// --- Default implementations ---

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            tool_path: home().join(".local/bin/billing-tool"),
            timeout_secs: 60,
            currency_symbol: "¥".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: home().join(".local/share/opencode/log/bills-auto-query"),
            file_name: "bills-auto-query.log".to_string(),
            max_size_bytes: 10 * 1024 * 1024,
            max_files: 3,
            level: "debug".to_string(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            mode: HostMode::Stdout,
            base_url: "http://127.0.0.1:4096".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl BillingConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl LogConfig {
    /// Full path of the active log file.
    pub fn file_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Minimum level written to the log file. Unrecognized names fall back to DEBUG.
    pub fn level_filter(&self) -> LevelFilter {
        self.level.parse().unwrap_or(LevelFilter::DEBUG)
    }
}

/// Errors from loading the configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Default config location: `<config dir>/billhook/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| home().join(".config"))
        .join("billhook")
        .join("config.toml")
}

/// Load config from `path`, falling back to defaults when the file does not exist,
/// then apply environment overrides and expand `~/` prefixes.
pub fn load_config(path: &Path) -> Result<HookConfig, ConfigError> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            HookConfig::default()
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    config.apply_env_overrides();
    config.expand_paths();
    Ok(config)
}

impl HookConfig {
    /// Apply `BILLING_TOOL_PATH` and `BILLHOOK_HOST_URL`. Empty values are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = non_empty_env(TOOL_PATH_ENV) {
            self.billing.tool_path = PathBuf::from(path);
        }
        if let Some(url) = non_empty_env(HOST_URL_ENV) {
            self.host.mode = HostMode::Http;
            self.host.base_url = url;
        }
    }

    fn expand_paths(&mut self) {
        self.billing.tool_path = expand_home(&self.billing.tool_path);
        self.log.dir = expand_home(&self.log.dir);
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Replace a leading `~` component with the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home().join(rest),
        Err(_) => path.to_path_buf(),
    }
}
