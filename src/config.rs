use anyhow::{bail, Context, Result};
use dirs::config_dir;
use path_clean::PathClean;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `backup_directory`
pub const BACKUP_DIR_ENV: &str = "REPOVAULT_BACKUP_DIR";

/// Environment variable overriding `account.token`
pub const TOKEN_ENV: &str = "REPOVAULT_TOKEN";

/// Main configuration structure for repovault
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Account whose repositories are mirrored
    pub account: AccountConfig,

    /// Root directory for the mirrors; relative paths are resolved against
    /// the install location
    #[serde(default = "default_backup_directory")]
    pub backup_directory: String,

    /// GitHub endpoints and paging
    #[serde(default)]
    pub github: GitHubConfig,

    /// Synchronization behavior settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Account credentials
#[derive(Deserialize, Clone, Default)]
pub struct AccountConfig {
    /// Account login, used as the `owner` filter when listing
    #[serde(default)]
    pub login: String,

    /// Bearer token for the API and for cloning
    #[serde(default)]
    pub token: String,
}

impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("login", &self.login)
            .field("token", &mask(&self.token))
            .finish()
    }
}

/// `***` for a set secret, empty for an unset one
pub fn mask(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        "***"
    }
}

/// GitHub configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GitHubConfig {
    /// REST API root
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Base URL that `owner/name.git` is appended to when cloning
    #[serde(default = "default_git_url")]
    pub git_url: String,

    /// Repositories requested per listing page (1-100)
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Maximum repositories synced at once (0 = unbounded)
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Timeout for a single git command in seconds (0 = none)
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact" or "full"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_backup_directory() -> String {
    "backups".to_string()
}
fn default_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_git_url() -> String {
    "https://github.com".to_string()
}
fn default_per_page() -> u32 {
    100
}
fn default_max_parallel() -> usize {
    4
}
fn default_timeout() -> u64 {
    1800
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            git_url: default_git_url(),
            per_page: default_per_page(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            timeout: default_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account: AccountConfig::default(),
            backup_directory: default_backup_directory(),
            github: GitHubConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        if !config_path.exists() {
            bail!(
                "No configuration found at {:?}. Create it (see config.example.yml) or pass --config",
                config_path
            );
        }
        Self::load(&config_path)
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_yaml(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    /// Parse, apply environment overrides, expand and validate
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: Config =
            serde_yaml::from_str(content).context("Failed to parse config YAML")?;

        config.apply_env_overrides();
        config.expand_values()?;
        config.validate()?;

        Ok(config)
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repovault").join("config.yml"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(BACKUP_DIR_ENV) {
            if !dir.is_empty() {
                self.backup_directory = dir;
            }
        }
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.is_empty() {
                self.account.token = token;
            }
        }
    }

    /// Expand environment variables in the token and backup directory
    pub fn expand_values(&mut self) -> Result<()> {
        self.backup_directory = shellexpand::full(&self.backup_directory)
            .context("Failed to expand backup_directory path")?
            .into_owned();

        self.account.token = shellexpand::env(&self.account.token)
            .context("Failed to expand account.token")?
            .into_owned();

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.account.login.trim().is_empty() {
            bail!("account.login must be set");
        }
        if self.account.token.trim().is_empty() {
            bail!("account.token must be set (or export {})", TOKEN_ENV);
        }
        if !(1..=100).contains(&self.github.per_page) {
            bail!(
                "github.per_page must be between 1 and 100, got {}",
                self.github.per_page
            );
        }
        Ok(())
    }

    /// Absolute backup root, resolved against the install location
    pub fn backup_root(&self) -> Result<PathBuf> {
        let install_dir = install_dir()?;
        Ok(resolve_backup_directory(&self.backup_directory, &install_dir))
    }

    /// Per-command timeout, if any
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.sync.timeout > 0).then(|| Duration::from_secs(self.sync.timeout))
    }
}

/// Join a relative `raw` onto `install_dir`; absolute paths pass through.
pub fn resolve_backup_directory(raw: &str, install_dir: &Path) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf().clean()
    } else {
        install_dir.join(path).clean()
    }
}

/// Directory above the one holding the executable (`<prefix>` for
/// `<prefix>/bin/repovault`)
fn install_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate the running executable")?;
    let bin_dir = exe
        .parent()
        .context("Executable path has no parent directory")?;
    Ok(bin_dir.parent().unwrap_or(bin_dir).to_path_buf())
}
