//! TOML configuration.
//!
//! Lookup order: an explicit `--config` path, then `CULPRIT_FINDER_CONFIG`, then
//! `~/.config/culprit-finder/config.toml`, then compiled-in defaults. Command-line
//! flags override whatever was loaded.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bisect::EngineConfig;
use crate::tester::PollConfig;

pub const CONFIG_ENV: &str = "CULPRIT_FINDER_CONFIG";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tester: PollConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try, in order:
    /// 1. The path in `CULPRIT_FINDER_CONFIG`.
    /// 2. `~/.config/culprit-finder/config.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "CULPRIT_FINDER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        if let Some(user_path) = home_dir().map(|h| h.join(".config/culprit-finder/config.toml")) {
            if user_path.exists() {
                match Self::load(&user_path) {
                    Ok(cfg) => return cfg,
                    Err(e) => {
                        warn!(
                            path = %user_path.display(),
                            error = %e,
                            "user config file exists but could not be loaded, using defaults"
                        );
                    }
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").filter(|h| !h.is_empty()).map(PathBuf::from)
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding cached verdicts, sessions and locks.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path: base.join(".culprit_finder").join("state.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// GitHub
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub api_url: String,
    /// Dispatched in place of the target workflow when the repository has it. An
    /// empty string turns the wrapper off.
    pub wrapper_workflow: Option<String>,
    #[serde(with = "crate::tester::retry::duration_secs")]
    pub request_timeout: std::time::Duration,
}

impl GithubConfig {
    pub fn wrapper(&self) -> Option<&str> {
        self.wrapper_workflow.as_deref().filter(|w| !w.is_empty())
    }
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            wrapper_workflow: Some("culprit_finder.yml".to_string()),
            request_timeout: std::time::Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
