//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.parley/config.json`) and environment.
//! Every field has a default, so an empty `{}` file is a valid config.

use crate::search::DEFAULT_SEARCH_TEMPLATE;
use crate::session::ModelConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix marking a bearer token as an access code rather than an API key.
pub const ACCESS_CODE_PREFIX: &str = "nk-";

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Completion API endpoint and credentials.
    #[serde(default)]
    pub api: ApiConfig,

    /// Web-search proxy settings.
    #[serde(default)]
    pub search: SearchConfig,

    /// Model configuration for new sessions.
    #[serde(default)]
    pub defaults: ModelConfig,

    /// Where session state is persisted.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// API base URL and credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// Base URL, e.g. "https://api.openai.com" or a proxy ending in "/v1". Overridden by PARLEY_BASE_URL.
    pub base_url: Option<String>,
    /// User API key. Overridden by OPENAI_API_KEY. Takes precedence over the access code.
    pub api_key: Option<String>,
    /// Access code for a deployment-side key. Overridden by PARLEY_ACCESS_CODE.
    pub access_code: Option<String>,
}

/// Web-search proxy: base URL of the host serving /api/web-search and the prompt template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchConfig {
    pub base_url: Option<String>,
    /// Template with {{query}}, {{results}} and {{date}} placeholders.
    #[serde(default = "default_search_template")]
    pub template: String,
}

fn default_search_template() -> String {
    DEFAULT_SEARCH_TEMPLATE.to_string()
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            template: default_search_template(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Data directory (default ~/.parley/data).
    pub data_dir: Option<PathBuf>,
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the API base URL: env PARLEY_BASE_URL overrides config.
pub fn resolve_base_url(config: &Config) -> Option<String> {
    env_non_empty("PARLEY_BASE_URL").or_else(|| trimmed(&config.api.base_url))
}

/// Resolve the bearer token: the user API key when set (env OPENAI_API_KEY overrides config),
/// otherwise the access code with [`ACCESS_CODE_PREFIX`], otherwise none.
pub fn resolve_bearer(config: &Config) -> Option<String> {
    let api_key = env_non_empty("OPENAI_API_KEY").or_else(|| trimmed(&config.api.api_key));
    let access_code =
        env_non_empty("PARLEY_ACCESS_CODE").or_else(|| trimmed(&config.api.access_code));
    bearer_from(api_key, access_code)
}

fn bearer_from(api_key: Option<String>, access_code: Option<String>) -> Option<String> {
    api_key.or_else(|| access_code.map(|code| format!("{}{}", ACCESS_CODE_PREFIX, code)))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("PARLEY_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".parley").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Resolve the data directory: `storage.dataDir` if set (relative paths resolved against the
/// config file's parent), otherwise the `data` subdirectory next to the config file.
pub fn resolve_data_dir(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.storage.data_dir {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                config_parent.join(d)
            }
        }
        _ => config_parent.join("data"),
    }
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Create the config directory and a default config file if missing. Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let s = serde_json::to_string_pretty(&Config::default())
            .context("serializing default config")?;
        std::fs::write(config_path, s)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    } else {
        log::debug!("config already exists at {}, skipping", config_path.display());
    }

    let data_dir = config_dir.join("data");
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        log::info!("created data directory at {}", data_dir.display());
    }
    Ok(config_dir.to_path_buf())
}
