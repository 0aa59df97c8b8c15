//! Client configuration.
//!
//! Layering, lowest to highest: built-in defaults, the JSON config file,
//! then command-line flags / environment (see [`ConfigOverrides`]).

use anyhow::{Context, Result, bail};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pagination::CursorKind;
use crate::retry::RetryPolicy;
use crate::runtime::Runtime;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "PAGEFETCH_CONFIG";

/// Environment variable holding the bearer token.
pub const TOKEN_ENV: &str = "PAGEFETCH_TOKEN";

const CONFIG_DIR_NAME: &str = "pagefetch";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Base URL that request paths are resolved against.
    pub base_url: Option<String>,
    /// Retries after the first attempt of each page.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Circuit breaker on the number of pages per fetch.
    pub max_pages: usize,
    pub cursor_field_path: String,
    pub has_more_field_path: String,
    /// Where the item array lives; empty means the body is the array.
    pub items_field_path: String,
    /// Query parameter the cursor is sent back in.
    pub cursor_param: String,
    pub cursor_kind: CursorKind,
    /// Per-request timeout; 0 disables it.
    pub request_timeout_ms: u64,
    pub user_agent: String,
    /// Hand back already-fetched items when a fetch fails or is cancelled.
    pub keep_partial: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            max_retries: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_pages: 10_000,
            cursor_field_path: "next_cursor".to_string(),
            has_more_field_path: "has_more".to_string(),
            items_field_path: "data".to_string(),
            cursor_param: "cursor".to_string(),
            cursor_kind: CursorKind::Cursor,
            request_timeout_ms: 30_000,
            user_agent: format!("pagefetch/{}", env!("PAGEFETCH_VERSION")),
            keep_partial: false,
        }
    }
}

impl ClientConfig {
    /// Parses a JSON config document. Missing keys take their defaults.
    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).context("Invalid configuration")
    }

    /// Loads the config file, if any, on top of the defaults.
    ///
    /// `explicit` (or `$PAGEFETCH_CONFIG`) must exist; the per-user default
    /// location is optional.
    #[tracing::instrument(skip(runtime))]
    pub fn load<R: Runtime>(runtime: &R, explicit: Option<&Path>) -> Result<Self> {
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| runtime.env_var(CONFIG_ENV).ok().map(PathBuf::from));

        let path = match explicit {
            Some(path) => {
                if !runtime.exists(&path) {
                    bail!("Config file {} does not exist", path.display());
                }
                Some(path)
            }
            None => default_config_path(runtime).filter(|p| runtime.exists(p)),
        };

        let config = match path {
            Some(path) => {
                debug!("Loading config from {}", path.display());
                let contents = runtime.read_to_string(&path)?;
                Self::from_json(&contents)
                    .with_context(|| format!("Failed to parse {}", path.display()))?
            }
            None => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_pages == 0 {
            bail!("max_pages must be at least 1");
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            bail!(
                "base_backoff_ms ({}) must not exceed max_backoff_ms ({})",
                self.base_backoff_ms,
                self.max_backoff_ms
            );
        }
        if self.cursor_field_path.is_empty() {
            bail!("cursor_field_path must not be empty");
        }
        if self.has_more_field_path.is_empty() {
            bail!("has_more_field_path must not be empty");
        }
        if self.cursor_param.is_empty() {
            bail!("cursor_param must not be empty");
        }
        if let Some(url) = &self.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!("base_url must start with http:// or https://, got '{}'", url);
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }
}

/// Values given on the command line. `None` leaves the file/default value alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub base_url: Option<String>,
    pub max_retries: Option<u32>,
    pub max_pages: Option<usize>,
    pub keep_partial: bool,
}

impl ConfigOverrides {
    pub fn apply(&self, mut config: ClientConfig) -> Result<ClientConfig> {
        if let Some(url) = &self.base_url {
            config.base_url = Some(url.clone());
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        if let Some(n) = self.max_pages {
            config.max_pages = n;
        }
        if self.keep_partial {
            config.keep_partial = true;
        }
        config.validate()?;
        Ok(config)
    }
}

/// `<config_dir>/pagefetch/config.json`
pub fn default_config_path<R: Runtime>(runtime: &R) -> Option<PathBuf> {
    runtime
        .config_dir()
        .map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Reads the API token from the environment.
pub fn api_token<R: Runtime>(runtime: &R) -> Option<String> {
    runtime
        .env_var(TOKEN_ENV)
        .ok()
        .filter(|token| !token.trim().is_empty())
}
