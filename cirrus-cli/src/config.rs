// SPDX-License-Identifier: AGPL-3.0-or-later
//! CLI configuration
//!
//! Read from `config.toml` in the platform config directory. The access
//! token and API host can be overridden through the environment.

use cirrus_api::{AccessTokenAuthenticator, ApiService, Builder};
use cirrus_core::{ApiError, ApiResult, Dispatcher, DEFAULT_MAX_REQUESTS};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const TOKEN_VAR: &str = "CIRRUS_ACCESS_TOKEN";
pub const HOST_VAR: &str = "CIRRUS_API_HOST";

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub api_host: Option<String>,
    pub access_token: Option<String>,
    pub progress_threshold: Option<u64>,
    /// Seconds, 0 disables
    pub connect_timeout: Option<u64>,
    pub read_timeout: Option<u64>,
    pub write_timeout: Option<u64>,
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "cirrus", "cirrus")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load `path`, or the default file if it exists, then apply the
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> ApiResult<Self> {
        let mut config = match path {
            Some(path) => Self::read(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::read(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn read(path: &Path) -> ApiResult<Self> {
        tracing::debug!("loading config from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
            .map_err(|e| ApiError::invalid_argument(format!("{}: {e}", path.display())))
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup(TOKEN_VAR).filter(|v| !v.is_empty()) {
            self.access_token = Some(token);
        }
        if let Some(host) = lookup(HOST_VAR).filter(|v| !v.is_empty()) {
            self.api_host = Some(host);
        }
    }

    /// Builder carrying these settings. Calls run on the current runtime.
    pub fn builder(&self) -> ApiResult<Builder> {
        let token = self.access_token.as_deref().ok_or_else(|| {
            ApiError::invalid_argument(format!(
                "no access token configured, set {TOKEN_VAR} or access_token in the config file"
            ))
        })?;

        let mut builder = ApiService::builder()
            .authenticator(Arc::new(AccessTokenAuthenticator::new(token)))
            .user_agent(concat!("cirrus-cli/", env!("CARGO_PKG_VERSION")));
        if let Some(host) = &self.api_host {
            builder = builder.api_host(host.as_str());
        }
        if let Some(threshold) = self.progress_threshold {
            builder = builder.progress_callback_threshold(threshold);
        }
        if let Some(secs) = self.connect_timeout {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.read_timeout {
            builder = builder.read_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.write_timeout {
            builder = builder.write_timeout(Duration::from_secs(secs));
        }
        Ok(builder)
    }

    /// Service bound to the runtime this is called from.
    pub fn service(&self) -> ApiResult<ApiService> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| ApiError::invalid_argument(format!("no async runtime: {e}")))?;
        self.builder()?
            .dispatcher(Dispatcher::from_handle(handle, DEFAULT_MAX_REQUESTS))
            .create()
    }
}
