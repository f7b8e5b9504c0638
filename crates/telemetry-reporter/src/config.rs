// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reporter configuration, loaded once from the environment and immutable afterwards.

use crate::constants;
use crate::errors::ConfigError;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Tuning for the retry/backoff scheduler
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Escalations allowed per backoff path before it holds steady
    pub max_retries: u32,
    /// Admission threshold after a successful cycle
    pub base_capacity: usize,
    /// Admission threshold ceiling under sustained overflow
    pub max_capacity: usize,
    /// Send interval after a successful cycle
    pub base_timer: Duration,
    /// Send interval ceiling, before jitter
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Half-width of the uniform jitter band around 1.0
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: constants::MAX_RETRIES,
            base_capacity: constants::BASE_QUEUE_CAPACITY,
            max_capacity: constants::MAX_QUEUE_CAPACITY,
            base_timer: Duration::from_millis(constants::BASE_TIMER_MS),
            max_delay: Duration::from_millis(constants::MAX_DELAY_MS),
            backoff_factor: constants::BACKOFF_FACTOR,
            jitter_factor: constants::JITTER_FACTOR,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_capacity == 0 {
            return Err(ConfigError::Invalid(
                "base queue capacity must be greater than 0".to_string(),
            ));
        }
        if self.max_capacity < self.base_capacity {
            return Err(ConfigError::Invalid(format!(
                "max queue capacity {} is below base capacity {}",
                self.max_capacity, self.base_capacity
            )));
        }
        if self.base_timer.is_zero() {
            return Err(ConfigError::Invalid(
                "base timer must be greater than 0".to_string(),
            ));
        }
        if self.max_delay < self.base_timer {
            return Err(ConfigError::Invalid(format!(
                "max delay {}ms is below base timer {}ms",
                self.max_delay.as_millis(),
                self.base_timer.as_millis()
            )));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff factor must be at least 1.0, got {}",
                self.backoff_factor
            )));
        }
        if !(0.0..1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::Invalid(format!(
                "jitter factor must be in [0, 1), got {}",
                self.jitter_factor
            )));
        }
        Ok(())
    }
}

/// Where events are posted: `base_url + base_endpoint + version + event.endpoint`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiDescriptor {
    /// `None` makes the pipeline inert
    pub base_url: Option<String>,
    pub base_endpoint: String,
    pub version: String,
}

impl Default for ApiDescriptor {
    fn default() -> Self {
        Self {
            base_url: None,
            base_endpoint: constants::DEFAULT_BASE_ENDPOINT.to_string(),
            version: constants::DEFAULT_API_VERSION.to_string(),
        }
    }
}

impl ApiDescriptor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Default::default()
        }
    }

    /// Full URL for an event endpoint, or `None` when no collector is configured.
    #[must_use]
    pub fn url_for(&self, endpoint: &str) -> Option<String> {
        self.base_url.as_ref().map(|base| {
            format!(
                "{}{}{}{}",
                base.trim_end_matches('/'),
                self.base_endpoint,
                self.version,
                endpoint
            )
        })
    }
}

/// Configuration for the whole reporter
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// User consent. When false the pipeline is inert regardless of `api`.
    pub enabled: bool,
    pub api: ApiDescriptor,
    pub retry: RetryConfig,
    /// Per-request HTTP timeout
    pub timeout: Duration,
    pub https_proxy: Option<String>,
    /// Literals redacted in addition to the ones found in the environment
    pub sensitive_literals: Vec<String>,
    pub identity_cache_ceiling: usize,
    /// Location of the durable cache file, in-memory when unset
    pub store_path: Option<PathBuf>,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api: ApiDescriptor::default(),
            retry: RetryConfig::default(),
            timeout: Duration::from_millis(constants::DEFAULT_TIMEOUT_MS),
            https_proxy: None,
            sensitive_literals: Vec::new(),
            identity_cache_ceiling: constants::IDENTITY_CACHE_CEILING,
            store_path: None,
        }
    }
}

impl ReporterConfig {
    /// Create configuration from `TELEMETRY_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`ReporterConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let retry_defaults = defaults.retry;

        let enabled = lookup("TELEMETRY_ENABLED")
            .map(|val| val.to_lowercase() != "false")
            .unwrap_or(true);
        let base_url = lookup("TELEMETRY_BASE_URL").filter(|val| !val.trim().is_empty());
        let api = ApiDescriptor {
            base_url,
            base_endpoint: lookup("TELEMETRY_BASE_ENDPOINT")
                .unwrap_or(defaults.api.base_endpoint),
            version: lookup("TELEMETRY_API_VERSION").unwrap_or(defaults.api.version),
        };

        let retry = RetryConfig {
            max_retries: parse_var(&lookup, "TELEMETRY_MAX_RETRIES")?
                .unwrap_or(retry_defaults.max_retries),
            base_capacity: parse_var(&lookup, "TELEMETRY_BASE_CAPACITY")?
                .unwrap_or(retry_defaults.base_capacity),
            max_capacity: parse_var(&lookup, "TELEMETRY_MAX_CAPACITY")?
                .unwrap_or(retry_defaults.max_capacity),
            base_timer: parse_var(&lookup, "TELEMETRY_BASE_TIMER_MS")?
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.base_timer),
            max_delay: parse_var(&lookup, "TELEMETRY_MAX_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.max_delay),
            backoff_factor: parse_var(&lookup, "TELEMETRY_BACKOFF_FACTOR")?
                .unwrap_or(retry_defaults.backoff_factor),
            jitter_factor: parse_var(&lookup, "TELEMETRY_JITTER_FACTOR")?
                .unwrap_or(retry_defaults.jitter_factor),
        };

        let timeout = parse_var(&lookup, "TELEMETRY_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.timeout);
        let https_proxy = lookup("TELEMETRY_PROXY_HTTPS").or_else(|| lookup("HTTPS_PROXY"));
        let sensitive_literals = lookup("TELEMETRY_REDACT")
            .map(|val| {
                val.split(',')
                    .map(str::trim)
                    .filter(|literal| !literal.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let store_path = lookup("TELEMETRY_STORE_PATH").map(PathBuf::from);

        let config = Self {
            enabled,
            api,
            retry,
            timeout,
            https_proxy,
            sensitive_literals,
            identity_cache_ceiling: defaults.identity_cache_ceiling,
            store_path,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;

        if let Some(base_url) = &self.api.base_url {
            let parsed = reqwest::Url::parse(base_url)
                .map_err(|e| ConfigError::Invalid(format!("base url '{base_url}': {e}")))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(ConfigError::Invalid(format!(
                    "base url '{base_url}' must use http or https"
                )));
            }
        }

        if self.identity_cache_ceiling < 2 {
            return Err(ConfigError::Invalid(
                "identity cache ceiling must be at least 2".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether events actually leave the process.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && self.api.base_url.is_some()
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Unparseable { name, value }),
    }
}
