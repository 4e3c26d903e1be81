//! Configuration for migration runs.
//!
//! [`DatabaseConfig::load`] reads `config/tidemark.toml` (optional) and
//! `TIDEMARK_`-prefixed environment variables, e.g.
//! `TIDEMARK_DATABASE__URL` and `TIDEMARK_DATABASE__SERVICE_KEY`. The legacy
//! `SUPABASE_URL`, `SUPABASE_SECRET` and `DATABASE_URL` variables fill in
//! whatever is still missing.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

const CONFIG_FILE: &str = "config/tidemark.toml";

/// Which executor talks to the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Direct PostgreSQL connection (`postgres://...`)
    Postgres,
    /// Hosted backend SQL RPC over HTTPS (`https://...`)
    Rest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub service_key: String,
    #[serde(default)]
    pub backend: Option<Backend>,
    #[serde(default = "default_step_timeout_seconds")]
    pub step_timeout_seconds: u64,
    #[serde(default = "default_rpc_function")]
    pub rpc_function: String,
    #[serde(default = "default_rpc_argument")]
    pub rpc_argument: String,
    #[serde(default = "default_fallback_rpc_function")]
    pub fallback_rpc_function: Option<String>,
    #[serde(default = "default_fallback_rpc_argument")]
    pub fallback_rpc_argument: String,
}

fn default_step_timeout_seconds() -> u64 {
    30
}

fn default_rpc_function() -> String {
    "exec_sql".to_string()
}

fn default_rpc_argument() -> String {
    "sql".to_string()
}

fn default_fallback_rpc_function() -> Option<String> {
    Some("execute_sql".to_string())
}

fn default_fallback_rpc_argument() -> String {
    "query".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            service_key: String::new(),
            backend: None,
            step_timeout_seconds: default_step_timeout_seconds(),
            rpc_function: default_rpc_function(),
            rpc_argument: default_rpc_argument(),
            fallback_rpc_function: default_fallback_rpc_function(),
            fallback_rpc_argument: default_fallback_rpc_argument(),
        }
    }
}

impl DatabaseConfig {
    /// Load the configuration from `config/tidemark.toml`, falling back to env vars,
    /// then fill gaps from the legacy variables and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let db_config = Self::from_sources()?;
        db_config.validate()?;
        Ok(db_config)
    }

    /// Same sources as [`DatabaseConfig::load`], without validation, so
    /// callers can apply overrides first.
    pub fn from_sources() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(Self::environment());

        let settings = match builder.build() {
            Ok(cfg) => cfg,
            Err(err) => {
                // An unreadable file should not hide a usable environment
                if std::path::Path::new(CONFIG_FILE).exists() {
                    log::warn!("failed to load {CONFIG_FILE}, falling back to env: {err}");
                }
                Config::builder()
                    .add_source(Self::environment())
                    .build()
                    .map_err(|env_err| {
                        ConfigError::Message(format!(
                            "Failed to load configuration from file and env: {err}, then env-only error: {env_err}"
                        ))
                    })?
            }
        };

        let mut db_config = Self::from_config(&settings)?;
        db_config.apply_legacy_env(|key| std::env::var(key).ok());
        Ok(db_config)
    }

    fn environment() -> Environment {
        Environment::with_prefix("TIDEMARK")
            .prefix_separator("_")
            .separator("__")
    }

    /// Extract the `database` section; a missing section yields the defaults.
    pub fn from_config(settings: &Config) -> Result<Self, ConfigError> {
        match settings.get::<DatabaseConfig>("database") {
            Ok(cfg) => Ok(cfg),
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            Err(e) => Err(ConfigError::Message(format!(
                "Database configuration could not be loaded from file or environment: {e}"
            ))),
        }
    }

    /// Fill an empty URL or credential from the variables the original scripts used.
    pub fn apply_legacy_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if self.url.trim().is_empty() {
            if let Some(url) = non_empty("SUPABASE_URL").or_else(|| non_empty("DATABASE_URL")) {
                self.url = url;
            }
        }
        if self.service_key.trim().is_empty() {
            if let Some(key) = non_empty("SUPABASE_SECRET") {
                self.service_key = key;
            }
        }
    }

    /// Explicit backend, or the one implied by the URL scheme.
    pub fn backend(&self) -> Backend {
        self.backend.unwrap_or_else(|| {
            if self.url.starts_with("http://") || self.url.starts_with("https://") {
                Backend::Rest
            } else {
                Backend::Postgres
            }
        })
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    /// Reject configurations that cannot possibly connect.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Message(
                "Database URL not provided. Set TIDEMARK_DATABASE__URL (or SUPABASE_URL / DATABASE_URL)."
                    .to_string(),
            ));
        }
        if self.backend() == Backend::Rest && self.service_key.trim().is_empty() {
            return Err(ConfigError::Message(
                "Service key not provided. Set TIDEMARK_DATABASE__SERVICE_KEY (or SUPABASE_SECRET) \
                 to an administrative (service-role) credential."
                    .to_string(),
            ));
        }
        if self.step_timeout_seconds == 0 {
            return Err(ConfigError::Message(
                "step_timeout_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
