//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: `MUX_`)
//! 2. `config.json` in the current working directory
//! 3. `config.yaml` in the current working directory
//! 4. Default values
//!
//! This mirrors the original implementation's `uconfig.Files` list
//! (`config.json` then `config.yaml`, first found wins per key).

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub multiplexer: MultiplexerConfig,
    pub backends: Vec<BackendConfig>,
}

/// Multiplexer-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiplexerConfig {
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub format: FormatConfig,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl MultiplexerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Output-formatting configuration for merged JSON responses
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatConfig {
    #[serde(default)]
    pub pretty_print: bool,

    #[serde(default)]
    pub info: InfoFormatConfig,
}

/// Field-stripping configuration for `/torrents/info` entries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoFormatConfig {
    #[serde(default)]
    pub remove_fields: Vec<String>,
}

/// A single backend instance's configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,

    #[serde(default)]
    pub authenticate: bool,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_cookie_timeout_secs")]
    pub cookie_timeout_secs: u64,
}

impl BackendConfig {
    pub fn cookie_timeout(&self) -> Duration {
        Duration::from_secs(self.cookie_timeout_secs)
    }
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9955
}

fn default_shutdown_timeout_secs() -> u64 {
    15
}

fn default_cookie_timeout_secs() -> u64 {
    15 * 60
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            format: FormatConfig::default(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multiplexer: MultiplexerConfig::default(),
            backends: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from `config.json` or `config.yaml` in the
    /// current working directory, then env overrides.
    pub fn load() -> Result<Self> {
        Self::load_from_dir(".")
    }

    /// Load configuration from a specific directory. Exposed for tests so
    /// they don't race on the process-wide working directory.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        let json_path = dir.join("config.json");
        let yaml_path = dir.join("config.yaml");

        if json_path.exists() {
            tracing::info!("loading configuration from {}", json_path.display());
            figment = figment.merge(Json::file(&json_path));
        }
        if yaml_path.exists() {
            tracing::info!("loading configuration from {}", yaml_path.display());
            figment = figment.merge(Yaml::file(&yaml_path));
        }

        figment = figment.merge(Env::prefixed("MUX_").split("_"));

        Ok(figment.extract()?)
    }

    /// Validate the configuration, collecting every violation rather than
    /// failing fast on the first one (matches the original's `Validate()`
    /// which accumulates `[]error`).
    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();

        if self.multiplexer.address.is_empty() {
            errs.push("multiplexer.address must not be empty".to_string());
        }
        if self.multiplexer.port < 1024 {
            errs.push(format!(
                "multiplexer.port {} is in the privileged range (<1024)",
                self.multiplexer.port
            ));
        }
        if self.multiplexer.shutdown_timeout_secs == 0
            || self.multiplexer.shutdown_timeout() <= Duration::from_secs(1)
        {
            errs.push("multiplexer.shutdown_timeout must exceed 1s".to_string());
        }
        if self.backends.is_empty() {
            errs.push("at least one backend must be configured".to_string());
        }

        for (i, backend) in self.backends.iter().enumerate() {
            if backend.url.is_empty() {
                errs.push(format!("backends[{i}].url must not be empty"));
            } else if url::Url::parse(&backend.url).is_err() {
                errs.push(format!("backends[{i}].url {:?} does not parse", backend.url));
            }
            if backend.authenticate
                && (backend.username.as_deref().unwrap_or("").is_empty()
                    || backend.password.as_deref().unwrap_or("").is_empty())
            {
                errs.push(format!(
                    "backends[{i}] has authenticate=true but is missing username/password"
                ));
            }
        }

        errs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_port() {
        let config = Config::default();
        assert_eq!(config.multiplexer.port, 9955);
        assert_eq!(config.multiplexer.address, "0.0.0.0");
    }

    #[test]
    fn validate_rejects_empty_backends() {
        let config = Config::default();
        let errs = config.validate();
        assert!(errs.iter().any(|e| e.contains("at least one backend")));
    }

    #[test]
    fn validate_rejects_low_port() {
        let mut config = Config::default();
        config.multiplexer.port = 80;
        config.backends.push(BackendConfig {
            url: "http://127.0.0.1:8080".to_string(),
            authenticate: false,
            username: None,
            password: None,
            name: None,
            cookie_timeout_secs: 900,
        });
        let errs = config.validate();
        assert!(errs.iter().any(|e| e.contains("privileged range")));
    }

    #[test]
    fn validate_requires_credentials_when_authenticating() {
        let mut config = Config::default();
        config.backends.push(BackendConfig {
            url: "http://127.0.0.1:8080".to_string(),
            authenticate: true,
            username: None,
            password: None,
            name: None,
            cookie_timeout_secs: 900,
        });
        let errs = config.validate();
        assert!(errs.iter().any(|e| e.contains("username/password")));
    }

    #[test]
    fn loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{
                "multiplexer": {"port": 9001},
                "backends": [{"url": "http://10.0.0.1:8080"}]
            }"#,
        )
        .unwrap();

        let config = Config::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.multiplexer.port, 9001);
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].url, "http://10.0.0.1:8080");
    }

    #[test]
    fn loads_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "multiplexer:\n  port: 9002\nbackends:\n  - url: http://10.0.0.2:8080\n",
        )
        .unwrap();

        let config = Config::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.multiplexer.port, 9002);
        assert_eq!(config.backends[0].url, "http://10.0.0.2:8080");
    }
}
