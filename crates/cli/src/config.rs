//! Configuration loading from permgate.toml.

use perm::{PrivilegeSet, Template};
use rpc::{ClientConfig, StaticTokens};
use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Address the server listens on and the client connects to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Let callers without any credential in, with the default privileges.
    #[serde(default)]
    pub allow_anonymous: bool,

    pub perms: PermsConfig,

    /// Bearer token to privilege set.
    #[serde(default)]
    pub tokens: StaticTokens,

    /// Permission template for the served implementation.
    #[serde(default = "crate::calc::template")]
    pub template: Template,

    #[serde(default)]
    pub client: ClientConfig,
}

/// The privilege universe and the set callers get without an override.
#[derive(Debug, Deserialize)]
pub struct PermsConfig {
    pub valid: PrivilegeSet,

    #[serde(default)]
    pub default: PrivilegeSet,
}

fn default_listen() -> String {
    "127.0.0.1:7420".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration: the demo template, `admin` and
    /// `read` privileges, `read` by default, and no tokens.
    pub fn default_config() -> Self {
        Self {
            listen: default_listen(),
            allow_anonymous: false,
            perms: PermsConfig {
                valid: ["admin", "read"].into_iter().collect(),
                default: ["read"].into_iter().collect(),
            },
            tokens: StaticTokens::new(),
            template: crate::calc::template(),
            client: ClientConfig::default(),
        }
    }

    /// Check the parts of the config that reference each other.
    ///
    /// Token privileges must come from the universe; templates are checked
    /// later, when binding.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for privilege in &self.perms.default {
            if !self.perms.valid.contains(privilege) {
                return Err(ConfigError::Invalid(format!(
                    "default privilege '{privilege}' is not in perms.valid"
                )));
            }
        }
        for (token, privileges) in self.tokens.iter() {
            if let Some(unknown) = privileges.iter().find(|p| !self.perms.valid.contains(p)) {
                return Err(ConfigError::Invalid(format!(
                    "token '{}' grants unknown privilege '{unknown}'",
                    redact(token)
                )));
            }
        }
        self.client
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// Keep secrets out of error messages.
fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(3).collect();
    format!("{prefix}...")
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}
