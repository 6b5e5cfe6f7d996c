//! `ProxyOptions`: the only configuration surface the core exposes. No
//! business config beyond this — route tables, cluster registries, and
//! the like belong to the out-of-scope outer layers.

#[cfg(test)]
mod tests;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    7865
}

fn default_dial_timeout_secs() -> f64 {
    10.0
}

fn default_idle_timeout_secs() -> f64 {
    30.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyOptions {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub intercept_https: bool,
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    #[serde(default)]
    pub ca_password: Option<String>,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: f64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: f64,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        ProxyOptions {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            intercept_https: false,
            ca_path: None,
            ca_password: None,
            dial_timeout_secs: default_dial_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl ProxyOptions {
    /// Load from a file (if it exists) and apply environment variable
    /// overrides; fall back to defaults when the file is absent.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let mut options: ProxyOptions = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(path = %path.display(), "proxy config file not found, using defaults");
            ProxyOptions::default()
        };

        options.apply_env_overrides();
        options.validate()?;
        Ok(options)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SNITCHER_LISTEN_ADDRESS") {
            self.listen_address = v;
        }
        if let Ok(v) = std::env::var("SNITCHER_LISTEN_PORT") {
            if let Ok(n) = v.parse() {
                self.listen_port = n;
            }
        }
        if let Ok(v) = std::env::var("SNITCHER_INTERCEPT_HTTPS") {
            self.intercept_https = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("SNITCHER_CA_PATH") {
            self.ca_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("SNITCHER_CA_PASSWORD") {
            self.ca_password = Some(v);
        }
        if let Ok(v) = std::env::var("SNITCHER_DIAL_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.dial_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("SNITCHER_IDLE_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.idle_timeout_secs = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            anyhow::bail!("listen_port must be nonzero");
        }
        if self.dial_timeout_secs <= 0.0 {
            anyhow::bail!("dial_timeout_secs must be positive");
        }
        if self.idle_timeout_secs <= 0.0 {
            anyhow::bail!("idle_timeout_secs must be positive");
        }
        if self.ca_path.is_some() && self.ca_password.is_none() {
            tracing::warn!(
                "ca_path set without ca_password: a newly generated CA will be stored with an empty password"
            );
        }
        Ok(())
    }
}
