//! Spikelink configuration.
//!
//! Non-secret settings come from a TOML file with per-field defaults so a
//! partial file (or no file at all) still yields a runnable configuration.
//! Secrets are only ever read from the environment:
//!
//! - `SPIKELINK_ENCRYPTION_KEY` — urlsafe-base64, 32 bytes once decoded
//! - `SPIKELINK_HMAC_SECRET` — shared secret for webhook event signatures

use anyhow::{Context, Result};
use serde::Deserialize;

/// Complete spikelink configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SpikelinkConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Link flow configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// Domain hosting the browser-extension auth page
    #[serde(default = "default_auth_domain")]
    pub auth_domain: String,
    /// Application id embedded in the auth URL as `client_id`
    #[serde(default)]
    pub client_app_id: String,
    /// How long an issued challenge stays resolvable (minutes)
    #[serde(default = "default_challenge_ttl")]
    pub challenge_ttl_minutes: i64,
}

fn default_auth_domain() -> String {
    "localhost".to_string()
}

fn default_challenge_ttl() -> i64 {
    10
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            auth_domain: default_auth_domain(),
            client_app_id: String::new(),
            challenge_ttl_minutes: default_challenge_ttl(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "spikelink.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for SpikelinkConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            link: LinkConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &str) -> Result<SpikelinkConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: SpikelinkConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path))?;
    Ok(config)
}

/// Process-wide secrets, loaded once at startup and never rotated at runtime.
#[derive(Clone)]
pub struct Secrets {
    /// urlsafe-base64 encoded 32-byte AES key
    pub encryption_key: String,
    /// Shared HMAC secret for webhook event signatures
    pub hmac_secret: String,
}

impl Secrets {
    /// Read secrets from the environment. Both variables are required.
    pub fn from_env() -> Result<Self> {
        let encryption_key = std::env::var("SPIKELINK_ENCRYPTION_KEY")
            .context("SPIKELINK_ENCRYPTION_KEY not set")?;
        let hmac_secret =
            std::env::var("SPIKELINK_HMAC_SECRET").context("SPIKELINK_HMAC_SECRET not set")?;
        Ok(Self {
            encryption_key,
            hmac_secret,
        })
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secret material
        f.debug_struct("Secrets").finish_non_exhaustive()
    }
}
