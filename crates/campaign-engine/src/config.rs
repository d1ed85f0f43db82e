//! Engine configuration.
//!
//! Assembled from environment variables at startup; a missing required
//! variable aborts startup with a configuration error naming the
//! variable. Operational tunables (timeouts, batch sizes, backoffs)
//! are fixed constants in the modules that own them.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Telephony control plane settings
    pub ari: AriSettings,

    /// TTS service endpoint
    pub tts_url: String,

    /// Primary data store settings
    pub database: DatabaseSettings,

    /// HTTP listener port for the dashboard hub
    pub http_port: u16,

    /// Ordered outbound trunk names tried by the call executor
    pub trunks: Vec<String>,

    /// Caller id presented on outbound channels
    pub caller_id: String,
}

/// Telephony control-plane settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AriSettings {
    pub url: String,
    pub username: String,
    pub password: String,
    /// Stasis application name used for all channels
    pub app_name: String,
}

/// Primary store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl DatabaseSettings {
    /// Connection URL for the pool
    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }
}

fn required(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| EngineError::config(format!("missing required environment variable {}", name)))
}

fn optional(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl EngineConfig {
    /// Load the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        let http_port = optional("PORT", "3000")
            .parse::<u16>()
            .map_err(|_| EngineError::config("PORT must be a valid TCP port"))?;

        let db_port = optional("DB_PORT", "5432")
            .parse::<u16>()
            .map_err(|_| EngineError::config("DB_PORT must be a valid TCP port"))?;

        let trunks: Vec<String> = optional("TRUNKS", "trunk1,trunk2,trunk3,trunk4")
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if trunks.is_empty() {
            return Err(EngineError::config("TRUNKS must name at least one trunk"));
        }

        Ok(Self {
            ari: AriSettings {
                url: required("ARI_URL")?,
                username: required("ARI_USERNAME")?,
                password: required("ARI_PASSWORD")?,
                app_name: optional("ARI_APP", "outdial"),
            },
            tts_url: required("TTS_URL")?,
            database: DatabaseSettings {
                host: required("DB_HOST")?,
                port: db_port,
                username: required("DB_USERNAME")?,
                password: required("DB_PASSWORD")?,
                database: required("DB_DATABASE")?,
            },
            http_port,
            trunks,
            caller_id: optional("CALLER_ID", "0000000000"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_base_env() {
        std::env::set_var("ARI_URL", "http://pbx:8088/ari");
        std::env::set_var("ARI_USERNAME", "ari");
        std::env::set_var("ARI_PASSWORD", "secret");
        std::env::set_var("TTS_URL", "http://tts:5000/synthesize");
        std::env::set_var("DB_HOST", "db");
        std::env::set_var("DB_USERNAME", "outdial");
        std::env::set_var("DB_PASSWORD", "outdial");
        std::env::set_var("DB_DATABASE", "outdial");
    }

    fn clear_env() {
        for name in [
            "ARI_URL",
            "ARI_USERNAME",
            "ARI_PASSWORD",
            "ARI_APP",
            "TTS_URL",
            "DB_HOST",
            "DB_PORT",
            "DB_USERNAME",
            "DB_PASSWORD",
            "DB_DATABASE",
            "PORT",
            "TRUNKS",
            "CALLER_ID",
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn loads_with_defaults() {
        clear_env();
        set_base_env();
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.http_port, 3000);
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.ari.app_name, "outdial");
        assert_eq!(config.trunks.len(), 4);
        assert_eq!(config.caller_id, "0000000000");
        clear_env();
    }

    #[test]
    #[serial]
    fn missing_required_var_names_the_variable() {
        clear_env();
        set_base_env();
        std::env::remove_var("ARI_PASSWORD");
        let err = EngineConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("ARI_PASSWORD"));
        clear_env();
    }

    #[test]
    #[serial]
    fn parses_trunk_list() {
        clear_env();
        set_base_env();
        std::env::set_var("TRUNKS", "gw-a, gw-b");
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.trunks, vec!["gw-a", "gw-b"]);
        clear_env();
    }

    #[test]
    #[serial]
    fn database_url_is_assembled() {
        clear_env();
        set_base_env();
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(
            config.database.url(),
            "postgres://outdial:outdial@db:5432/outdial"
        );
        clear_env();
    }
}
