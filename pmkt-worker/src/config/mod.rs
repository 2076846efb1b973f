//! Configuration module for pmkt-worker.
//!
//! Reads the TOML file, validates it and converts it into the runtime
//! config types of `pmkt-core`.

pub mod file;

use crate::config::file::FileConfig;
use pmkt_core::config::{FanoutConfig, LndConfig, ReconcilerConfig, TwitterConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid url: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

/// Loaded configuration, one part per processor concern.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub reconciler: ReconcilerConfig,
    pub fanout: FanoutConfig,
    pub lnd: LndConfig,
    pub twitter: TwitterConfig,
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new config loader.
    pub fn new(config_path: impl AsRef<Path>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
        }
    }

    /// Read, validate and convert the configuration file.
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        let file_config: FileConfig = toml::from_str(&config_content)?;
        build_loaded_config(file_config)
    }
}

fn validate(config: &FileConfig) -> Result<(), ConfigError> {
    if config.settlement.bid_extension_minutes == 0 {
        return Err(ConfigError::ValidationError(
            "settlement.bid_extension_minutes must be positive".to_string(),
        ));
    }
    if config.notifications.interval_secs == 0 {
        return Err(ConfigError::ValidationError(
            "notifications.interval_secs must be positive".to_string(),
        ));
    }
    if config.notifications.ending_soon_minutes == 0 {
        return Err(ConfigError::ValidationError(
            "notifications.ending_soon_minutes must be positive".to_string(),
        ));
    }
    if config.notifications.recently_sent_capacity == 0 {
        return Err(ConfigError::ValidationError(
            "notifications.recently_sent_capacity must be positive".to_string(),
        ));
    }

    if config.lnd.mock {
        if config.lnd.mock_poll_secs == 0 {
            return Err(ConfigError::ValidationError(
                "lnd.mock_poll_secs must be positive".to_string(),
            ));
        }
    } else {
        if config.lnd.rest_url.is_none() {
            return Err(ConfigError::ValidationError(
                "lnd.rest_url is required unless lnd.mock is set".to_string(),
            ));
        }
        if config.lnd.macaroon_path.is_none() {
            return Err(ConfigError::ValidationError(
                "lnd.macaroon_path is required unless lnd.mock is set".to_string(),
            ));
        }
    }

    if !config.twitter.mock && config.twitter.secrets_path.is_none() {
        return Err(ConfigError::ValidationError(
            "twitter.secrets_path is required unless twitter.mock is set".to_string(),
        ));
    }
    Ok(())
}

fn build_loaded_config(file_config: FileConfig) -> Result<LoadedConfig, ConfigError> {
    validate(&file_config)?;

    let FileConfig {
        settlement,
        notifications,
        lnd,
        twitter,
    } = file_config;

    let lnd = match (lnd.mock, lnd.rest_url, lnd.macaroon_path) {
        (false, Some(rest_url), Some(macaroon_path)) => LndConfig::Rest {
            rest_url,
            macaroon_path,
            tls_cert_path: lnd.tls_cert_path,
        },
        _ => LndConfig::Mock {
            poll_interval: Duration::from_secs(lnd.mock_poll_secs),
        },
    };

    let twitter = match (twitter.mock, twitter.secrets_path) {
        (false, Some(secrets_path)) => TwitterConfig::Api {
            api_base_url: Url::parse(&twitter.api_base_url)?,
            secrets_path,
        },
        _ => TwitterConfig::Mock,
    };

    Ok(LoadedConfig {
        reconciler: ReconcilerConfig {
            bid_extension: time::Duration::minutes(i64::from(settlement.bid_extension_minutes)),
        },
        fanout: FanoutConfig {
            interval: Duration::from_secs(notifications.interval_secs),
            ending_soon_window: time::Duration::minutes(i64::from(
                notifications.ending_soon_minutes,
            )),
            recently_sent_capacity: notifications.recently_sent_capacity,
        },
        lnd,
        twitter,
    })
}

/// Get the database URL from the environment.
pub fn get_database_url() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)
}
