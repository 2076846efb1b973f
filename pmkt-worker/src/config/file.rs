//! TOML file configuration structures.
//!
//! These structs directly map to the `pmkt-config.toml` file format. Every
//! section is optional; missing values fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use url::Url;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub lnd: LndConfig,
    #[serde(default)]
    pub twitter: TwitterConfig,
}

/// Settlement reconciler section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Minutes an auction stays open after a settled bid.
    #[serde(default = "default_bid_extension_minutes")]
    pub bid_extension_minutes: u32,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            bid_extension_minutes: default_bid_extension_minutes(),
        }
    }
}

fn default_bid_extension_minutes() -> u32 {
    5
}

/// Notification fanout section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_ending_soon_minutes")]
    pub ending_soon_minutes: u32,
    #[serde(default = "default_recently_sent_capacity")]
    pub recently_sent_capacity: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            ending_soon_minutes: default_ending_soon_minutes(),
            recently_sent_capacity: default_recently_sent_capacity(),
        }
    }
}

fn default_interval_secs() -> u64 {
    1
}

fn default_ending_soon_minutes() -> u32 {
    10
}

fn default_recently_sent_capacity() -> usize {
    10_000
}

/// Lightning node section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LndConfig {
    /// Use the mock source that settles every open invoice.
    #[serde(default)]
    pub mock: bool,
    /// REST endpoint of the node, e.g. `https://127.0.0.1:8080`.
    pub rest_url: Option<Url>,
    pub macaroon_path: Option<PathBuf>,
    /// The node's self-signed certificate.
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default = "default_mock_poll_secs")]
    pub mock_poll_secs: u64,
}

impl Default for LndConfig {
    fn default() -> Self {
        Self {
            mock: false,
            rest_url: None,
            macaroon_path: None,
            tls_cert_path: None,
            mock_poll_secs: default_mock_poll_secs(),
        }
    }
}

fn default_mock_poll_secs() -> u64 {
    3
}

/// Twitter section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwitterConfig {
    /// Log direct messages instead of sending them.
    #[serde(default)]
    pub mock: bool,
    /// JSON file holding `API_KEY`, `API_KEY_SECRET`, `ACCESS_TOKEN` and `ACCESS_TOKEN_SECRET`.
    pub secrets_path: Option<PathBuf>,
    #[serde(default = "default_twitter_api_base_url")]
    pub api_base_url: String,
}

impl Default for TwitterConfig {
    fn default() -> Self {
        Self {
            mock: false,
            secrets_path: None,
            api_base_url: default_twitter_api_base_url(),
        }
    }
}

fn default_twitter_api_base_url() -> String {
    "https://api.twitter.com".to_string()
}
