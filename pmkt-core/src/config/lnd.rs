//! Lightning node connection.

use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub enum LndConfig {
    /// Settle every open invoice found in the store (development only).
    Mock { poll_interval: Duration },
    /// Subscribe to the node's REST invoice stream.
    Rest {
        rest_url: Url,
        macaroon_path: PathBuf,
        tls_cert_path: Option<PathBuf>,
    },
}
