//! Twitter direct message delivery.

use std::path::PathBuf;
use url::Url;

#[derive(Debug, Clone)]
pub enum TwitterConfig {
    /// Log messages instead of sending them.
    Mock,
    Api {
        api_base_url: Url,
        /// JSON file holding `API_KEY`, `API_KEY_SECRET`, `ACCESS_TOKEN` and `ACCESS_TOKEN_SECRET`.
        secrets_path: PathBuf,
    },
}
