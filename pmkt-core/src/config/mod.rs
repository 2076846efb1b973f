//! Runtime configuration types.
//!
//! These are the validated values the processors work with. Loading and
//! parsing the config file is done by the worker binary.

mod lnd;
mod processors;
mod twitter;

pub use lnd::LndConfig;
pub use processors::{FanoutConfig, ReconcilerConfig};
pub use twitter::TwitterConfig;
