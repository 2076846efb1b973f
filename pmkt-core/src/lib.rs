#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

pub mod config;
pub mod delivery;
pub mod entities;
pub mod events;
pub mod framework;
pub mod notifications;
pub mod payment_source;
pub mod processors;
pub mod store;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;
