//! Configuration Module
//!
//! Configuration loading and dependency injection for the relay.

mod settings;
mod wiring;

pub use settings::{ConfigError, Credentials, RelayConfig};
pub use wiring::Relay;
