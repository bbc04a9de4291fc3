//! Configuration Module
//!
//! Relay configuration loaded from environment variables.

mod settings;

pub use settings::{ConfigError, LiveSettings, PollSettings, RelayConfig, ServerSettings};
