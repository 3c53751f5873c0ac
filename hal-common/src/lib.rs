//! Hal Common - shared configuration, validation, and logging for the Hal Slack bot.
//!
//! This crate provides:
//! - Configuration types and loading (`config.json` + `secrets.json` + env)
//! - Configuration validation
//! - Logging setup and structured logging helpers

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod config_loader;
pub mod logging;
pub mod validation;

pub use config::{
    AgentConfig, Config, LlmConfig, NetworkConfig, ObservabilityConfig, SecretsConfig,
    SessionConfig, SlackConfig, SlackMode, TeachConfig,
};
pub use validation::{Validate, ValidationError, ValidationResult};

