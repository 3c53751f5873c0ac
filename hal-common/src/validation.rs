//! Configuration validation.
//!
//! Checks that required credentials are present for the selected Slack mode
//! and that durations and ranges are usable.

use thiserror::Error;

use crate::config::{AgentConfig, Config, ObservabilityConfig, SessionConfig, SlackMode};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: &[&str] = &["json", "pretty"];

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.validate_slack() {
            errors.push(e);
        }
        if let Err(e) = self.agent.validate() {
            errors.push(e);
        }
        if let Err(e) = self.session.validate() {
            errors.push(e);
        }
        if let Err(e) = self.observability.validate() {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }

    fn validate_slack(&self) -> ValidationResult<()> {
        if self.secrets.slack_bot_token.as_deref().map_or(true, str::is_empty) {
            return Err(ValidationError::MissingField {
                field: "secrets.slack_bot_token".into(),
            });
        }

        match self.slack.mode {
            SlackMode::Socket => {
                let app_token = self.secrets.slack_app_token.as_deref().unwrap_or("");
                if app_token.is_empty() {
                    return Err(ValidationError::MissingField {
                        field: "secrets.slack_app_token".into(),
                    });
                }
                if !app_token.starts_with("xapp-") {
                    return Err(ValidationError::InvalidValue {
                        field: "secrets.slack_app_token".into(),
                        reason: "Socket Mode needs an app-level token (xapp-...)".into(),
                    });
                }
            }
            SlackMode::EventsApi => {
                if self
                    .secrets
                    .slack_signing_secret
                    .as_deref()
                    .map_or(true, str::is_empty)
                {
                    return Err(ValidationError::MissingField {
                        field: "secrets.slack_signing_secret".into(),
                    });
                }
                if self.network.port == 0 {
                    return Err(ValidationError::InvalidValue {
                        field: "network.port".into(),
                        reason: "Events API mode needs a listening port".into(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl Validate for AgentConfig {
    fn validate(&self) -> ValidationResult<()> {
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(ValidationError::InvalidValue {
                field: "agent.endpoint".into(),
                reason: format!("'{}' is not an http(s) URL", self.endpoint),
            });
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "agent.name".into(),
            });
        }
        if self.call_timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "agent.call_timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ValidationError::InvalidValue {
                field: "agent.llm.temperature".into(),
                reason: "must be between 0.0 and 2.0".into(),
            });
        }
        Ok(())
    }
}

impl Validate for SessionConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.inactivity_timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "session.inactivity_timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("expected one of {VALID_LOG_LEVELS:?}"),
            });
        }
        if !VALID_LOG_FORMATS.contains(&self.log_format.as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("expected one of {VALID_LOG_FORMATS:?}"),
            });
        }
        Ok(())
    }
}
