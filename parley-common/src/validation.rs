//! Configuration validation.
//!
//! Checks that required values are present and within valid ranges before
//! the gateway starts accepting requests.

use std::net::IpAddr;
use thiserror::Error;

use crate::config::{
    AuthConfig, Config, NetworkConfig, ObservabilityConfig, RateLimitConfig, RetryConfig,
    SessionsConfig, UpstreamConfig,
};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid port {port}: must be between 1 and 65535")]
    InvalidPort { port: u16, field: String },

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

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let sections: [&dyn Validate; 7] = [
            &self.network,
            &self.auth,
            &self.upstream,
            &self.retry,
            &self.rate_limit,
            &self.sessions,
            &self.observability,
        ];

        let mut errors: Vec<ValidationError> = sections
            .iter()
            .filter_map(|section| section.validate().err())
            .collect();

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }
}

impl Validate for NetworkConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort {
                port: self.port,
                field: "network.port".into(),
            });
        }
        if self.host.parse::<IpAddr>().is_err() {
            return Err(ValidationError::InvalidValue {
                field: "network.host".into(),
                reason: format!("'{}' is not an IP address", self.host),
            });
        }
        Ok(())
    }
}

impl Validate for AuthConfig {
    fn validate(&self) -> ValidationResult<()> {
        match self.password.as_deref() {
            Some(p) if !p.is_empty() => Ok(()),
            _ => Err(ValidationError::MissingField {
                field: "auth.password (or PASSWORD)".into(),
            }),
        }
    }
}

impl Validate for UpstreamConfig {
    fn validate(&self) -> ValidationResult<()> {
        let url = url::Url::parse(&self.endpoint).map_err(|e| ValidationError::InvalidValue {
            field: "upstream.endpoint".into(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ValidationError::InvalidValue {
                field: "upstream.endpoint".into(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        if self.timeout_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "upstream.timeout_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

impl Validate for RetryConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidValue {
                field: "retry.max_attempts".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

impl Validate for RateLimitConfig {
    fn validate(&self) -> ValidationResult<()> {
        for (field, value) in [
            ("rate_limit.general_ms", self.general_ms),
            ("rate_limit.debug_ms", self.debug_ms),
            ("rate_limit.api_ms", self.api_ms),
        ] {
            if value == 0 {
                return Err(ValidationError::InvalidValue {
                    field: field.into(),
                    reason: "must be greater than 0".into(),
                });
            }
        }

        // Fingerprints must outlive their window.
        let longest_ms = self.general_ms.max(self.debug_ms).max(self.api_ms);
        if self.stale_after_secs.saturating_mul(1_000) < longest_ms {
            return Err(ValidationError::InvalidValue {
                field: "rate_limit.stale_after_secs".into(),
                reason: format!("must cover the longest interval ({longest_ms} ms)"),
            });
        }
        Ok(())
    }
}

impl Validate for SessionsConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.max_messages == 0 {
            return Err(ValidationError::InvalidValue {
                field: "sessions.max_messages".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.max_truncate == 0 {
            return Err(ValidationError::InvalidValue {
                field: "sessions.max_truncate".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.sweep_interval_secs == 0 {
            return Err(ValidationError::InvalidValue {
                field: "sessions.sweep_interval_secs".into(),
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("unknown level '{}'", self.log_level),
            });
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("unknown format '{}'", self.log_format),
            });
        }
        Ok(())
    }
}
