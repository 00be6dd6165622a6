//! Parley Common - Shared configuration, errors, and logging.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Error types and handling utilities
//! - Logging setup

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod validation;

pub use config::{
    AuthConfig, Config, NetworkConfig, ObservabilityConfig, RateLimitConfig, RetryConfig,
    SessionsConfig, UpstreamConfig,
};
pub use error::{Error, Result, ResultExt};
pub use validation::{Validate, ValidationError, ValidationResult};
