//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the acquisition core.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failure a curing cycle can run into, from configuration
//! problems to field-bus link failures.
//!
//! ## Error Hierarchy
//!
//! `DaqError` consolidates the following sources:
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches
//!   in the TOML configuration or the environment overrides.
//! - **`Configuration`**: Semantic errors in an otherwise well-formed configuration, such
//!   as a core-temperature channel that does not exist. Caught by `Settings::validate`.
//! - **`Io`**: Wraps `std::io::Error`, e.g. when an acquisition thread cannot be spawned.
//! - **`Transport`**: Field-bus failures surfaced to the caller. Per-channel read failures
//!   never reach this level during a tick; only link-open failures at cycle start and
//!   setpoint writes are reported through it.
//! - **`Csv`**: Failures while loading a recorded demo sequence.
//! - **`InvalidState`**: An operation was requested in a loop or session state that does
//!   not allow it (e.g. starting a loop twice).
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types with `?`.

use crate::transport::TransportError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Top-level error for the acquisition core.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Parsing or extraction of the configuration failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration parsed but is not usable.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Generic I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Field-bus transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Recorded sequence could not be parsed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Recorded sequence parsed but is not usable.
    #[error("Demo sequence error: {0}")]
    Demo(String),

    /// Operation not allowed in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl DaqError {
    /// Whether the failure ends the cycle.
    ///
    /// Only link-level failures and configuration problems are fatal; everything the
    /// acquisition loop can route around is reported as recoverable.
    pub fn is_fatal(&self) -> bool {
        match self {
            DaqError::Config(_) | DaqError::Configuration(_) | DaqError::Demo(_) => true,
            DaqError::Csv(_) | DaqError::Io(_) => true,
            DaqError::Transport(err) => err.is_link_failure(),
            DaqError::InvalidState(_) => false,
        }
    }
}
