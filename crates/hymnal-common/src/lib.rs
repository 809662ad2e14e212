//! # Hymnal Common
//!
//! Pieces every hymnal crate shares: the base error type, subscriber setup
//! and the deadline wrapper used around network calls.

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod timeout;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use timeout::with_timeout;

/// Errors raised below the cache and network layers.
#[derive(Error, Debug)]
pub enum HymnalError {
    /// Invalid or unreadable configuration.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A deadline elapsed.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl HymnalError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Short name for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            HymnalError::Config { .. } => "config",
            HymnalError::Io(_) => "io",
            HymnalError::Timeout(_) => "timeout",
            HymnalError::Internal { .. } => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, HymnalError>;

/// Attach a human-readable step to a foreign error.
pub trait ResultExt<T> {
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| HymnalError::internal(format!("{}: {}", message.into(), e)))
    }
}
