//! Coordinator configuration from environment variables.

use std::env;

use serde::{Deserialize, Serialize};

use crate::domain::CoordinatorError;

/// Identifier of the backend used when none is configured.
pub const DEFAULT_BACKEND: &str = "in-memory";

/// Longest transaction timeout accepted from configuration (one day).
pub const MAX_TIMEOUT_SECS: u32 = 86_400;

/// Configuration for the transaction coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Registry identifier of the transaction-manager backend
    pub backend: String,

    /// Enlist a debug participant in every transaction begun by the coordinator
    pub debug_resources: bool,

    /// Timeout applied by `begin` when the caller passes 0 (0 = backend default)
    pub default_timeout_secs: u32,

    /// Log level filter (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            debug_resources: true,
            default_timeout_secs: 0,
            log_level: "info".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TXC_BACKEND`: Backend identifier (default: in-memory)
    /// - `TXC_DEBUG_RESOURCES`: Enlist debug participants (default: true)
    /// - `TXC_DEFAULT_TIMEOUT_SECS`: Default begin timeout (default: 0)
    /// - `TXC_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    pub fn from_env() -> Self {
        Self {
            backend: env::var("TXC_BACKEND").unwrap_or_else(|_| DEFAULT_BACKEND.to_string()),

            debug_resources: env::var("TXC_DEBUG_RESOURCES")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(true),

            default_timeout_secs: env::var("TXC_DEFAULT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),

            log_level: env::var("TXC_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),
        }
    }

    /// Same configuration with another backend identifier.
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    /// Same configuration with debug participants switched on or off.
    pub fn with_debug_resources(mut self, enabled: bool) -> Self {
        self.debug_resources = enabled;
        self
    }

    /// Check the configuration before it is used to resolve a backend.
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.backend.trim().is_empty() {
            return Err(CoordinatorError::configuration(
                "no transaction backend configured",
            ));
        }
        if self.default_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(CoordinatorError::configuration(format!(
                "default_timeout_secs {} exceeds maximum {}",
                self.default_timeout_secs, MAX_TIMEOUT_SECS
            )));
        }
        Ok(())
    }
}
