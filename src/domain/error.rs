// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@oxidity.com>

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Connection failed to endpoint: {0}")]
    Connection(String),

    #[error("Unknown network: {0}")]
    UnknownNetwork(String),

    #[error("Connection pool exhausted for network {network} after {attempts} attempts")]
    PoolExhausted { network: String, attempts: u32 },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Malformed RPC response for {method}: {reason}")]
    Decode { method: String, reason: String },

    #[error("{operation} timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Validation failed for field {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Engine is shut down")]
    Shutdown,
}

impl AppError {
    /// Pool exhaustion and transport-level failures are worth retrying after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Connection(_)
                | AppError::PoolExhausted { .. }
                | AppError::Timeout { .. }
                | AppError::Decode { .. }
        )
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

