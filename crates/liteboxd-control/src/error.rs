// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the liteboxd control plane.

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::config::ConfigError;
use crate::token::TokenError;

/// Control-plane errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bad input. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The id is unknown to the store or the cluster.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A cluster runtime call failed.
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// A store operation failed. Fatal for the current operation.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Access token encryption or decryption failed.
    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable error code for API payloads.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Cluster(_) => "CLUSTER_ERROR",
            Error::Store(_) | Error::Migrate(_) => "STORE_ERROR",
            Error::Token(_) => "TOKEN_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Json(_) | Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to hand to an API caller.
    ///
    /// Validation and not-found messages describe the caller's own input and
    /// are returned as-is. Everything else is replaced with a generic text so
    /// cluster and database details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Error::Validation(msg) => msg.clone(),
            Error::NotFound(what) => format!("{} not found", what),
            Error::Cluster(ClusterError::Timeout) => "cluster request timed out".to_string(),
            Error::Cluster(_) => "cluster runtime request failed".to_string(),
            Error::Store(_) | Error::Migrate(_) => "storage operation failed".to_string(),
            _ => "internal error".to_string(),
        }
    }

    /// Whether this error means the target does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::Cluster(ClusterError::NotFound(_))
        )
    }
}

/// Result type using the control-plane [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
