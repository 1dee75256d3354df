// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the liteboxd control plane.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default in-cluster API server address.
pub const IN_CLUSTER_API_URL: &str = "https://kubernetes.default.svc";

/// Default service-account token location inside a pod.
pub const IN_CLUSTER_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Control-plane configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// sqlx SQLite URL for the control-plane store
    pub database_url: String,
    /// Data directory holding the SQLite file when no URL is given
    pub data_dir: PathBuf,
    /// HTTP API listen address
    pub http_addr: SocketAddr,
    /// Public gateway base URL used to build sandbox access URLs
    pub gateway_url: String,
    /// Raw access-token encryption key (base64, hex or raw bytes)
    pub token_key: String,
    /// Identifier stored alongside every encrypted token
    pub token_key_id: String,
    /// Cluster namespace that holds sandbox pods
    pub namespace: String,
    /// Cluster API server base URL
    pub kube_api_url: String,
    /// Bearer token file for the cluster API
    pub kube_token_path: PathBuf,
    /// Skip TLS certificate verification for the cluster API
    pub kube_insecure: bool,
    /// Deadline for cluster calls made on behalf of API clients
    pub request_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = PathBuf::from(
            lookup("LITEBOXD_DATA_DIR").unwrap_or_else(|| ".data".to_string()),
        );

        let database_url = lookup("LITEBOXD_DATABASE_URL").unwrap_or_else(|| {
            format!("sqlite:{}?mode=rwc", data_dir.join("liteboxd.db").display())
        });

        let port: u16 = lookup("LITEBOXD_HTTP_PORT")
            .unwrap_or_else(|| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;
        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let gateway_url = lookup("LITEBOXD_GATEWAY_URL")
            .unwrap_or_else(|| "http://localhost:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        let token_key = lookup("SANDBOX_TOKEN_ENCRYPTION_KEY")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingEnvVar("SANDBOX_TOKEN_ENCRYPTION_KEY"))?;

        let token_key_id = lookup("SANDBOX_TOKEN_ENCRYPTION_KEY_ID")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "v1".to_string());

        let namespace = lookup("LITEBOXD_NAMESPACE").unwrap_or_else(|| "liteboxd".to_string());

        let kube_api_url = lookup("LITEBOXD_KUBE_API_URL")
            .unwrap_or_else(|| IN_CLUSTER_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let kube_token_path = PathBuf::from(
            lookup("LITEBOXD_KUBE_TOKEN_PATH").unwrap_or_else(|| IN_CLUSTER_TOKEN_PATH.to_string()),
        );

        let kube_insecure = lookup("LITEBOXD_KUBE_INSECURE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let request_timeout_secs = match lookup("LITEBOXD_REQUEST_TIMEOUT_SECS") {
            Some(value) => value.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                var: "LITEBOXD_REQUEST_TIMEOUT_SECS",
                value,
            })?,
            None => 30,
        };

        Ok(Self {
            database_url,
            data_dir,
            http_addr,
            gateway_url,
            token_key,
            token_key_id,
            namespace,
            kube_api_url,
            kube_token_path,
            kube_insecure,
            request_timeout: Duration::from_secs(request_timeout_secs),
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable holds an unparseable value.
    #[error("Invalid value for {var}: {value}")]
    InvalidValue {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
}

/// Read an optional integer variable, falling back to `default` when unset or unparseable.
pub(crate) fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
