//! Error taxonomy for the healer.
//!
//! Only configuration and startup errors are fatal. Fetch errors abort a
//! single cycle, action errors feed the circuit breaker, and gate denials
//! are not errors at all (see [`crate::store::DenyReason`]).

use thiserror::Error;

/// Failure to list observations from the cluster. Cycle-scoped.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("fetch did not complete before the cycle deadline")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

/// Failure of a single mutating call against the cluster.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    /// Worth retrying inside the executor (timeouts, conflicts, throttling)
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying will not help (forbidden, invalid, unsupported owner)
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ActionError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<kube::Error> for ActionError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if is_transient_status(resp.code) => {
                Self::Transient(err.to_string())
            }
            kube::Error::Api(_) => Self::Permanent(err.to_string()),
            // Transport, TLS and service errors are all worth another try
            _ => Self::Transient(err.to_string()),
        }
    }
}

/// HTTP statuses from the API server that a retry can plausibly fix.
#[must_use]
pub const fn is_transient_status(code: u16) -> bool {
    matches!(code, 408 | 409 | 429 | 500 | 502 | 503 | 504)
}

/// Invalid or unreadable configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid signature pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
