//! Error types for the autoscaler.
//!
//! Lookups that find nothing are not errors: inventory queries return
//! `Option`/`bool` for unknown runners and VMs. Configuration problems are
//! reported by the config loader, before any of these can occur. Running out of scale-up retries is
//! not an error either; it is a terminal `ScaleUpState::GivenUp`.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type for autoscaler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// External service an API error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    /// The compute fleet API.
    Fleet,
    /// The CI runner registry.
    Registry,
    /// The credential source.
    Credentials,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Fleet => write!(f, "fleet"),
            Service::Registry => write!(f, "registry"),
            Service::Credentials => write!(f, "credentials"),
        }
    }
}

/// Autoscaler errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Network, auth or protocol failure calling an external API.
    #[error("{service} API error: {message}")]
    TransientApi {
        service: Service,
        status: Option<u16>,
        message: String,
    },

    /// A runner never reached the expected state in time. The VM is left
    /// in place.
    #[error("runner {name} did not reach {expected} within {timeout:?}")]
    ProvisionTimeout {
        name: String,
        expected: String,
        timeout: Duration,
    },
}

impl Error {
    /// API error without an HTTP status.
    pub fn api(service: Service, message: impl Into<String>) -> Self {
        Self::TransientApi {
            service,
            status: None,
            message: message.into(),
        }
    }

    /// API error from a non-success HTTP response.
    pub fn http(service: Service, status: reqwest::StatusCode, body: impl Into<String>) -> Self {
        Self::TransientApi {
            service,
            status: Some(status.as_u16()),
            message: format!("{} - {}", status, body.into()),
        }
    }

    /// Wrap a transport error.
    pub fn transport(service: Service, err: reqwest::Error) -> Self {
        Self::TransientApi {
            service,
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }

    /// Returns true for errors worth retrying at the trigger layer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientApi { .. })
    }

    /// Returns true if a provisioning wait timed out.
    pub fn is_provision_timeout(&self) -> bool {
        matches!(self, Self::ProvisionTimeout { .. })
    }
}
