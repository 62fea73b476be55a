//! Error types for the trust node controller

use thiserror::Error;

/// Errors raised by the controller and its node mutation layer
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid or unusable configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The node named by a trust record or event does not exist
    #[error("Node {0} not found")]
    NodeNotFound(String),

    /// A taint was requested with an effect Kubernetes does not know
    #[error("Invalid taint effect: {0}")]
    InvalidTaintEffect(String),

    /// Some hosts of a HostAttributes object could not be synced
    #[error("Failed to sync {failed} of {total} hosts for {key}: {message}")]
    HostSyncFailed {
        key: String,
        failed: usize,
        total: usize,
        message: String,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether retrying the same input can succeed.
    ///
    /// Conflicts, throttling and server-side failures are transient; any other
    /// 4xx answer means the request itself is wrong and will be rejected again.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => {
                resp.code == 409 || resp.code == 429 || resp.code >= 500
            }
            Error::KubeError(_) => true,
            Error::HostSyncFailed { .. } => true,
            Error::ConfigError(_)
            | Error::NodeNotFound(_)
            | Error::InvalidTaintEffect(_) => false,
        }
    }

    /// Short category used as a metric label
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::ConfigError(_) => "config",
            Error::NodeNotFound(_) => "not_found",
            Error::InvalidTaintEffect(_) => "validation",
            Error::HostSyncFailed { .. } => "host_sync",
        }
    }
}
