use serde::Serialize;

/// Shared error type used across all control-plane crates.
///
/// Variants follow the failure taxonomy of the RPC surface: validation
/// and domain errors carry a message that goes verbatim into the
/// `messages` field of a failed response; external-service errors are
/// redacted before they reach a client (the full cause is logged).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport-level failure talking to a collaborator service.
    #[error("HTTP: {0}")]
    Http(String),

    /// A collaborator service answered with an error status.
    #[error("service {service}: {message}")]
    Service { service: String, message: String },

    /// The entity vanished from the catalog listing between reads.
    #[error("{0} removed externally")]
    RemovedExternally(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Request arguments failed schema or invariant checks.
    #[error("{0}")]
    Validation(String),

    /// Lock table conflict.
    #[error("{0}")]
    Lock(String),

    /// Operation not legal in the current lifecycle state.
    #[error("{0}")]
    State(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The message a UI client is allowed to see.
    ///
    /// External failures are collapsed to a stable sentence; the caller
    /// is expected to log the full error before calling this.
    pub fn user_message(&self) -> String {
        match self {
            Error::Http(_) | Error::Service { .. } => "Service unavailable.".to_owned(),
            Error::Io(_) | Error::Json(_) | Error::Config(_) | Error::Other(_) => {
                "System error.".to_owned()
            }
            other => other.to_string(),
        }
    }
}

/// Severity of a configuration validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSeverity {
    Warning,
    Error,
}

/// A single finding produced by [`crate::config::Config::validate`].
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}
