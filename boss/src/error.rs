//! Error types for the concierge service manager.

use thiserror::Error;

/// Result type alias for service manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the service manager.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed registration or manifest
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Circular dependency detected
    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    /// Service not found
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Service failed to start
    #[error("Service failed to start: {name}: {reason}")]
    ServiceStartFailed { name: String, reason: String },

    /// A dependency never reached a running state
    #[error("Service {service} not started: dependency {dependency} unavailable")]
    DependencyUnavailable { service: String, dependency: String },

    /// Service failed to stop
    #[error("Service failed to stop: {name}: {reason}")]
    ServiceStopFailed { name: String, reason: String },

    /// start_all_services called on a started manager
    #[error("Services already started; stop all services before starting again")]
    AlreadyStarted,

    /// register_service called after startup began
    #[error("Registration closed while services are started: {0}")]
    RegistrationClosed(String),

    /// Control socket protocol error
    #[error("Control error: {0}")]
    Control(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error describes a service that did not come up.
    pub fn is_start_failure(&self) -> bool {
        matches!(
            self,
            Error::ServiceStartFailed { .. } | Error::DependencyUnavailable { .. }
        )
    }
}

/// Errors returned by service implementations through the capability traits.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The service tried and failed
    #[error("{0}")]
    Failed(String),

    /// Something the service needs is missing (binary, model, endpoint)
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ServiceError {
    /// Shorthand for [`ServiceError::Failed`].
    pub fn failed(reason: impl Into<String>) -> Self {
        ServiceError::Failed(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_members() {
        let err = Error::CyclicDependency(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "Circular dependency detected: a -> b -> a");
    }

    #[test]
    fn test_dependency_unavailable_is_start_failure() {
        let err = Error::DependencyUnavailable {
            service: "llm".into(),
            dependency: "database".into(),
        };
        assert!(err.is_start_failure());
        assert!(!Error::AlreadyStarted.is_start_failure());
    }
}
