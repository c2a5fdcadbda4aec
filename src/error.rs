/// Unified error handling for the centinela session cache
///
/// Every failure the cache layer can produce maps onto one variant here.
/// Read paths degrade all of them to a cache miss; write and invalidation
/// paths surface them to the caller.

use crate::config::ConfigError;
use crate::core::PoolRole;
use std::fmt;
use std::io;
use thiserror::Error;

/// Main error type for cache layer operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// No connection could be handed out within the acquire timeout
    #[error("Pool exhausted: no {role} connection available within {waited_ms}ms")]
    PoolExhausted { role: PoolRole, waited_ms: u64 },

    /// The circuit breaker for this operation class is refusing calls
    #[error("Circuit open for {role} operations")]
    CircuitOpen { role: PoolRole },

    /// Low-level I/O or protocol failure reported by the cache backend
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// No primary has been resolved from any sentinel yet
    #[error("Topology unresolved: {message}")]
    TopologyUnresolved { message: String },

    /// The pool has no healthy node to connect to for this role
    #[error("No healthy {role} node available")]
    NoHealthyNode { role: PoolRole },

    /// Caller-supplied operation timeout elapsed
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Caller cancelled the operation
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    /// RESP framing or reply-shape errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Socket-level errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Errors reported by the external session store
    #[error("Session store error: {message}")]
    SessionStore { message: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for cache layer operations
pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    pub fn backend<S: Into<String>>(message: S) -> Self {
        CacheError::Backend {
            message: message.into(),
        }
    }

    pub fn topology_unresolved<S: Into<String>>(message: S) -> Self {
        CacheError::TopologyUnresolved {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        CacheError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        CacheError::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        CacheError::Protocol(message.into())
    }

    pub fn session_store<S: Into<String>>(message: S) -> Self {
        CacheError::SessionStore {
            message: message.into(),
        }
    }

    /// Check if a higher layer may retry the operation
    pub fn is_recoverable(&self) -> bool {
        match self {
            CacheError::PoolExhausted { .. } => true,
            CacheError::CircuitOpen { .. } => true,
            CacheError::Backend { .. } => true,
            CacheError::NoHealthyNode { .. } => true,
            CacheError::Timeout { .. } => true,
            CacheError::Network(_) => true,
            CacheError::TopologyUnresolved { .. } => true,
            _ => false,
        }
    }

    /// Whether this error should be recorded as a failure by a circuit breaker.
    ///
    /// Only errors that came back from talking to the backend count; local
    /// back-pressure and caller cancellation say nothing about backend health.
    pub fn counts_as_backend_failure(&self) -> bool {
        matches!(
            self,
            CacheError::Backend { .. }
                | CacheError::Network(_)
                | CacheError::Protocol(_)
                | CacheError::Timeout { .. }
                | CacheError::NoHealthyNode { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CacheError::Config(_) => ErrorSeverity::Critical,
            CacheError::TopologyUnresolved { .. } => ErrorSeverity::Error,
            CacheError::SessionStore { .. } => ErrorSeverity::Error,
            CacheError::Backend { .. } => ErrorSeverity::Warning,
            CacheError::Network(_) => ErrorSeverity::Warning,
            CacheError::Timeout { .. } => ErrorSeverity::Warning,
            CacheError::PoolExhausted { .. } => ErrorSeverity::Warning,
            CacheError::NoHealthyNode { .. } => ErrorSeverity::Warning,
            CacheError::CircuitOpen { .. } => ErrorSeverity::Info,
            CacheError::Cancelled { .. } => ErrorSeverity::Info,
            CacheError::Protocol(_) => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = CacheError::backend("connection reset");
        assert!(matches!(error, CacheError::Backend { .. }));
        assert_eq!(error.to_string(), "Backend error: connection reset");
    }

    #[test]
    fn test_pool_exhausted_display() {
        let error = CacheError::PoolExhausted {
            role: PoolRole::Write,
            waited_ms: 250,
        };
        assert_eq!(
            error.to_string(),
            "Pool exhausted: no write connection available within 250ms"
        );
    }

    #[test]
    fn test_error_severity() {
        let config_error = CacheError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let open = CacheError::CircuitOpen {
            role: PoolRole::Read,
        };
        assert_eq!(open.severity(), ErrorSeverity::Info);
    }

    #[test]
    fn test_breaker_classification() {
        assert!(CacheError::backend("boom").counts_as_backend_failure());
        assert!(CacheError::timeout("read").counts_as_backend_failure());
        assert!(!CacheError::cancelled("read").counts_as_backend_failure());
        assert!(!CacheError::CircuitOpen {
            role: PoolRole::Write
        }
        .counts_as_backend_failure());
        assert!(!CacheError::PoolExhausted {
            role: PoolRole::Read,
            waited_ms: 10
        }
        .counts_as_backend_failure());
    }

    #[test]
    fn test_error_recoverability() {
        let network_error =
            CacheError::Network(io::Error::new(io::ErrorKind::ConnectionRefused, "test"));
        assert!(network_error.is_recoverable());

        let config_error = CacheError::Config(ConfigError::ValidationError("test".to_string()));
        assert!(!config_error.is_recoverable());
    }
}
