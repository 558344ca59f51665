//! Error handling for the Bingo network core
//!
//! Configuration problems are rejected eagerly when a network or session is built.
//! Structural misuse and timer failures surface as typed errors; everything else in
//! the core is total and does not fail in steady state.

use std::fmt;
use thiserror::Error;

/// Error type for network construction, linking, windows and session operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    /// Invalid or unknown configuration values
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        setting: Option<String>,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Misuse of the node graph, segment or path arenas
    #[error("Network structure error: {message}")]
    Structure { message: String, node_id: Option<u64>, details: Option<String> },

    /// Timer service failures (clock unavailable, scheduler shut down)
    #[error("Scheduling error: {message}")]
    Scheduling { message: String, job: Option<u64>, fires_at: Option<u64> },

    /// Window lookups and window state misuse
    #[error("Window error: {message}")]
    Window { message: String, window_id: Option<u64> },

    /// Session misuse such as retracting an unknown fact
    #[error("Session error: {message}")]
    Session { message: String, fact_id: Option<u64>, operation: Option<String> },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String, component: Option<String> },
}

impl NetworkError {
    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            NetworkError::Configuration { .. } => "configuration",
            NetworkError::Structure { .. } => "structure",
            NetworkError::Scheduling { .. } => "scheduling",
            NetworkError::Window { .. } => "window",
            NetworkError::Session { .. } => "session",
            NetworkError::Internal { .. } => "internal",
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            NetworkError::Configuration { .. } => ErrorSeverity::Critical,
            NetworkError::Structure { .. } => ErrorSeverity::High,
            NetworkError::Scheduling { .. } => ErrorSeverity::Critical,
            NetworkError::Window { .. } => ErrorSeverity::Medium,
            NetworkError::Session { .. } => ErrorSeverity::Medium,
            NetworkError::Internal { .. } => ErrorSeverity::Critical,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            NetworkError::Configuration { .. } => false, // Config errors need fixing
            NetworkError::Structure { .. } => true,
            NetworkError::Scheduling { .. } => false, // Fatal for the owning session
            NetworkError::Window { .. } => true,
            NetworkError::Session { .. } => true,
            NetworkError::Internal { .. } => false,
        }
    }
}

/// Error severity levels for logging and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Result type alias for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Convenience constructors for common error scenarios
impl NetworkError {
    /// Create a configuration error
    pub fn configuration(
        setting: &str,
        expected: &str,
        actual: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            setting: Some(setting.to_string()),
            expected: Some(expected.to_string()),
            actual: Some(actual.to_string()),
        }
    }

    /// Create a structure error about a specific node
    pub fn unknown_node(node_id: u64) -> Self {
        Self::Structure {
            message: format!("node {node_id} is not part of the network"),
            node_id: Some(node_id),
            details: None,
        }
    }

    /// Create a structure error
    pub fn structure(message: impl Into<String>) -> Self {
        Self::Structure { message: message.into(), node_id: None, details: None }
    }

    /// Create a scheduling error
    pub fn scheduling(message: impl Into<String>) -> Self {
        Self::Scheduling { message: message.into(), job: None, fires_at: None }
    }

    /// Create a scheduling error for a job that could not be placed
    pub fn scheduling_job(job: u64, fires_at: u64, message: impl Into<String>) -> Self {
        Self::Scheduling { message: message.into(), job: Some(job), fires_at: Some(fires_at) }
    }

    /// Create an unknown window error
    pub fn unknown_window(window_id: u64) -> Self {
        Self::Window {
            message: format!("window {window_id} is not declared"),
            window_id: Some(window_id),
        }
    }

    /// Create a session error with fact context
    pub fn session_fact(fact_id: u64, operation: &str, message: impl Into<String>) -> Self {
        Self::Session {
            message: message.into(),
            fact_id: Some(fact_id),
            operation: Some(operation.to_string()),
        }
    }

    /// Create an internal error with component context
    pub fn internal_component(component: &str, message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), component: Some(component.to_string()) }
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(err: serde_json::Error) -> Self {
        NetworkError::Configuration {
            message: format!("JSON error: {err}"),
            setting: None,
            expected: None,
            actual: None,
        }
    }
}

impl From<serde_yaml::Error> for NetworkError {
    fn from(err: serde_yaml::Error) -> Self {
        NetworkError::Configuration {
            message: format!("YAML error: {err}"),
            setting: None,
            expected: None,
            actual: None,
        }
    }
}
