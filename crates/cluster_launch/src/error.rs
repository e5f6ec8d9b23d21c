//! Error types shared by every launcher backend

use crate::config::{ConfigError, TemplateError};
use crate::launcher::LauncherState;
use crate::runtime::ProcessError;
use std::sync::Arc;

/// Errors raised by launcher operations
///
/// A fatal error is returned to the caller and also delivered on the exit
/// channel, so every variant is cheap to clone.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LaunchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Job submission failed: {0}")]
    Submission(String),

    #[error("Remote command on '{host}' failed: {reason}")]
    RemoteConnection { host: String, reason: String },

    #[error("Cannot {operation} while launcher is {state}")]
    InvalidState {
        operation: &'static str,
        state: LauncherState,
    },

    #[error("'{target}' unreachable after {attempts} attempts: {reason}")]
    Unreachable {
        target: String,
        attempts: u32,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

impl LaunchError {
    /// Shorthand for an invalid option detected at runtime
    pub fn invalid(message: impl Into<String>) -> Self {
        LaunchError::Config(ConfigError::Invalid(message.into()))
    }
}

impl From<std::io::Error> for LaunchError {
    fn from(e: std::io::Error) -> Self {
        LaunchError::Io(Arc::new(e))
    }
}

impl From<ProcessError> for LaunchError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::SpawnFailed {
                executable, source, ..
            } => LaunchError::Spawn {
                program: executable,
                source: Arc::new(source),
            },
            ProcessError::SignalFailed { source, .. } => LaunchError::Io(Arc::new(source)),
        }
    }
}

/// Result type for launcher operations
pub type Result<T> = std::result::Result<T, LaunchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message() {
        let err = LaunchError::InvalidState {
            operation: "start",
            state: LauncherState::Running,
        };
        assert_eq!(err.to_string(), "Cannot start while launcher is running");
    }

    #[test]
    fn test_config_error_converts() {
        let err: LaunchError = ConfigError::Missing("profile_dir".to_string()).into();
        assert!(matches!(err, LaunchError::Config(ConfigError::Missing(_))));
    }

    #[test]
    fn test_spawn_error_from_process_error() {
        let err: LaunchError = ProcessError::SpawnFailed {
            name: "engines-0".to_string(),
            executable: "ipengine".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        }
        .into();
        assert!(matches!(err, LaunchError::Spawn { ref program, .. } if program == "ipengine"));
    }
}
