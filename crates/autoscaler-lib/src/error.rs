//! Error taxonomy for the autoscaler core

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the autoscaler core
#[derive(Debug, Error)]
pub enum AutoscaleError {
    /// The configuration can never be satisfied; the daemon must exit
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A provisioning command exited with a disallowed code
    #[error("command `{command}` exited with code {code}")]
    CommandFailed { command: String, code: i32 },

    /// A provisioning command did not finish in time
    #[error("command `{command}` timed out after {}s", timeout.as_secs())]
    CommandTimeout { command: String, timeout: Duration },

    /// A provisioning command could not be started
    #[error("command `{command}` could not be started")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The container interface reported a failure
    #[error("docker {operation} failed: {message}")]
    Docker { operation: String, message: String },

    /// Output of the container interface could not be parsed
    #[error("could not parse {what}")]
    Parse {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    /// A constraint expression is malformed
    #[error("invalid constraint `{0}`")]
    InvalidConstraint(String),
}

impl AutoscaleError {
    /// Whether the error must stop the control loop
    pub fn is_fatal(&self) -> bool {
        matches!(self, AutoscaleError::Configuration(_))
    }
}

pub type Result<T, E = AutoscaleError> = std::result::Result<T, E>;
