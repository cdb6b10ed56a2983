//! Error types for the FVP Agent.

use std::path::PathBuf;

use thiserror::Error;

use crate::{PortRange, SimulatorState};

/// Hint printed alongside catalog lookup failures.
pub const LIST_MODELS_HINT: &str = "Use 'fvp-agent --list' to list all the available Fast Models";

/// Main error type for FVP Agent operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Model name has no binary in the settings
    #[error("Fast model '{model}' not available. {hint}")]
    UnknownModel {
        /// Requested model name
        model: String,
        /// Remediation hint
        hint: String,
    },

    /// Named config set is absent for the model
    #[error("No config '{config}' available for fast model '{model}'. {hint}")]
    UnknownConfig {
        /// Requested model name
        model: String,
        /// Requested config name
        config: String,
        /// Remediation hint
        hint: String,
    },

    /// Model declares no terminal component
    #[error("Fast model '{model}' has no terminal component. {hint}")]
    MissingTerminalComponent {
        /// Requested model name
        model: String,
        /// Remediation hint
        hint: String,
    },

    /// Every slot of a port range is allocated
    #[error("No free port in range {0}")]
    PortsExhausted(PortRange),

    /// Port released twice or never allocated
    #[error("Port {0} is not allocated")]
    PortNotAllocated(u16),

    /// The vendor debug bridge library could not be located
    #[error("Fast model debug bridge not installed: {detail}. {hint}")]
    ToolchainNotInstalled {
        /// What was looked for
        detail: String,
        /// Remediation hint
        hint: String,
    },

    /// Simulator process could not be spawned
    #[error("Failed to launch simulator: {reason}. {hint}")]
    LaunchFailed {
        /// Underlying reason
        reason: String,
        /// Remediation hint
        hint: String,
    },

    /// Startup banner ended before its terminator
    #[error("Simulator startup banner protocol error: {0}")]
    LaunchProtocol(String),

    /// Terminal socket connect/read/write failure
    #[error("Terminal connection error: {0}")]
    Connection(String),

    /// Terminal session is not connected
    #[error("Terminal not connected")]
    NotConnected,

    /// Image file missing
    #[error("Image not found: {}", .0.display())]
    ImageNotFound(PathBuf),

    /// Bounded wait elapsed
    #[error("Timeout after {ms}ms: {context}")]
    Timeout {
        /// What was being waited for
        context: String,
        /// Bound in milliseconds
        ms: u64,
    },

    /// Operation not valid in the current lifecycle state
    #[error("Cannot {operation} while simulator is {state}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// Current state
        state: SimulatorState,
    },

    /// Debug bridge call failed
    #[error("Debug bridge error: {0}")]
    Bridge(String),

    /// Symbol missing from the image symbol table
    #[error("Symbol '{0}' not found in image")]
    SymbolNotFound(String),

    /// Coverage extraction failure
    #[error("Coverage error: {0}")]
    Coverage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with custom message
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of [`Error`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Unknown model, config or terminal component; malformed settings
    Configuration,
    /// No free port
    ResourceExhausted,
    /// Spawn, banner protocol or toolchain failure
    Launch,
    /// Terminal socket failure
    Connection,
    /// Missing image
    Image,
    /// Bounded wait elapsed
    Timeout,
    /// Operation called in the wrong lifecycle state
    State,
    /// Everything else
    Internal,
}

impl Error {
    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::UnknownModel { .. }
            | Error::UnknownConfig { .. }
            | Error::MissingTerminalComponent { .. }
            | Error::Config(_)
            | Error::Serialization(_) => ErrorCategory::Configuration,
            Error::PortsExhausted(_) => ErrorCategory::ResourceExhausted,
            Error::ToolchainNotInstalled { .. }
            | Error::LaunchFailed { .. }
            | Error::LaunchProtocol(_) => ErrorCategory::Launch,
            Error::Connection(_) | Error::NotConnected => ErrorCategory::Connection,
            Error::ImageNotFound(_) => ErrorCategory::Image,
            Error::Timeout { .. } => ErrorCategory::Timeout,
            Error::InvalidState { .. } => ErrorCategory::State,
            Error::PortNotAllocated(_)
            | Error::Bridge(_)
            | Error::SymbolNotFound(_)
            | Error::Coverage(_)
            | Error::Io(_)
            | Error::Other(_) => ErrorCategory::Internal,
        }
    }

    /// Remediation hint, if this error carries one.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Error::UnknownModel { hint, .. }
            | Error::UnknownConfig { hint, .. }
            | Error::MissingTerminalComponent { hint, .. }
            | Error::ToolchainNotInstalled { hint, .. }
            | Error::LaunchFailed { hint, .. } => Some(hint),
            _ => None,
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
