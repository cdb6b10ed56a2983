//! # fvp-agent-core
//!
//! Core types for the FVP Agent.
//!
//! This crate contains all fundamental types with **no internal dependencies**
//! on other fvp-agent crates. It provides:
//!
//! - Error types and the crate-wide `Result` alias
//! - Settings types (model catalog, config sets, port ranges, terminal timing)
//! - Model parameter file parsing
//! - Port range type
//! - Simulator state and instance identifiers
//!
//! ## Architecture
//!
//! This is Layer 0 in the architecture - all other crates depend on this one,
//! but this crate has no dependencies on other fvp-agent crates.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod params;
pub mod ports;
pub mod state;

// Re-export commonly used types
pub use config::{
    CommonSettings, FvpSettings, ModelSettings, PortSettings, ResolvedModel, TerminalSettings,
    TimingSettings,
};
pub use error::{Error, ErrorCategory, Result};
pub use params::{ModelParams, ParamValue};
pub use ports::PortRange;
pub use state::{SimulatorId, SimulatorState};
