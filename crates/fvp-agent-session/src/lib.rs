//! # fvp-agent-session
//!
//! Simulator lifecycle management for the FVP Agent.
//!
//! This crate provides:
//! - The debug bridge capability traits (`DebugModel`, `DebugTarget`,
//!   `BridgeConnector`)
//! - The `Simulator` lifecycle: setup, start, load, run, reset, shutdown
//! - ELF symbol lookup and the breakpoint-driven coverage extractor
//! - In-memory fakes of the bridge and launcher for tests
//!
//! ## Architecture
//!
//! This is Layer 2 in the architecture - it depends on fvp-agent-core and
//! fvp-agent-process and composes them with the debug bridge.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod coverage;
pub mod simulator;
pub mod symbols;
pub mod testing;

// Re-export commonly used types
pub use bridge::{Breakpoint, BridgeConnector, DebugModel, DebugTarget, UnlinkedBridge};
pub use coverage::{
    remove_gcda, CoverageCollector, CoverageExtractor, CoverageReport, LcovCollector,
};
pub use simulator::{Simulator, SimulatorOptions};
pub use symbols::{ReadelfSymbols, Symbol, SymbolSource, SymbolTable};
