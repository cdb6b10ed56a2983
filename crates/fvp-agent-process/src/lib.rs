//! # fvp-agent-process
//!
//! Simulator process plumbing for the FVP Agent.
//!
//! This crate provides:
//! - Port allocation from bounded, stepped ranges with scoped release
//! - Simulator process launch and startup banner parsing
//! - The telnet terminal channel (connect with retry, bounded read, paced write)
//!
//! ## Architecture
//!
//! This is Layer 1 in the architecture - it depends on fvp-agent-core
//! and knows nothing about the debug bridge or the lifecycle state machine.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod banner;
pub mod launcher;
pub mod terminal;

// Re-export commonly used types
pub use allocator::{PortAllocator, PortHandle, RangeId, SimulatorPorts};
pub use banner::{parse_banner, BannerPorts, TERMINAL_COUNT};
pub use launcher::{
    locate_iris, ChildProcess, FvpLauncher, LaunchRequest, Launcher, ProcessHandle,
    SimulatorProcess,
};
pub use terminal::TerminalChannel;
