//! # fvp-agent
//!
//! Model catalog listing and self test for Fast Model simulators.
//!
//! ## Architecture
//!
//! This is the top layer. It ties together:
//! - fvp-agent-core: settings and error types
//! - fvp-agent-process: launcher and port allocation
//! - fvp-agent-session: simulator lifecycle
//!
//! The binary is in main.rs.

pub mod catalog;
pub mod cli;

// Re-export commonly used types
pub use catalog::{
    catalog, iris_check, render_table, Availability, CatalogEntry, Report, SelfTestResult,
};
pub use cli::{CliArgs, Command};
pub use self_test::{run_with_deadline, self_test_deadline, SelfTest};
