//! Simulator lifecycle state and instance identifiers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one simulator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimulatorId(Uuid);

impl SimulatorId {
    /// Create a new random simulator ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SimulatorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SimulatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a simulator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulatorState {
    /// No model resolved yet
    Unconfigured,
    /// Model, config and ports resolved
    Configured,
    /// Process launching, debug bridge connecting
    Starting,
    /// Process alive and debug bridge connected
    Running,
    /// Process released, relaunch pending
    Stopped,
    /// Torn down
    ShutDown,
}

impl std::fmt::Display for SimulatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimulatorState::Unconfigured => write!(f, "unconfigured"),
            SimulatorState::Configured => write!(f, "configured"),
            SimulatorState::Starting => write!(f, "starting"),
            SimulatorState::Running => write!(f, "running"),
            SimulatorState::Stopped => write!(f, "stopped"),
            SimulatorState::ShutDown => write!(f, "shut down"),
        }
    }
}
