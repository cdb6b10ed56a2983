//! Debug bridge capability.
//!
//! The vendor debug API (Iris) is reached through these traits only, so the
//! lifecycle and the coverage extractor never depend on its wire format.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fvp_agent_core::{Error, FvpSettings, Result};
use fvp_agent_process::locate_iris;

/// A program breakpoint installed on a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    /// Address the breakpoint was placed at
    pub address: u64,
}

/// One component of a connected model: a CPU or a peripheral.
pub trait DebugTarget: Send {
    /// Instance name of the component.
    fn name(&self) -> &str;

    /// Load an application image into the component.
    fn load_application(&mut self, path: &Path) -> Result<()>;

    /// Whether the component is executing.
    fn is_running(&mut self) -> Result<bool>;

    /// Read a named register.
    fn read_register(&mut self, name: &str) -> Result<u64>;

    /// Read `count` units of `size` bytes starting at `address`.
    fn read_memory(&mut self, address: u64, size: usize, count: usize) -> Result<Vec<u8>>;

    /// Install a program breakpoint.
    fn add_bpt_prog(&mut self, address: u64) -> Result<Breakpoint>;
}

/// A model connected through the debug bridge.
pub trait DebugModel: Send {
    /// CPU by index, in model order.
    fn cpu(&mut self, index: usize) -> Result<&mut dyn DebugTarget>;

    /// Component by instance name.
    fn target(&mut self, name: &str) -> Result<&mut dyn DebugTarget>;

    /// Start execution. A blocking run returns once the model stops and
    /// fails with [`Error::Timeout`] if it has not stopped within `timeout`.
    fn run(&mut self, blocking: bool, timeout: Duration) -> Result<()>;

    /// Stop execution.
    fn stop(&mut self) -> Result<()>;

    /// Disconnect; with `shutdown` the simulator process exits as well.
    fn release(&mut self, shutdown: bool) -> Result<()>;
}

/// Opens [`DebugModel`] connections.
pub trait BridgeConnector: Send + Sync {
    /// Locate the bridge client library before a simulator is spawned.
    fn locate(&self, settings: &FvpSettings) -> Result<PathBuf> {
        locate_iris(settings)
    }

    /// Connect to the debug server of a running simulator.
    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn DebugModel>>;
}

/// Connector for builds that link no bridge client.
///
/// Locating the Iris library works as usual, connecting always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlinkedBridge;

impl BridgeConnector for UnlinkedBridge {
    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn DebugModel>> {
        Err(Error::Bridge(format!(
            "no debug bridge client available to connect to {host}:{port}"
        )))
    }
}
