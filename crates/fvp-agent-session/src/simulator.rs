//! Simulator lifecycle.
//!
//! ```text
//! Unconfigured --setup--> Configured --start--> Running --shutdown--> ShutDown
//!                                               Running --load/run/reset--> Running
//! ```
//!
//! A failed `reset` leaves the instance `Stopped`; `start` brings it back.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;
use tracing::{debug, error, info, trace, warn};

use fvp_agent_core::config::expand_env;
use fvp_agent_core::{
    Error, FvpSettings, ModelParams, ResolvedModel, Result, SimulatorId, SimulatorState,
};
use fvp_agent_process::{
    BannerPorts, LaunchRequest, Launcher, PortHandle, SimulatorPorts, SimulatorProcess,
    TerminalChannel,
};

use crate::bridge::{BridgeConnector, DebugModel};
use crate::coverage::CoverageExtractor;

lazy_static! {
    /// Serializes setup across every simulator of the process.
    static ref SETUP_LOCK: Mutex<()> = Mutex::new(());
}

/// Debug server port assumed when the banner announces none.
pub const DEFAULT_IRIS_PORT: u16 = 7100;

/// Register of the terminal component holding its bound port.
pub const TERMINAL_PORT_REGISTER: &str = "Default.Port";

/// Per-instance options.
#[derive(Debug, Clone, Default)]
pub struct SimulatorOptions {
    /// Start a GDB server on an allocated port
    pub gdb_server: bool,
    /// Debug server port to use if the banner announces none
    pub iris_port: Option<u16>,
    /// Log every terminal write
    pub log_tx: bool,
}

/// Build the command line for a resolved model.
///
/// `telnet_port` pins the first terminal; `gdb_port` loads the GDB
/// remote-connection plugin listening on that port.
pub fn build_launch_request(
    settings: &FvpSettings,
    model: &ResolvedModel,
    telnet_port: Option<u16>,
    gdb_port: Option<u16>,
) -> Result<LaunchRequest> {
    let mut request = LaunchRequest::new(&model.binary).with_config_file(&model.config_file);
    for option in &model.options {
        request.push_option(option.clone());
    }

    if let Some(port) = telnet_port {
        request.push_option(format!("-C {}={port}", model.telnet_start_port_param));
    }

    if let Some(port) = gdb_port {
        let plugin = settings.common.gdbserver_plugin.as_deref().ok_or_else(|| {
            Error::Config("a GDB server was requested but 'gdbserver_plugin' is not set".to_string())
        })?;
        request.push_option("--allow-debug-plugin");
        request.push_option(format!("--plugin {}", expand_env(plugin)));
        request.push_option("-C REMOTE_CONNECTION.GDBRemoteConnection.listen_address=127.0.0.1");
        request.push_option(format!("-C REMOTE_CONNECTION.GDBRemoteConnection.port={port}"));
    }

    Ok(request)
}

/// One simulator instance and everything it holds: ports, child process,
/// debug bridge connection and terminal session.
///
/// Dropping it terminates the child and closes the socket.
pub struct Simulator {
    id: SimulatorId,
    settings: Arc<FvpSettings>,
    connector: Arc<dyn BridgeConnector>,
    launcher: Arc<dyn Launcher>,
    ports: SimulatorPorts,
    options: SimulatorOptions,
    coverage: Option<CoverageExtractor>,
    state: SimulatorState,
    model: Option<ResolvedModel>,
    request: Option<LaunchRequest>,
    telnet_port: Option<PortHandle>,
    gdb_port: Option<PortHandle>,
    process: Option<SimulatorProcess>,
    bridge: Option<Box<dyn DebugModel>>,
    terminal: TerminalChannel,
    terminal_port: Option<u16>,
    image: Option<PathBuf>,
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("model", &self.model.as_ref().map(|m| &m.name))
            .field("terminal_port", &self.terminal_port)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

impl Simulator {
    /// Create an unconfigured simulator.
    pub fn new(
        settings: Arc<FvpSettings>,
        connector: Arc<dyn BridgeConnector>,
        launcher: Arc<dyn Launcher>,
        ports: SimulatorPorts,
    ) -> Self {
        let terminal = TerminalChannel::new(&settings.common.terminal);
        Self {
            id: SimulatorId::new(),
            settings,
            connector,
            launcher,
            ports,
            options: SimulatorOptions::default(),
            coverage: None,
            state: SimulatorState::Unconfigured,
            model: None,
            request: None,
            telnet_port: None,
            gdb_port: None,
            process: None,
            bridge: None,
            terminal,
            terminal_port: None,
            image: None,
        }
    }

    /// Set instance options.
    pub fn with_options(mut self, options: SimulatorOptions) -> Self {
        self.terminal =
            TerminalChannel::new(&self.settings.common.terminal).with_tx_logging(options.log_tx);
        self.options = options;
        self
    }

    /// Use this extractor when the coverage config is active, instead of
    /// the host `readelf`/`lcov` tools in the working directory.
    pub fn with_coverage(mut self, extractor: CoverageExtractor) -> Self {
        self.coverage = Some(extractor);
        self
    }

    /// Instance identifier.
    pub fn id(&self) -> SimulatorId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SimulatorState {
        self.state
    }

    /// Resolved model, once set up.
    pub fn model(&self) -> Option<&ResolvedModel> {
        self.model.as_ref()
    }

    /// Command line used to launch the simulator, once set up.
    pub fn launch_request(&self) -> Option<&LaunchRequest> {
        self.request.as_ref()
    }

    /// Telnet start port reserved for this instance.
    pub fn telnet_port(&self) -> Option<u16> {
        self.telnet_port.as_ref().map(PortHandle::value)
    }

    /// GDB server port reserved for this instance.
    pub fn gdb_port(&self) -> Option<u16> {
        self.gdb_port.as_ref().map(PortHandle::value)
    }

    /// Port of the terminal the session talks to, once started.
    pub fn terminal_port(&self) -> Option<u16> {
        self.terminal_port
    }

    /// Image loaded most recently.
    pub fn image(&self) -> Option<&Path> {
        self.image.as_deref()
    }

    /// Whether a debug bridge model is held.
    pub fn is_simulator_alive(&self) -> bool {
        self.bridge.is_some()
    }

    /// The terminal session.
    pub fn terminal(&self) -> &TerminalChannel {
        &self.terminal
    }

    /// Resolve `model` and `config`, reserve ports and build the command line.
    ///
    /// On failure nothing changes.
    pub fn setup(&mut self, model: &str, config: &str) -> Result<()> {
        match self.state {
            SimulatorState::Unconfigured | SimulatorState::Configured => {}
            state => {
                return Err(Error::InvalidState {
                    operation: "set up",
                    state,
                })
            }
        }

        let _guard = SETUP_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let resolved = self.settings.resolve(model, config)?;
        let params = ModelParams::from_file(&resolved.config_file)?;
        debug!(
            simulator = %self.id,
            config_file = %resolved.config_file.display(),
            params = params.len(),
            "Model config parsed"
        );
        if params.is_empty() {
            warn!(
                simulator = %self.id,
                config_file = %resolved.config_file.display(),
                "Model config sets no parameters"
            );
        }
        for (key, value) in params.iter() {
            trace!(simulator = %self.id, key, value = ?value, "Model parameter");
        }

        let telnet = self.ports.allocate_telnet()?;
        let gdb = if self.options.gdb_server {
            Some(self.ports.allocate_gdb()?)
        } else {
            None
        };
        let request = build_launch_request(
            &self.settings,
            &resolved,
            Some(telnet.value()),
            gdb.as_ref().map(PortHandle::value),
        )?;

        info!(
            simulator = %self.id,
            model,
            config,
            telnet_port = telnet.value(),
            gdb_port = ?gdb.as_ref().map(PortHandle::value),
            "Simulator configured"
        );

        self.model = Some(resolved);
        self.request = Some(request);
        self.telnet_port = Some(telnet);
        self.gdb_port = gdb;
        self.state = SimulatorState::Configured;
        Ok(())
    }

    /// Launch the simulator and connect the debug bridge.
    pub fn start(&mut self) -> Result<()> {
        let prior = self.state;
        match prior {
            SimulatorState::Configured | SimulatorState::Stopped => {}
            state => {
                return Err(Error::InvalidState {
                    operation: "start",
                    state,
                })
            }
        }

        self.state = SimulatorState::Starting;
        match self.launch() {
            Ok(()) => {
                self.state = SimulatorState::Running;
                Ok(())
            }
            Err(e) => {
                error!(simulator = %self.id, error = %e, "Simulator failed to start");
                self.state = prior;
                Err(e)
            }
        }
    }

    /// Launch, connect the bridge and find the terminal port. Nothing is
    /// kept on failure.
    fn launch(&mut self) -> Result<()> {
        self.connector.locate(&self.settings)?;

        let request = self.request.as_ref().ok_or(Error::InvalidState {
            operation: "launch",
            state: self.state,
        })?;
        let process = self.launcher.launch(request)?;

        let iris_port = match process.iris_port() {
            Some(port) => port,
            None => {
                let port = self.options.iris_port.unwrap_or(DEFAULT_IRIS_PORT);
                warn!(simulator = %self.id, port, "Simulator announced no debug port, assuming default");
                port
            }
        };

        let host = &self.settings.common.terminal.host;
        let mut bridge = self.connector.connect(host, iris_port)?;

        let terminal_port = match process.terminal_port(0) {
            Some(port) => port,
            None => {
                let component = self
                    .model
                    .as_ref()
                    .map(|m| m.terminal_component.as_str())
                    .unwrap_or_default();
                match terminal_port_from_register(&mut *bridge, component) {
                    Ok(port) => port,
                    Err(e) => {
                        if let Err(release) = bridge.release(true) {
                            warn!(error = %release, "Failed to release model after launch failure");
                        }
                        return Err(e);
                    }
                }
            }
        };

        info!(
            simulator = %self.id,
            pid = ?process.pid(),
            iris_port,
            terminal_port,
            "Simulator started"
        );
        self.process = Some(process);
        self.bridge = Some(bridge);
        self.terminal_port = Some(terminal_port);
        Ok(())
    }

    /// Launch the configured simulator, read its banner and terminate it.
    ///
    /// No bridge connection is made and the state stays `Configured`.
    pub fn test_launch(&mut self) -> Result<BannerPorts> {
        if self.state != SimulatorState::Configured {
            return Err(Error::InvalidState {
                operation: "test_launch",
                state: self.state,
            });
        }

        self.connector.locate(&self.settings)?;
        let request = self.request.as_ref().ok_or(Error::InvalidState {
            operation: "test_launch",
            state: self.state,
        })?;
        let mut process = self.launcher.launch(request)?;
        let ports = *process.ports();
        process.terminate()?;

        if ports.iris_port.is_none() && ports.terminal_port(0).is_none() {
            return Err(Error::LaunchProtocol(
                "simulator announced no ports".to_string(),
            ));
        }
        Ok(ports)
    }

    /// Load an image through the first CPU and remember it for reset.
    pub fn load<P: AsRef<Path>>(&mut self, image: P) -> Result<()> {
        let id = self.id;
        let bridge = self.bridge_mut("load")?;

        let image = image.as_ref();
        if !image.is_file() {
            return Err(Error::ImageNotFound(image.to_path_buf()));
        }
        let path = fs::canonicalize(image)?;

        bridge.cpu(0)?.load_application(&path)?;
        info!(simulator = %id, image = %path.display(), "Image loaded");
        self.image = Some(path);
        Ok(())
    }

    /// Start execution and connect the terminal.
    ///
    /// If the CPU is already executing only a lost terminal is reconnected.
    pub fn run(&mut self) -> Result<()> {
        let id = self.id;
        let timeout = Duration::from_millis(self.settings.common.timing.run_timeout_ms);
        let bridge = self.bridge_mut("run")?;

        if bridge.cpu(0)?.is_running()? {
            if self.terminal.is_connected() {
                warn!(simulator = %id, "Simulator already running");
                return Ok(());
            }
            info!(simulator = %id, "Simulator running, reconnecting terminal");
        } else {
            bridge.run(false, timeout)?;
            debug!(simulator = %id, "Simulator running");
        }

        self.connect_terminal()
    }

    fn connect_terminal(&mut self) -> Result<()> {
        let port = self.terminal_port.ok_or(Error::NotConnected)?;
        let host = self.settings.common.terminal.host.clone();
        self.terminal.connect(&host, port)
    }

    /// Relaunch the simulator, reload the last image and run it again.
    ///
    /// The old terminal and process are gone before the new ones appear.
    /// A failed relaunch leaves the instance `Stopped`.
    pub fn reset(&mut self) -> Result<()> {
        if self.state != SimulatorState::Running {
            return Err(Error::InvalidState {
                operation: "reset",
                state: self.state,
            });
        }
        info!(simulator = %self.id, "Resetting simulator");

        self.terminal.disconnect();
        if let Err(e) = self.release_bridge() {
            warn!(simulator = %self.id, error = %e, "Failed to release model during reset");
        }
        thread::sleep(self.release_settle());
        self.terminate_process();
        self.terminal_port = None;
        self.state = SimulatorState::Stopped;

        self.launch()?;
        self.state = SimulatorState::Running;

        if let Some(image) = self.image.clone() {
            self.load(&image)?;
        }
        self.run()
    }

    /// Tear everything down. Runs coverage extraction first when the
    /// coverage config is active. Safe in any state; a second call does
    /// nothing.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == SimulatorState::ShutDown {
            debug!(simulator = %self.id, "Simulator already shut down");
            return Ok(());
        }

        let coverage_active = self
            .model
            .as_ref()
            .is_some_and(|m| self.settings.is_coverage_config(&m.config_name));
        if coverage_active && self.state == SimulatorState::Running {
            self.extract_coverage();
        }

        if self.bridge.is_some() {
            info!(simulator = %self.id, "Shutting down simulator");
        } else {
            info!(simulator = %self.id, "Simulator already stopped");
        }
        let result = self.teardown();
        self.state = SimulatorState::ShutDown;
        result
    }

    fn extract_coverage(&mut self) {
        let Some(image) = self.image.clone() else {
            warn!(simulator = %self.id, "No image loaded, skipping coverage extraction");
            return;
        };
        let extractor = self.coverage.clone().unwrap_or_else(|| {
            let work_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            CoverageExtractor::with_host_tools(
                work_dir,
                Duration::from_millis(self.settings.common.timing.breakpoint_timeout_ms),
            )
        });
        let id = self.id;
        let Some(bridge) = self.bridge.as_mut() else {
            return;
        };

        match extractor.extract(&mut **bridge, &image) {
            Ok(report) => info!(
                simulator = %id,
                files = report.files.len(),
                completed = report.completed,
                "Coverage collected"
            ),
            Err(e) => error!(simulator = %id, error = %e, "Coverage extraction failed"),
        }
    }

    fn teardown(&mut self) -> Result<()> {
        self.terminal.disconnect();
        let released = self.release_bridge();
        if matches!(released, Ok(true) | Err(_)) {
            thread::sleep(self.release_settle());
        }
        self.terminate_process();
        self.terminal_port = None;
        self.telnet_port = None;
        self.gdb_port = None;
        released.map(|_| ())
    }

    /// Release the bridge model with shutdown. Returns whether one was held.
    fn release_bridge(&mut self) -> Result<bool> {
        match self.bridge.take() {
            Some(mut bridge) => bridge.release(true).map(|()| true),
            None => Ok(false),
        }
    }

    fn terminate_process(&mut self) {
        if let Some(mut process) = self.process.take() {
            if !process.is_alive() {
                debug!(
                    simulator = %self.id,
                    pid = process.pid(),
                    "Simulator process already exited"
                );
            }
            if let Err(e) = process.terminate() {
                warn!(simulator = %self.id, error = %e, "Failed to terminate simulator process");
            }
        }
    }

    fn release_settle(&self) -> Duration {
        Duration::from_millis(self.settings.common.timing.release_settle_ms)
    }

    fn bridge_mut(&mut self, operation: &'static str) -> Result<&mut Box<dyn DebugModel>> {
        if self.state != SimulatorState::Running {
            return Err(Error::InvalidState {
                operation,
                state: self.state,
            });
        }
        let state = self.state;
        self.bridge
            .as_mut()
            .ok_or(Error::InvalidState { operation, state })
    }

    /// Read from the terminal. See [`TerminalChannel::read`].
    pub fn read(&mut self, delimiter: Option<&[u8]>, max_bytes: Option<usize>) -> Result<Vec<u8>> {
        self.terminal.read(delimiter, max_bytes)
    }

    /// Read one line from the terminal.
    pub fn read_line(&mut self) -> Result<String> {
        self.terminal.read_line()
    }

    /// Write to the terminal at the configured pace.
    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        self.terminal.write(payload)
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        if self.state != SimulatorState::ShutDown {
            if let Err(e) = self.teardown() {
                warn!(simulator = %self.id, error = %e, "Error tearing down simulator");
            }
        }
    }
}

fn terminal_port_from_register(bridge: &mut dyn DebugModel, component: &str) -> Result<u16> {
    warn!(
        component,
        "Terminal port not announced, reading {} register", TERMINAL_PORT_REGISTER
    );
    let value = bridge
        .target(component)?
        .read_register(TERMINAL_PORT_REGISTER)?;
    u16::try_from(value).map_err(|_| {
        Error::Bridge(format!(
            "{component} {TERMINAL_PORT_REGISTER} value {value} is not a TCP port"
        ))
    })
}
