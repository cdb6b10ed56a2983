//! In-memory stand-ins for the debug bridge, the launcher and the host
//! tools, for exercising the lifecycle and coverage extraction without a
//! simulator.
//!
//! Every fake records what it was asked to do into a shared event log so
//! tests can assert on ordering across components.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fvp_agent_core::{Error, FvpSettings, Result};
use fvp_agent_process::{BannerPorts, LaunchRequest, Launcher, ProcessHandle, SimulatorProcess};

use crate::bridge::{Breakpoint, BridgeConnector, DebugModel, DebugTarget};
use crate::coverage::CoverageCollector;
use crate::symbols::{SymbolSource, SymbolTable};

/// Name of the CPU every fake model exposes.
pub const FAKE_CPU: &str = "cpu0";

/// Ordered log of calls made on the fakes.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn push<S: Into<String>>(&self, event: S) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.into());
    }

    /// Snapshot of every event so far.
    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of events starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    /// Position of the first event at or after `from` starting with `prefix`.
    pub fn position(&self, prefix: &str, from: usize) -> Option<usize> {
        self.events()
            .iter()
            .skip(from)
            .position(|e| e.starts_with(prefix))
            .map(|i| i + from)
    }
}

#[derive(Debug, Default)]
struct BridgeState {
    registers: HashMap<(String, String), u64>,
    memory: BTreeMap<u64, u8>,
    stops: VecDeque<u64>,
    running: bool,
    breakpoints: Vec<u64>,
    memory_end: Option<u64>,
    refuse_connect: bool,
    refuse_locate: bool,
}

/// Fake [`BridgeConnector`] whose models share one scripted state.
#[derive(Debug, Clone, Default)]
pub struct FakeBridge {
    state: Arc<Mutex<BridgeState>>,
    events: EventLog,
}

impl FakeBridge {
    /// Create a bridge logging into `events`.
    pub fn new(events: EventLog) -> Self {
        Self {
            state: Arc::default(),
            events,
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BridgeState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Set a register of a target.
    pub fn set_register(&self, target: &str, name: &str, value: u64) {
        self.with_state(|s| {
            s.registers
                .insert((target.to_string(), name.to_string()), value)
        });
    }

    /// Store bytes in target memory.
    pub fn write_memory(&self, address: u64, bytes: &[u8]) {
        self.with_state(|s| {
            for (offset, byte) in bytes.iter().enumerate() {
                s.memory.insert(address + offset as u64, *byte);
            }
        });
    }

    /// Make reads at or past `end` fail, as unmapped memory does.
    pub fn set_memory_end(&self, end: u64) {
        self.with_state(|s| s.memory_end = Some(end));
    }

    /// Queue the PC the CPU stops at after the next blocking run. A
    /// blocking run with nothing queued times out.
    pub fn push_stop(&self, pc: u64) {
        self.with_state(|s| s.stops.push_back(pc));
    }

    /// Make the CPU report that it is already executing.
    pub fn set_running(&self, running: bool) {
        self.with_state(|s| s.running = running);
    }

    /// Make every connect attempt fail.
    pub fn refuse_connect(&self, refuse: bool) {
        self.with_state(|s| s.refuse_connect = refuse);
    }

    /// Make locating the bridge library fail.
    pub fn refuse_locate(&self, refuse: bool) {
        self.with_state(|s| s.refuse_locate = refuse);
    }

    /// Breakpoint addresses installed so far.
    pub fn breakpoints(&self) -> Vec<u64> {
        self.with_state(|s| s.breakpoints.clone())
    }

    /// The shared event log.
    pub fn events(&self) -> &EventLog {
        &self.events
    }
}

impl BridgeConnector for FakeBridge {
    fn locate(&self, _settings: &FvpSettings) -> Result<PathBuf> {
        if self.with_state(|s| s.refuse_locate) {
            return Err(Error::ToolchainNotInstalled {
                detail: "fake bridge library missing".to_string(),
                hint: "none".to_string(),
            });
        }
        Ok(PathBuf::from("/fake/Iris/Python"))
    }

    fn connect(&self, host: &str, port: u16) -> Result<Box<dyn DebugModel>> {
        if self.with_state(|s| s.refuse_connect) {
            self.events.push(format!("connect-refused {host}:{port}"));
            return Err(Error::Bridge(format!("connection to {host}:{port} refused")));
        }
        self.events.push(format!("connect {host}:{port}"));
        Ok(Box::new(FakeModel {
            bridge: self.clone(),
            cpu: FakeTarget::new(FAKE_CPU, self.clone()),
            targets: HashMap::new(),
            released: false,
        }))
    }
}

/// Model handed out by [`FakeBridge`].
#[derive(Debug)]
pub struct FakeModel {
    bridge: FakeBridge,
    cpu: FakeTarget,
    targets: HashMap<String, FakeTarget>,
    released: bool,
}

impl FakeModel {
    fn check_connected(&self) -> Result<()> {
        if self.released {
            Err(Error::Bridge("model already released".to_string()))
        } else {
            Ok(())
        }
    }
}

impl DebugModel for FakeModel {
    fn cpu(&mut self, index: usize) -> Result<&mut dyn DebugTarget> {
        self.check_connected()?;
        if index == 0 {
            Ok(&mut self.cpu)
        } else {
            Err(Error::Bridge(format!("no cpu {index}")))
        }
    }

    fn target(&mut self, name: &str) -> Result<&mut dyn DebugTarget> {
        self.check_connected()?;
        let bridge = self.bridge.clone();
        Ok(self
            .targets
            .entry(name.to_string())
            .or_insert_with(|| FakeTarget::new(name, bridge)))
    }

    fn run(&mut self, blocking: bool, timeout: Duration) -> Result<()> {
        self.check_connected()?;
        self.bridge
            .events
            .push(if blocking { "run blocking" } else { "run" });
        if !blocking {
            self.bridge.with_state(|s| s.running = true);
            return Ok(());
        }
        match self.bridge.with_state(|s| s.stops.pop_front()) {
            Some(pc) => {
                self.bridge.set_register(FAKE_CPU, "PC", pc);
                Ok(())
            }
            None => Err(Error::Timeout {
                context: "run to breakpoint".to_string(),
                ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.check_connected()?;
        self.bridge.events.push("stop");
        self.bridge.with_state(|s| s.running = false);
        Ok(())
    }

    fn release(&mut self, shutdown: bool) -> Result<()> {
        self.check_connected()?;
        self.bridge.events.push(format!("release shutdown={shutdown}"));
        self.bridge.with_state(|s| s.running = false);
        self.released = true;
        Ok(())
    }
}

/// Component of a [`FakeModel`].
#[derive(Debug)]
pub struct FakeTarget {
    name: String,
    bridge: FakeBridge,
}

impl FakeTarget {
    fn new(name: &str, bridge: FakeBridge) -> Self {
        Self {
            name: name.to_string(),
            bridge,
        }
    }
}

impl DebugTarget for FakeTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_application(&mut self, path: &Path) -> Result<()> {
        self.bridge
            .events
            .push(format!("load {}", path.display()));
        Ok(())
    }

    fn is_running(&mut self) -> Result<bool> {
        Ok(self.bridge.with_state(|s| s.running))
    }

    fn read_register(&mut self, name: &str) -> Result<u64> {
        let key = (self.name.clone(), name.to_string());
        self.bridge
            .with_state(|s| s.registers.get(&key).copied())
            .ok_or_else(|| Error::Bridge(format!("{} has no register {name}", self.name)))
    }

    fn read_memory(&mut self, address: u64, size: usize, count: usize) -> Result<Vec<u8>> {
        let len = (size * count) as u64;
        if let Some(end) = self.bridge.with_state(|s| s.memory_end) {
            if address + len > end {
                return Err(Error::Bridge(format!(
                    "read of {len} bytes at {address:#x} crosses unmapped memory at {end:#x}"
                )));
            }
        }
        Ok(self.bridge.with_state(|s| {
            (address..address + len)
                .map(|a| s.memory.get(&a).copied().unwrap_or(0))
                .collect()
        }))
    }

    fn add_bpt_prog(&mut self, address: u64) -> Result<Breakpoint> {
        self.bridge.events.push(format!("breakpoint {address:#x}"));
        self.bridge.with_state(|s| s.breakpoints.push(address));
        Ok(Breakpoint { address })
    }
}

#[derive(Debug, Default)]
struct LauncherState {
    requests: Vec<LaunchRequest>,
    alive: usize,
    max_alive: usize,
    fail_next: Option<String>,
}

/// Fake [`Launcher`] handing out processes with a fixed banner.
#[derive(Debug, Clone)]
pub struct FakeLauncher {
    ports: BannerPorts,
    state: Arc<Mutex<LauncherState>>,
    events: EventLog,
}

impl FakeLauncher {
    /// Create a launcher whose processes announce `ports`.
    pub fn new(ports: BannerPorts, events: EventLog) -> Self {
        Self {
            ports,
            state: Arc::default(),
            events,
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut LauncherState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Make the next launch fail with a banner protocol error.
    pub fn fail_next(&self, reason: &str) {
        self.with_state(|s| s.fail_next = Some(reason.to_string()));
    }

    /// Every request launched so far.
    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.with_state(|s| s.requests.clone())
    }

    /// Processes currently alive.
    pub fn alive(&self) -> usize {
        self.with_state(|s| s.alive)
    }

    /// Most processes ever alive at once.
    pub fn max_alive(&self) -> usize {
        self.with_state(|s| s.max_alive)
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<SimulatorProcess> {
        if let Some(reason) = self.with_state(|s| s.fail_next.take()) {
            self.events.push("launch-failed");
            return Err(Error::LaunchProtocol(reason));
        }
        let pid = self.with_state(|s| {
            s.requests.push(request.clone());
            s.alive += 1;
            s.max_alive = s.max_alive.max(s.alive);
            s.requests.len() as u32
        });
        self.events.push(format!("launch {pid}"));
        let process = FakeProcess {
            pid,
            alive: true,
            launcher: self.clone(),
        };
        Ok(SimulatorProcess::new(Box::new(process), self.ports))
    }
}

/// Process handed out by [`FakeLauncher`].
#[derive(Debug)]
pub struct FakeProcess {
    pid: u32,
    alive: bool,
    launcher: FakeLauncher,
}

impl ProcessHandle for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_alive(&mut self) -> bool {
        self.alive
    }

    fn terminate(&mut self, _grace: Duration) -> Result<()> {
        if self.alive {
            self.alive = false;
            self.launcher.with_state(|s| s.alive -= 1);
            self.launcher.events.push(format!("terminate {}", self.pid));
        }
        Ok(())
    }
}

/// [`SymbolSource`] returning a fixed table.
#[derive(Debug, Clone, Default)]
pub struct FixedSymbols(pub SymbolTable);

impl SymbolSource for FixedSymbols {
    fn symbols(&self, _image: &Path) -> Result<SymbolTable> {
        Ok(self.0.clone())
    }
}

/// [`CoverageCollector`] that only records its calls.
#[derive(Debug, Clone, Default)]
pub struct RecordingCollector(EventLog);

impl RecordingCollector {
    /// Create a collector logging into `events`.
    pub fn new(events: EventLog) -> Self {
        Self(events)
    }
}

impl CoverageCollector for RecordingCollector {
    fn collect(&self, _work_dir: &Path, name: &str) -> Result<()> {
        self.0.push(format!("collect {name}"));
        Ok(())
    }
}
