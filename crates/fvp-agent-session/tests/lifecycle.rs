//! Lifecycle tests against the fake bridge and launcher.
//!
//! The terminal port points at a loopback listener that is never accepted
//! from; the kernel backlog is enough for connects and small writes.

use std::fs;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use fvp_agent_core::{Error, ErrorCategory, FvpSettings, PortRange, SimulatorState};
use fvp_agent_process::{BannerPorts, SimulatorPorts, TERMINAL_COUNT};
use fvp_agent_session::simulator::DEFAULT_IRIS_PORT;
use fvp_agent_session::testing::{EventLog, FakeBridge, FakeLauncher};
use fvp_agent_session::{Simulator, SimulatorOptions};

const MODEL: &str = "FVP_MPS2_M3";
const UART: &str = "component.IoFPGA.uart0";

struct Harness {
    dir: TempDir,
    settings: Arc<FvpSettings>,
    events: EventLog,
    bridge: FakeBridge,
    launcher: FakeLauncher,
    listener: TcpListener,
    image: PathBuf,
}

impl Harness {
    fn new() -> Self {
        Self::with_banner(|_| {})
    }

    /// Build a harness; `edit` adjusts the banner the fake simulator prints.
    fn with_banner(edit: impl FnOnce(&mut BannerPorts)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("configs")).unwrap();
        fs::write(
            dir.path().join("configs").join("MPS2.conf"),
            "# MPS2 defaults\nfvp_mps2.platform_type=1\nfvp_mps2.UART0.shutdown_on_eot=\"true\"\n",
        )
        .unwrap();
        let image = dir.path().join("img.elf");
        fs::write(&image, b"\x7fELF").unwrap();

        let json = format!(
            r#"{{
                "COMMON": {{
                    "configs": {{"DEFAULT": "MPS2.conf", "COVERAGE": "MPS2.conf"}},
                    "timing": {{"release_settle_ms": 1, "run_timeout_ms": 100,
                                "breakpoint_timeout_ms": 100, "terminate_grace_ms": 10}},
                    "terminal": {{"connect_attempts": 1, "settle_delay_ms": 1,
                                  "connect_timeout_ms": 500}}
                }},
                "{MODEL}": {{
                    "model_binary": "/opt/FVP_MPS2/FVP_MPS2_Cortex-M3",
                    "terminal_component": "{UART}"
                }},
                "FVP_NO_UART": {{
                    "model_binary": "/opt/FVP_MPS2/FVP_MPS2_Cortex-M3"
                }}
            }}"#
        );
        let settings = FvpSettings::from_json(&json)
            .unwrap()
            .with_base_dir(dir.path());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut banner = BannerPorts {
            iris_port: Some(DEFAULT_IRIS_PORT + 1),
            terminal_ports: [None; TERMINAL_COUNT],
        };
        banner.terminal_ports[0] = Some(listener.local_addr().unwrap().port());
        edit(&mut banner);

        let events = EventLog::new();
        Self {
            bridge: FakeBridge::new(events.clone()),
            launcher: FakeLauncher::new(banner, events.clone()),
            events,
            settings: Arc::new(settings),
            listener,
            image,
            dir,
        }
    }

    fn listener_port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    fn simulator(&self, ports: &SimulatorPorts) -> Simulator {
        Simulator::new(
            self.settings.clone(),
            Arc::new(self.bridge.clone()),
            Arc::new(self.launcher.clone()),
            ports.clone(),
        )
    }
}

fn ports() -> SimulatorPorts {
    SimulatorPorts::with_ranges(
        PortRange::new(15000, 15040, 4).unwrap(),
        PortRange::new(16000, 16010, 1).unwrap(),
    )
    .unwrap()
}

#[test]
fn unknown_model_stays_unconfigured() {
    let harness = Harness::new();
    let ports = ports();
    let mut sim = harness.simulator(&ports);

    let err = sim.setup("FVP_NOPE", "DEFAULT").unwrap_err();
    assert!(matches!(err, Error::UnknownModel { .. }));
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(err.hint().is_some());
    assert_eq!(sim.state(), SimulatorState::Unconfigured);
    assert_eq!(sim.telnet_port(), None);
    assert!(!ports.allocator().is_allocated(15000));
}

#[test]
fn unknown_config_and_missing_terminal_component() {
    let harness = Harness::new();
    let ports = ports();
    let mut sim = harness.simulator(&ports);

    let err = sim.setup(MODEL, "NOPE").unwrap_err();
    assert!(matches!(err, Error::UnknownConfig { .. }));
    assert_eq!(sim.state(), SimulatorState::Unconfigured);

    let err = sim.setup("FVP_NO_UART", "DEFAULT").unwrap_err();
    assert!(matches!(err, Error::MissingTerminalComponent { .. }));
    assert_eq!(sim.state(), SimulatorState::Unconfigured);
}

#[test]
fn setup_reserves_port_and_builds_command_line() {
    let harness = Harness::new();
    let ports = ports();
    let mut sim = harness.simulator(&ports);

    sim.setup(MODEL, "DEFAULT").unwrap();
    assert_eq!(sim.state(), SimulatorState::Configured);
    assert_eq!(sim.telnet_port(), Some(15000));
    assert_eq!(sim.gdb_port(), None);

    let args = sim.launch_request().unwrap().args();
    assert_eq!(&args[..2], ["-I", "-p"]);
    assert!(args[3].ends_with("MPS2.conf"));
    assert_eq!(
        args.last().unwrap(),
        "mps3_board.telnetterminal0.start_port=15000"
    );
}

#[test]
fn full_lifecycle_and_double_shutdown() {
    let harness = Harness::new();
    let ports = ports();
    let mut sim = harness.simulator(&ports);

    sim.setup(MODEL, "DEFAULT").unwrap();
    sim.start().unwrap();
    assert_eq!(sim.state(), SimulatorState::Running);
    assert!(sim.is_simulator_alive());
    assert_eq!(sim.terminal_port(), Some(harness.listener_port()));

    sim.load(&harness.image).unwrap();
    sim.run().unwrap();
    assert!(sim.terminal().is_connected());
    sim.write(b"ok\n").unwrap();

    let events = harness.events.events();
    assert_eq!(events[0], "launch 1");
    assert_eq!(events[1], format!("connect 127.0.0.1:{}", DEFAULT_IRIS_PORT + 1));
    assert!(events[2].starts_with("load ") && events[2].ends_with("img.elf"));
    assert_eq!(events[3], "run");

    sim.shutdown().unwrap();
    assert_eq!(sim.state(), SimulatorState::ShutDown);
    assert!(!sim.is_simulator_alive());
    assert!(!sim.terminal().is_connected());
    assert_eq!(harness.launcher.alive(), 0);
    assert!(!ports.allocator().is_allocated(15000));

    let after_first = harness.events.events().len();
    sim.shutdown().unwrap();
    assert_eq!(harness.events.events().len(), after_first);
    assert_eq!(harness.events.count("release shutdown=true"), 1);
}

#[test]
fn shutdown_before_start_is_noop() {
    let harness = Harness::new();
    let ports = ports();
    let mut sim = harness.simulator(&ports);

    sim.shutdown().unwrap();
    assert_eq!(sim.state(), SimulatorState::ShutDown);
    assert!(harness.events.events().is_empty());
    assert!(matches!(
        sim.setup(MODEL, "DEFAULT"),
        Err(Error::InvalidState { .. })
    ));
}

#[test]
fn reset_reloads_image_before_run() {
    let harness = Harness::new();
    let ports = ports();
    let mut sim = harness.simulator(&ports);

    sim.setup(MODEL, "DEFAULT").unwrap();
    sim.start().unwrap();
    sim.load(&harness.image).unwrap();
    sim.run().unwrap();

    let mark = harness.events.events().len();
    sim.reset().unwrap();
    assert_eq!(sim.state(), SimulatorState::Running);
    assert!(sim.terminal().is_connected());

    let log = &harness.events;
    let release = log.position("release shutdown=true", mark).unwrap();
    let terminate = log.position("terminate 1", mark).unwrap();
    let launch = log.position("launch 2", mark).unwrap();
    let load = log.position("load ", mark).unwrap();
    let run = log.position("run", mark).unwrap();
    assert!(release < terminate);
    assert!(terminate < launch);
    assert!(launch < load);
    assert!(load < run);

    assert_eq!(log.count("load "), 2);
    assert_eq!(harness.launcher.max_alive(), 1);
    sim.shutdown().unwrap();
}

#[test]
fn run_when_already_running_only_connects_terminal() {
    let harness = Harness::new();
    let ports = ports();
    let mut sim = harness.simulator(&ports);

    sim.setup(MODEL, "DEFAULT").unwrap();
    sim.start().unwrap();
    harness.bridge.set_running(true);

    sim.run().unwrap();
    assert_eq!(harness.events.count("run"), 0);
    assert!(sim.terminal().is_connected());

    sim.run().unwrap();
    assert_eq!(harness.events.count("run"), 0);
    assert!(sim.terminal().is_connected());
}

#[test]
fn run_reconnects_after_terminal_refused() {
    let free_port = {
        let placeholder = TcpListener::bind("127.0.0.1:0").unwrap();
        placeholder.local_addr().unwrap().port()
    };
    let harness = Harness::with_banner(|banner| banner.terminal_ports[0] = Some(free_port));
    let ports = ports();
    let mut sim = harness.simulator(&ports);

    sim.setup(MODEL, "DEFAULT").unwrap();
    sim.start().unwrap();
    let err = sim.run().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Connection);
    assert_eq!(sim.state(), SimulatorState::Running);
    assert!(!sim.terminal().is_connected());

    let _listener = TcpListener::bind(("127.0.0.1", free_port)).unwrap();
    sim.run().unwrap();
    assert!(sim.terminal().is_connected());
    assert_eq!(sim.terminal().port(), Some(free_port));
    assert_eq!(harness.events.count("run"), 1);
}

#[test]
fn operations_require_running() {
    let harness = Harness::new();
    let ports = ports();
    let mut sim = harness.simulator(&ports);

    assert!(matches!(sim.start(), Err(Error::InvalidState { .. })));
    sim.setup(MODEL, "DEFAULT").unwrap();
    assert!(matches!(sim.run(), Err(Error::InvalidState { .. })));
    assert!(matches!(sim.reset(), Err(Error::InvalidState { .. })));
    assert!(matches!(
        sim.load(&harness.image),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(sim.read(None, None), Err(Error::NotConnected)));
    assert!(matches!(
        sim.load(harness.dir.path().join("missing.elf")),
        Err(Error::InvalidState { .. })
    ));
}

#[test]
fn missing_image_is_reported() {
    let harness = Harness::new();
    let ports = ports();
    let mut sim = harness.simulator(&ports);

    sim.setup(MODEL, "DEFAULT").unwrap();
    sim.start().unwrap();
    let missing = harness.dir.path().join("missing.elf");
    let err = sim.load(&missing).unwrap_err();
    assert!(matches!(err, Error::ImageNotFound(path) if path == missing));
    assert_eq!(sim.image(), None);
    assert_eq!(sim.state(), SimulatorState::Running);
}

#[test]
fn terminal_port_falls_back_to_register() {
    let harness = Harness::with_banner(|banner| banner.terminal_ports[0] = None);
    let ports = ports();
    let mut sim = harness.simulator(&ports);
    harness
        .bridge
        .set_register(UART, "Default.Port", u64::from(harness.listener_port()));

    sim.setup(MODEL, "DEFAULT").unwrap();
    sim.start().unwrap();
    assert_eq!(sim.terminal_port(), Some(harness.listener_port()));
}

#[test]
fn terminal_port_missing_everywhere_fails_start() {
    let harness = Harness::with_banner(|banner| banner.terminal_ports[0] = None);
    let ports = ports();
    let mut sim = harness.simulator(&ports);

    sim.setup(MODEL, "DEFAULT").unwrap();
    assert!(matches!(sim.start(), Err(Error::Bridge(_))));
    assert_eq!(sim.state(), SimulatorState::Configured);
    assert_eq!(harness.launcher.alive(), 0);
    assert_eq!(harness.events.count("release"), 1);
}

#[test]
fn debug_port_falls_back_to_requested() {
    let harness = Harness::with_banner(|banner| banner.iris_port = None);
    let ports = ports();
    let mut sim = harness.simulator(&ports).with_options(SimulatorOptions {
        iris_port: Some(7300),
        ..SimulatorOptions::default()
    });

    sim.setup(MODEL, "DEFAULT").unwrap();
    sim.start().unwrap();
    assert_eq!(harness.events.count("connect 127.0.0.1:7300"), 1);
}

#[test]
fn failed_start_keeps_configuration() {
    let harness = Harness::new();
    let ports = ports();
    let mut sim = harness.simulator(&ports);
    sim.setup(MODEL, "DEFAULT").unwrap();

    harness.launcher.fail_next("output ended");
    let err = sim.start().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Launch);
    assert_eq!(sim.state(), SimulatorState::Configured);

    harness.bridge.refuse_connect(true);
    assert!(matches!(sim.start(), Err(Error::Bridge(_))));
    assert_eq!(sim.state(), SimulatorState::Configured);
    assert_eq!(harness.launcher.alive(), 0);

    harness.bridge.refuse_connect(false);
    sim.start().unwrap();
    assert_eq!(sim.state(), SimulatorState::Running);
}

#[test]
fn missing_toolchain_fails_before_spawn() {
    let harness = Harness::new();
    let ports = ports();
    let mut sim = harness.simulator(&ports);
    sim.setup(MODEL, "DEFAULT").unwrap();

    harness.bridge.refuse_locate(true);
    let err = sim.start().unwrap_err();
    assert!(matches!(err, Error::ToolchainNotInstalled { .. }));
    assert!(harness.launcher.requests().is_empty());
}

#[test]
fn exhausted_ports_leave_simulator_unconfigured() {
    let harness = Harness::new();
    let ports = SimulatorPorts::with_ranges(
        PortRange::new(17000, 17004, 4).unwrap(),
        PortRange::new(18000, 18001, 1).unwrap(),
    )
    .unwrap();

    let mut first = harness.simulator(&ports);
    first.setup(MODEL, "DEFAULT").unwrap();

    let mut second = harness.simulator(&ports);
    let err = second.setup(MODEL, "DEFAULT").unwrap_err();
    assert_eq!(err.category(), ErrorCategory::ResourceExhausted);
    assert_eq!(second.state(), SimulatorState::Unconfigured);

    drop(first);
    second.setup(MODEL, "DEFAULT").unwrap();
    assert_eq!(second.telnet_port(), Some(17000));
}

#[test]
fn dropping_running_simulator_tears_down() {
    let harness = Harness::new();
    let ports = ports();
    {
        let mut sim = harness.simulator(&ports);
        sim.setup(MODEL, "DEFAULT").unwrap();
        sim.start().unwrap();
        assert_eq!(harness.launcher.alive(), 1);
    }
    assert_eq!(harness.launcher.alive(), 0);
    assert_eq!(harness.events.count("release shutdown=true"), 1);
    assert!(!ports.allocator().is_allocated(15000));
}

#[test]
fn test_launch_starts_and_terminates() {
    let harness = Harness::new();
    let ports = ports();
    let mut sim = harness.simulator(&ports);
    sim.setup(MODEL, "DEFAULT").unwrap();

    let banner = sim.test_launch().unwrap();
    assert_eq!(banner.iris_port, Some(DEFAULT_IRIS_PORT + 1));
    assert_eq!(harness.launcher.alive(), 0);
    assert_eq!(sim.state(), SimulatorState::Configured);
    assert_eq!(harness.events.count("connect"), 0);
}
