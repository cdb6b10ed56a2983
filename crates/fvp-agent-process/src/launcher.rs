//! Simulator process launch.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use fvp_agent_core::{Error, FvpSettings, Result, TimingSettings};

use crate::banner::{parse_banner, BannerPorts};

/// Arguments that start the Iris server and make the model print its ports.
pub const IRIS_ARGS: [&str; 2] = ["-I", "-p"];

const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);
const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Locate the Iris Python bridge shipped with Fast Models.
///
/// Looks at `IRIS_path` from the settings first, then at
/// `$PVLIB_HOME/Iris/Python`.
pub fn locate_iris(settings: &FvpSettings) -> Result<PathBuf> {
    let mut tried = Vec::new();

    if let Some(path) = settings.iris_path() {
        if path.exists() {
            return Ok(path);
        }
        tried.push(path);
    }

    if let Some(home) = std::env::var_os("PVLIB_HOME") {
        let path = PathBuf::from(home).join("Iris").join("Python");
        if path.exists() {
            return Ok(path);
        }
        tried.push(path);
    }

    let detail = if tried.is_empty() {
        "IRIS_path is not set and PVLIB_HOME is not defined".to_string()
    } else {
        let tried: Vec<String> = tried.iter().map(|p| p.display().to_string()).collect();
        format!("Iris Python bridge not found in {}", tried.join(", "))
    };
    Err(Error::ToolchainNotInstalled {
        detail,
        hint: "Install Fast Models and set IRIS_path in settings.json or export PVLIB_HOME"
            .to_string(),
    })
}

/// Command line of one simulator launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Simulator executable
    pub binary: PathBuf,
    /// Config file passed with `-f`
    pub config_file: Option<PathBuf>,
    /// Extra options, each possibly holding several whitespace-separated
    /// arguments (`"-C key=value"`)
    pub options: Vec<String>,
}

impl LaunchRequest {
    /// Create a request for the given executable.
    pub fn new<P: Into<PathBuf>>(binary: P) -> Self {
        Self {
            binary: binary.into(),
            config_file: None,
            options: Vec::new(),
        }
    }

    /// Set the config file.
    pub fn with_config_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Append an option.
    pub fn push_option<S: Into<String>>(&mut self, option: S) {
        self.options.push(option.into());
    }

    /// Full argument vector, excluding the executable.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = IRIS_ARGS.iter().map(|a| a.to_string()).collect();
        if let Some(config) = &self.config_file {
            args.push("-f".to_string());
            args.push(config.display().to_string());
        }
        for option in &self.options {
            args.extend(option.split_whitespace().map(str::to_string));
        }
        args
    }
}

/// A running simulator child process.
pub trait ProcessHandle: Send + std::fmt::Debug {
    /// OS process id, if any.
    fn id(&self) -> Option<u32>;

    /// Whether the process is still running.
    fn is_alive(&mut self) -> bool;

    /// Stop the process and reap it, waiting up to `grace` for a clean exit
    /// before killing it. Calling this on an exited process is a no-op.
    fn terminate(&mut self, grace: Duration) -> Result<()>;
}

/// [`ProcessHandle`] over a `std::process::Child`.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    reaped: bool,
}

impl ChildProcess {
    /// Wrap a spawned child.
    pub fn new(child: Child) -> Self {
        Self {
            child,
            reaped: false,
        }
    }

    fn wait_for_exit(&mut self, grace: Duration) -> Result<bool> {
        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = self.child.try_wait()? {
                debug!(pid = self.child.id(), %status, "Simulator exited");
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

impl ProcessHandle for ChildProcess {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn is_alive(&mut self) -> bool {
        !self.reaped && matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self, grace: Duration) -> Result<()> {
        if self.reaped {
            return Ok(());
        }

        let pid = self.child.id();
        if self.child.try_wait()?.is_none() {
            #[cfg(unix)]
            {
                // SAFETY: pid belongs to a child we have not reaped yet, so it
                // cannot have been recycled for another process.
                let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                if result == -1 {
                    debug!(pid, "SIGTERM failed: {}", io::Error::last_os_error());
                }
            }

            if !self.wait_for_exit(grace)? {
                warn!(pid, "Simulator ignored termination request, killing");
                match self.child.kill() {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
                    Err(e) => return Err(Error::Io(e)),
                }
            }
        }

        self.child.wait()?;
        self.reaped = true;
        info!(pid, "Simulator process terminated");
        Ok(())
    }
}

/// A launched simulator: its process and the ports its banner announced.
///
/// Dropping it terminates the process.
#[derive(Debug)]
pub struct SimulatorProcess {
    handle: Box<dyn ProcessHandle>,
    ports: BannerPorts,
    grace: Duration,
}

impl SimulatorProcess {
    /// Wrap a process handle and its announced ports.
    pub fn new(handle: Box<dyn ProcessHandle>, ports: BannerPorts) -> Self {
        Self {
            handle,
            ports,
            grace: DEFAULT_TERMINATE_GRACE,
        }
    }

    /// Set how long termination waits for a clean exit.
    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// OS process id.
    pub fn pid(&self) -> Option<u32> {
        self.handle.id()
    }

    /// Ports announced in the banner.
    pub fn ports(&self) -> &BannerPorts {
        &self.ports
    }

    /// Iris port announced in the banner.
    pub fn iris_port(&self) -> Option<u16> {
        self.ports.iris_port
    }

    /// Port of a telnet terminal announced in the banner.
    pub fn terminal_port(&self, index: usize) -> Option<u16> {
        self.ports.terminal_port(index)
    }

    /// Whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        self.handle.is_alive()
    }

    /// Terminate and reap the process.
    pub fn terminate(&mut self) -> Result<()> {
        self.handle.terminate(self.grace)
    }
}

impl Drop for SimulatorProcess {
    fn drop(&mut self) {
        if let Err(e) = self.handle.terminate(self.grace) {
            error!(pid = ?self.handle.id(), error = %e, "Failed to terminate simulator process");
        }
    }
}

/// Starts simulator processes.
pub trait Launcher: Send + Sync {
    /// Spawn the simulator and parse its startup banner.
    fn launch(&self, request: &LaunchRequest) -> Result<SimulatorProcess>;
}

/// [`Launcher`] that spawns the model binary as a child process.
#[derive(Debug, Clone)]
pub struct FvpLauncher {
    terminate_grace: Duration,
    launch_timeout: Duration,
}

impl FvpLauncher {
    /// Create a launcher with the given termination grace period.
    pub fn new(terminate_grace: Duration) -> Self {
        Self {
            terminate_grace,
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
        }
    }

    /// Create a launcher from timing settings.
    pub fn from_settings(timing: &TimingSettings) -> Self {
        Self::new(Duration::from_millis(timing.terminate_grace_ms))
            .with_launch_timeout(Duration::from_millis(timing.launch_timeout_ms))
    }

    /// Bound the wait for the startup banner. The child is terminated when
    /// it elapses.
    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }
}

impl Default for FvpLauncher {
    fn default() -> Self {
        Self::new(DEFAULT_TERMINATE_GRACE)
    }
}

impl Launcher for FvpLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<SimulatorProcess> {
        if !request.binary.is_file() {
            return Err(Error::LaunchFailed {
                reason: format!("model binary {} does not exist", request.binary.display()),
                hint: "Check 'model_binary' for this model in settings.json".to_string(),
            });
        }

        let args = request.args();
        info!(binary = %request.binary.display(), ?args, "Launching simulator");

        let (output, child) =
            spawn_merged(&request.binary, &args).map_err(|e| Error::LaunchFailed {
                reason: format!("failed to spawn {}: {e}", request.binary.display()),
                hint: "Check that the model binary is executable".to_string(),
            })?;
        let pid = child.id();
        let mut process = ChildProcess::new(child);

        let (ports, reader) = match read_banner(output, pid, self.launch_timeout) {
            Ok(banner) => banner,
            Err(e) => {
                error!(pid, error = %e, "Simulator startup banner not received");
                if let Err(term) = process.terminate(self.terminate_grace) {
                    warn!(pid, error = %term, "Failed to reap simulator after launch failure");
                }
                return Err(e);
            }
        };

        drain_output(reader, pid);

        info!(
            pid,
            iris_port = ?ports.iris_port,
            terminal_port = ?ports.terminal_port(0),
            "Simulator started"
        );
        Ok(SimulatorProcess::new(Box::new(process), ports).with_terminate_grace(self.terminate_grace))
    }
}

/// Keep reading the child's output so it never blocks on a full pipe.
/// Parse the banner on a helper thread so a silent simulator cannot block
/// past `timeout`. The reader comes back for draining the rest.
fn read_banner<R: Read + Send + 'static>(
    output: R,
    pid: u32,
    timeout: Duration,
) -> Result<(BannerPorts, BufReader<R>)> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("fvp-banner-{pid}"))
        .spawn(move || {
            let mut reader = BufReader::new(output);
            let parsed = parse_banner(&mut reader).map(|ports| (ports, reader));
            // Receiver is gone once the launch timed out.
            let _ = tx.send(parsed);
        })
        .map_err(|e| Error::LaunchFailed {
            reason: format!("failed to start banner reader: {e}"),
            hint: "Check system thread limits".to_string(),
        })?;

    match rx.recv_timeout(timeout) {
        Ok(parsed) => parsed,
        Err(RecvTimeoutError::Timeout) => Err(Error::Timeout {
            context: "simulator startup banner".to_string(),
            ms: timeout.as_millis() as u64,
        }),
        Err(RecvTimeoutError::Disconnected) => Err(Error::LaunchProtocol(
            "banner reader stopped before the banner ended".to_string(),
        )),
    }
}

fn drain_output<R: Read + Send + 'static>(mut reader: BufReader<R>, pid: u32) {
    let spawned = thread::Builder::new()
        .name(format!("fvp-output-{pid}"))
        .spawn(move || {
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&raw);
                        debug!(target: "fvp_output", pid, "{}", line.trim_end());
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!(pid, error = %e, "Failed to start simulator output drain thread");
    }
}

/// Spawn with stdout and stderr sharing one pipe.
#[cfg(unix)]
fn spawn_merged(binary: &Path, args: &[String]) -> io::Result<(File, Child)> {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    let mut fds: [libc::c_int; 2] = [0; 2];
    // SAFETY: fds is a valid two-element buffer for pipe(2).
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe(2) succeeded, so both descriptors are open and unowned.
    let (read_end, write_end) =
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    // Other simulators may be spawned concurrently; they must not inherit
    // this pipe or our read end never sees EOF.
    for fd in [read_end.as_raw_fd(), write_end.as_raw_fd()] {
        // SAFETY: fd is open for the duration of these calls.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags == -1 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) == -1 {
                return Err(io::Error::last_os_error());
            }
        }
    }

    let stderr = write_end.try_clone()?;
    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(write_end))
        .stderr(Stdio::from(stderr))
        .spawn()?;

    Ok((File::from(read_end), child))
}

/// Spawn with stdout piped. Stderr stays on the console.
#[cfg(not(unix))]
fn spawn_merged(
    binary: &Path,
    args: &[String],
) -> io::Result<(std::process::ChildStdout, Child)> {
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child stdout not captured"))?;
    Ok((stdout, child))
}
