//! Launch a stand-in simulator script and check banner handling.
//!
//! Everything lives in one test so no other thread forks while a script is
//! still open for writing.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fvp_agent_core::Error;
use fvp_agent_process::{FvpLauncher, LaunchRequest, Launcher};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[test]
fn launch_stand_in_simulator() {
    let dir = tempfile::tempdir().unwrap();

    // Terminal line goes to stderr to check both streams are read.
    let good = write_script(
        dir.path(),
        "fvp_good.sh",
        concat!(
            "echo 'telnetterminal0: Listening for serial connection on port 5123'\n",
            "echo 'telnetterminal1: Listening for serial connection on port 5124' >&2\n",
            "echo 'Iris server started listening to port 7123'\n",
            "echo ''\n",
            "i=0; while [ $i -lt 200 ]; do echo \"simulation output line $i\"; i=$((i+1)); done\n",
            "exec sleep 30",
        ),
    );
    let truncated = write_script(
        dir.path(),
        "fvp_truncated.sh",
        "echo 'telnetterminal0: Listening for serial connection on port 5123'\nexit 3",
    );
    let ignores_term = write_script(
        dir.path(),
        "fvp_stubborn.sh",
        "trap '' TERM\necho 'Iris server started listening to port 7200'\necho ''\nwhile true; do sleep 1; done",
    );

    let pid_file = dir.path().join("silent.pid");
    let silent = write_script(
        dir.path(),
        "fvp_silent.sh",
        &format!("echo $$ > '{}'\nexec sleep 30", pid_file.display()),
    );

    let launcher =
        FvpLauncher::new(Duration::from_millis(500)).with_launch_timeout(Duration::from_secs(5));

    // Banner parsed, process kept alive until terminated.
    let mut request = LaunchRequest::new(&good);
    request.push_option("-C fvp_mps2.telnetterminal0.start_port=5123");
    let mut process = launcher.launch(&request).unwrap();
    assert_eq!(process.terminal_port(0), Some(5123));
    assert_eq!(process.terminal_port(1), Some(5124));
    assert_eq!(process.iris_port(), Some(7123));
    assert!(process.pid().is_some());
    assert!(process.is_alive());
    process.terminate().unwrap();
    assert!(!process.is_alive());
    process.terminate().unwrap();

    // Output ends before the blank line.
    let err = launcher.launch(&LaunchRequest::new(&truncated)).unwrap_err();
    assert!(matches!(err, Error::LaunchProtocol(_)));

    // SIGTERM ignored: killed after the grace period.
    let mut process = launcher.launch(&LaunchRequest::new(&ignores_term)).unwrap();
    assert_eq!(process.iris_port(), Some(7200));
    let start = Instant::now();
    process.terminate().unwrap();
    assert!(start.elapsed() >= Duration::from_millis(500));
    assert!(!process.is_alive());

    // No banner at all: gives up after the launch timeout and reaps the child.
    let impatient = FvpLauncher::new(Duration::from_millis(100))
        .with_launch_timeout(Duration::from_millis(300));
    let start = Instant::now();
    let err = impatient.launch(&LaunchRequest::new(&silent)).unwrap_err();
    assert!(matches!(err, Error::Timeout { ms: 300, .. }));
    assert!(start.elapsed() < Duration::from_secs(5));
    let pid: libc::pid_t = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    // SAFETY: signal 0 only checks whether the process exists.
    let exists = unsafe { libc::kill(pid, 0) } == 0;
    assert!(!exists, "silent simulator {pid} still running");

    // Dropping terminates.
    let process = launcher.launch(&LaunchRequest::new(&good)).unwrap();
    drop(process);
}
