//! Command-line arguments.

use std::path::{Path, PathBuf};

use clap::{ArgGroup, Parser};
use fvp_agent_core::config::SETTINGS_FILE;

/// Environment variable naming the settings file.
pub const SETTINGS_ENV: &str = "FVP_AGENT_SETTINGS";

/// Selected command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Print the model catalog
    List,
    /// Launch each available model once
    SelfTest,
}

/// Parsed arguments.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(
    name = "fvp-agent",
    author,
    version,
    about = "List Fast Model simulators and self-test that they launch",
    disable_version_flag = true
)]
#[command(group(ArgGroup::new("command").args(["list", "self_test"])))]
pub struct CliArgs {
    /// List models, configs and their availability (default)
    #[arg(short, long)]
    pub list: bool,

    /// Launch every available model once and report the result
    #[arg(short = 't', long)]
    pub self_test: bool,

    /// Print version
    #[arg(short = 'v', long, action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Settings file [default: ./settings.json]
    #[arg(long, env = SETTINGS_ENV, value_name = "PATH")]
    pub settings: Option<PathBuf>,

    /// Log at debug level
    #[arg(long)]
    pub verbose: bool,
}

impl CliArgs {
    /// Command to run; listing when none was given.
    pub fn selected_command(&self) -> Command {
        if self.self_test {
            Command::SelfTest
        } else {
            Command::List
        }
    }

    /// Settings file to load: `--settings` (or its environment variable),
    /// otherwise `settings.json` in `cwd`.
    pub fn settings_path(&self, cwd: &Path) -> PathBuf {
        self.settings
            .clone()
            .unwrap_or_else(|| cwd.join(SETTINGS_FILE))
    }
}
