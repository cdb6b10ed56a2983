//! # FVP Agent
//!
//! Lists the Fast Model simulators declared in the settings file and checks
//! that each available model/config pair launches.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fvp_agent::{catalog, CliArgs, Command, Report, SelfTest};
use fvp_agent_core::FvpSettings;
use fvp_agent_process::{FvpLauncher, SimulatorPorts};
use fvp_agent_session::UnlinkedBridge;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let cwd = std::env::current_dir().context("Cannot read the working directory")?;
    let settings_path = args.settings_path(&cwd);
    let settings = FvpSettings::from_file(&settings_path)
        .with_context(|| format!("Cannot load settings from {}", settings_path.display()))?;

    // Initialize logging
    let default_level = if args.verbose {
        "debug".to_string()
    } else {
        settings.common.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    settings.validate()?;
    tracing::debug!(settings = %settings_path.display(), "Settings loaded");

    let report = match args.selected_command() {
        Command::SelfTest => {
            let settings = Arc::new(settings);
            let ports = SimulatorPorts::new(&settings.common.ports)?;
            let launcher = FvpLauncher::from_settings(&settings.common.timing);
            tracing::info!("Starting self test");
            let entries = SelfTest::new(
                Arc::clone(&settings),
                Arc::new(UnlinkedBridge),
                Arc::new(launcher),
                ports,
            )
            .run()
            .await;
            Report::new(&settings, entries)
        }
        Command::List => Report::new(&settings, catalog(&settings)),
    };

    println!("{report}");

    if !report.success() {
        std::process::exit(1);
    }
    Ok(())
}
