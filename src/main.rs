use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use copilot_chat_monitor::app;
use copilot_chat_monitor::cli::{Cli, Commands};
use copilot_chat_monitor::config::MonitorConfig;
use copilot_chat_monitor::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("copilot-chat-monitor error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();
    let config = MonitorConfig::load_or_init()?;

    match cli.command {
        Some(Commands::Status) => {
            app::print_status(&config)?;
            Ok(0)
        }
        Some(Commands::Doctor) => app::doctor(&config),
        Some(Commands::Follow { path }) => app::follow(config.runtime_settings(), path),
        None => {
            app::run_watch(config.runtime_settings())?;
            Ok(0)
        }
    }
}
