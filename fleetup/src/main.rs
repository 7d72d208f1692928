//! fleetup - Entry Point
//!
//! `fleetup agent` runs the node agent, `fleetup coordinator` runs the
//! campaign coordinator.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use fleetup::app::options::{AgentOptions, CoordinatorAppOptions};
use fleetup::app::run::{run_agent, run_coordinator};
use fleetup::logs::{init_logging, LogOptions};
use fleetup::storage::layout::StorageLayout;
use fleetup::storage::settings::{load_or_default, AgentSettings, CoordinatorSettings, LogSettings};
use fleetup::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();
    let mut command: Option<String> = None;

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        } else if command.is_none() {
            command = Some(arg.clone());
        }
    }

    // Print version and exit. The upgrade verifier parses this output.
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(PathBuf::from(dir)),
        None => StorageLayout::default(),
    };

    match command.as_deref() {
        Some("agent") => {
            let settings: AgentSettings =
                match load_or_default(&layout.agent_settings_file()).await {
                    Ok(settings) => settings,
                    Err(e) => {
                        eprintln!("{}", e);
                        std::process::exit(1);
                    }
                };
            let _guard = init_process_logging(&settings.log, "agent.log");

            let options = AgentOptions::from_settings(layout, &settings);
            info!("Running fleetup {} agent with options: {:?}", version.version, options);
            if let Err(e) = run_agent(options, await_shutdown_signal()).await {
                error!("Failed to run the agent: {e}");
                std::process::exit(1);
            }
        }
        Some("coordinator") => {
            let settings: CoordinatorSettings =
                match load_or_default(&layout.coordinator_settings_file()).await {
                    Ok(settings) => settings,
                    Err(e) => {
                        eprintln!("{}", e);
                        std::process::exit(1);
                    }
                };
            let _guard = init_process_logging(&settings.log, "coordinator.log");

            let options = CoordinatorAppOptions::from_settings(&settings);
            info!("Running fleetup {} coordinator with options: {:?}", version.version, options);
            if let Err(e) = run_coordinator(options, await_shutdown_signal()).await {
                error!("Failed to run the coordinator: {e}");
                std::process::exit(1);
            }
        }
        _ => {
            eprintln!("Usage: fleetup <agent|coordinator> [--base-dir=<dir>]");
            eprintln!("       fleetup --version");
            std::process::exit(2);
        }
    }
}

fn init_process_logging(
    settings: &LogSettings,
    file_prefix: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_options = LogOptions {
        log_level: settings.level.clone(),
        log_dir: settings.dir.clone(),
        file_prefix: file_prefix.to_string(),
        json_format: settings.json,
        ..Default::default()
    };

    match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Unable to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
