#[macro_use]
extern crate log;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hermes_core::backplane::Backplane;
use hermes_core::error::TypedResult;
use hermes_orchestrator::config::Config;
use hermes_orchestrator::{run_simulation, RunOptions};

#[derive(Parser)]
#[command(name = "hermes", version, about = "Deterministic lockstep simulation orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run a simulation from a configuration file
    Run {
        /// Path to the YAML configuration file
        config: PathBuf,

        /// Enable verbose output
        #[arg(short, long)]
        verbose: bool,

        /// Suppress progress output
        #[arg(short, long)]
        quiet: bool,

        /// Do not start the control server
        #[arg(long)]
        no_server: bool,

        /// Override the control server port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the YAML configuration file
        config: PathBuf,
    },

    /// List signals of a running simulation
    ListSignals {
        /// Backplane segment name (e.g. /hermes_1234_0)
        #[arg(short = 's', long)]
        shm_name: String,
    },
}

#[quit::main]
fn main() {
    let cli = Cli::parse();

    let verbose = matches!(&cli.command, CliCommand::Run { verbose: true, .. });
    let level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| if verbose { "debug" } else { "info" }.into());
    pretty_env_logger::formatted_builder()
        .parse_filters(&level)
        .format_timestamp_secs()
        .init();
    log_panics::init();

    if let Err(e) = execute(cli) {
        error!("{e}");
        quit::with_code(1);
    }
}

fn execute(cli: Cli) -> TypedResult<()> {
    match cli.command {
        CliCommand::Run {
            config,
            quiet,
            no_server,
            port,
            ..
        } => {
            let config = Config::from_yaml(&config)?;
            info!(
                "Configuration loaded: {} modules, {} wires",
                config.modules.len(),
                config.wiring.len()
            );
            run_simulation(
                config,
                RunOptions {
                    quiet,
                    no_server,
                    port,
                },
            )
        }
        CliCommand::Validate { config } => validate(&config),
        CliCommand::ListSignals { shm_name } => list_signals(&shm_name),
    }
}

fn validate(path: &PathBuf) -> TypedResult<()> {
    let config = Config::from_yaml(path)?;
    info!(
        "Configuration valid: {} modules, {} wires, mode {:?}",
        config.modules.len(),
        config.wiring.len(),
        config.execution.mode
    );

    for (name, module) in &config.modules {
        println!("  Module: {name} ({:?})", module.kind);
        for sig in &module.signals {
            println!("    Signal: {} ({})", sig.name, sig.ty);
        }
    }
    Ok(())
}

fn list_signals(shm_name: &str) -> TypedResult<()> {
    let backplane = Backplane::attach(shm_name)?;

    println!("Connected to: {shm_name}");
    println!("Frame: {}", backplane.frame());
    println!("Time: {:.3}s", backplane.time());
    println!();

    for name in backplane.signal_names() {
        println!("  {name} = {}", backplane.get_signal(name)?);
    }
    Ok(())
}
