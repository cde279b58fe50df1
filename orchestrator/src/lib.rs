#[macro_use]
extern crate log;

pub mod config;
pub mod module;
pub mod modules;
pub mod process;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod server;

use hermes_core::error::{ResultExt, SystemError, TypedResult};

use crate::config::Config;
use crate::process::ProcessManager;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::server::ControlServer;

/// Command-line overrides applied on top of the configuration
#[derive(Debug, Default, Clone)]
pub struct RunOptions {
    /// Suppress per-frame progress logging
    pub quiet: bool,
    /// Do not start the control server even if enabled in the configuration
    pub no_server: bool,
    /// Override the configured server port
    pub port: Option<u16>,
}

/// Runs a validated configuration to completion.
///
/// Everything cooperative lives on one current-thread runtime: the scheduler
/// loop, the control server and the telemetry broadcaster. Subprocess
/// modules run as their own OS processes behind the frame barrier.
pub fn run_simulation(config: Config, opts: RunOptions) -> TypedResult<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .typ(SystemError::Resource)?;
    runtime.block_on(run_inner(config, opts))
}

async fn run_inner(config: Config, opts: RunOptions) -> TypedResult<()> {
    let mut pm = ProcessManager::new(config.clone())?;
    pm.initialize()?;
    if let Err(e) = pm.load_all() {
        pm.terminate_all();
        return Err(e);
    }

    let catalog = pm.signals().to_vec();
    let backplane = pm.backplane()?;

    // The scheduler takes ownership of the process manager; from here on
    // teardown happens through the handle
    let mut scheduler = Scheduler::new(pm, &config)?;
    info!("Staging simulation");
    scheduler.stage()?;
    let handle = SchedulerHandle::new(scheduler);

    let mut server = None;
    if config.server.enabled && !opts.no_server {
        let mut settings = config.server.clone();
        if let Some(port) = opts.port {
            settings.port = port;
        }
        let telemetry_hz = settings.telemetry_hz;
        let mut control =
            ControlServer::new(backplane.clone(), catalog, Some(handle.clone()), settings);
        match control.start_background().await {
            Ok(_) => {
                control.start_telemetry_loop(telemetry_hz);
                server = Some(control);
            }
            Err(e) => {
                handle.lock().await.process_manager_mut().terminate_all();
                return Err(e);
            }
        }
    }

    let stopper = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping simulation");
            stopper.stop();
        }
    });

    info!(
        "Running simulation (mode: {:?}, rate: {} Hz)",
        config.execution.mode, config.execution.rate_hz
    );
    let quiet = opts.quiet;
    let run_result = handle
        .run(move |frame, time| {
            if !quiet && frame % 100 == 0 {
                info!("Frame {frame} at {time:.3}s");
            }
            Ok(())
        })
        .await;

    if let Some(mut server) = server {
        server.stop().await;
    }
    {
        let mut scheduler = handle.lock().await;
        let frame = scheduler.frame();
        let time = scheduler.time_seconds();
        scheduler.process_manager_mut().terminate_all();
        match &run_result {
            Ok(()) => info!("Simulation complete: {frame} frames, {time:.3}s"),
            Err(e) => error!("Simulation failed after {frame} frames: {e}"),
        }
    }

    run_result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_to_end_single_module_run() {
        let config: Config = serde_yaml::from_str(
            "
modules:
  m:
    kind: inproc
    inproc_id: injection
    signals: [{name: a, writable: true}]
execution:
  mode: afap
  rate_hz: 100.0
  end_time: 0.05
server:
  enabled: false
",
        )
        .unwrap();
        config.validate().unwrap();

        run_simulation(config, RunOptions::default()).unwrap();
    }

    #[test]
    fn end_to_end_with_server_enabled() {
        let config: Config = serde_yaml::from_str(
            "
modules:
  m:
    kind: inproc
    inproc_id: injection
    signals: [{name: a, writable: true}]
execution:
  mode: afap
  rate_hz: 1000.0
  end_time: 0.1
server:
  enabled: true
  host: 127.0.0.1
  port: 0
  telemetry_hz: 50.0
",
        )
        .unwrap();
        config.validate().unwrap();

        run_simulation(
            config,
            RunOptions {
                quiet: true,
                ..Default::default()
            },
        )
        .unwrap();
    }
}
