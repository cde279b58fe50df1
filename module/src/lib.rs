//! Worker-side runtime for hermes subprocess modules
//!
//! A subprocess module is invoked as `<exe-or-script> <shm_name> [<config>]`
//! with `MODULE_NAME`, `SHM_NAME` and `BARRIER_NAME` in its environment. It
//! attaches the backplane and barrier by name and then runs the lockstep
//! loop: wait for the step signal, read inputs, write outputs, signal done.
//!
//! ```no_run
//! use hermes_module::Worker;
//!
//! fn main() -> hermes_core::error::TypedResult<()> {
//!     let mut worker = Worker::from_env()?;
//!     let output = format!("{}.output", worker.name());
//!     worker.run(|backplane| {
//!         let t = backplane.time();
//!         backplane.set_signal(&output, t.sin())
//!     })
//! }
//! ```
//!
//! Termination is driven by the orchestrator's SIGTERM/SIGKILL sequence; the
//! default signal disposition ends the process mid-wait, which is the
//! expected exit path.
#[macro_use]
extern crate log;

use std::time::Duration;

use hermes_core::backplane::Backplane;
use hermes_core::barrier::FrameBarrier;
use hermes_core::error::TypedResult;
use hermes_core::{problem, BARRIER_NAME_ENV, MODULE_NAME_ENV, SHM_NAME_ENV};

/// Default bound on a single step wait before the worker re-checks its state
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection of one worker process to the orchestrator's shared resources
pub struct Worker {
    name: String,
    backplane: Backplane,
    barrier: FrameBarrier,
    step_timeout: Duration,
}

impl Worker {
    /// Attaches backplane and barrier from the environment provided by the
    /// orchestrator. The segment name falls back to `argv[1]`.
    pub fn from_env() -> TypedResult<Self> {
        let name = std::env::var(MODULE_NAME_ENV)
            .map_err(|_| problem!(Resource, "{MODULE_NAME_ENV} not set"))?;
        let shm_name = std::env::var(SHM_NAME_ENV)
            .ok()
            .or_else(|| std::env::args().nth(1))
            .ok_or_else(|| problem!(Resource, "{SHM_NAME_ENV} not set and no argv[1]"))?;
        let barrier_name = std::env::var(BARRIER_NAME_ENV)
            .map_err(|_| problem!(Resource, "{BARRIER_NAME_ENV} not set"))?;

        Self::attach(&name, &shm_name, &barrier_name)
    }

    /// Attaches to explicitly named resources
    pub fn attach(name: &str, shm_name: &str, barrier_name: &str) -> TypedResult<Self> {
        let backplane = Backplane::attach(shm_name)?;
        let barrier = FrameBarrier::attach(barrier_name)?;
        info!("Module {name} attached to {shm_name}");

        Ok(Self {
            name: name.to_string(),
            backplane,
            barrier,
            step_timeout: DEFAULT_STEP_TIMEOUT,
        })
    }

    /// Module name as assigned by the orchestrator
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backplane(&self) -> &Backplane {
        &self.backplane
    }

    /// Overrides the per-step wait bound
    pub fn set_step_timeout(&mut self, timeout: Duration) {
        self.step_timeout = timeout;
    }

    /// Executes exactly one lockstep frame: wait, step, signal done.
    /// `Ok(false)` if no step signal arrived within the timeout.
    pub fn step_once<F>(&mut self, mut step: F) -> TypedResult<bool>
    where
        F: FnMut(&Backplane) -> TypedResult<()>,
    {
        if !self.barrier.wait_step(Some(self.step_timeout))? {
            return Ok(false);
        }
        let result = step(&self.backplane);
        // The scheduler must never starve on a worker that failed mid-step
        self.barrier.signal_done()?;
        result.map(|()| true)
    }

    /// Runs the lockstep loop until a step callback fails.
    /// Step-wait timeouts are logged and the wait resumes.
    pub fn run<F>(&mut self, mut step: F) -> TypedResult<()>
    where
        F: FnMut(&Backplane) -> TypedResult<()>,
    {
        loop {
            match self.step_once(&mut step) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Module {}: no step signal within timeout", self.name);
                }
                Err(e) => {
                    error!("Module {} step failed: {e}", self.name);
                    return Err(e);
                }
            }
        }
    }
}
