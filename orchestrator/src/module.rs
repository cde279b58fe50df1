//! Module records and their lifecycle state machine
//!
//! ```text
//!   load()        stage()       (first step)     terminate()
//!     │             │                │                │
//!     ▼             ▼                ▼                ▼
//! ┌────────┐   ┌────────┐      ┌─────────┐      ┌────────┐
//! │  Init  │──▶│ Staged │─────▶│ Running │─────▶│  Done  │
//! └────────┘   └────────┘      └─────────┘      └────────┘
//!                   ▲─────── reset() ───┘
//! ```
//!
//! `Error` is terminal and reachable from every state; the process manager
//! surfaces the first error and begins orderly teardown.
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use hermes_core::backplane::Backplane;
use hermes_core::error::TypedResult;
use hermes_core::pidfd::PidFd;
use hermes_core::problem;
use hermes_core::{BARRIER_NAME_ENV, MODULE_NAME_ENV, SHM_NAME_ENV};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::config::{ModuleConfig, ModuleKindConfig};
use crate::registry;

/// Lifecycle state of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Init,
    Staged,
    Running,
    Done,
    Error,
}

/// Interface of an in-process module implementation
///
/// Implementations hold their own reference to the backplane and read/write
/// their signals directly during [`InprocModule::step`].
pub trait InprocModule: Send {
    /// Prepare for execution: validate, apply initial conditions
    fn stage(&mut self) -> TypedResult<()>;
    /// Advance by `dt` seconds
    fn step(&mut self, dt: f64) -> TypedResult<()>;
    /// Return to initial conditions without reconstruction
    fn reset(&mut self) -> TypedResult<()>;
}

/// A single module record owned by the process manager
pub struct Module {
    name: String,
    config: ModuleConfig,
    state: ModuleState,
    child: Option<Child>,
    pidfd: Option<PidFd>,
    inproc: Option<Box<dyn InprocModule>>,
}

impl Module {
    pub fn new(name: &str, config: ModuleConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            state: ModuleState::Init,
            child: None,
            pidfd: None,
            inproc: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn is_subprocess(&self) -> bool {
        self.config.is_subprocess()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub(crate) fn mark_error(&mut self) {
        self.state = ModuleState::Error;
    }

    /// Spawns the subprocess or constructs the in-process implementation.
    /// Any failure leaves the module in `Error`.
    pub fn load(
        &mut self,
        shm_name: &str,
        barrier_name: &str,
        backplane: &Arc<Backplane>,
        signals: Vec<String>,
    ) -> TypedResult<()> {
        let result = self.load_inner(shm_name, barrier_name, backplane, signals);
        if result.is_err() {
            self.state = ModuleState::Error;
        }
        result
    }

    fn load_inner(
        &mut self,
        shm_name: &str,
        barrier_name: &str,
        backplane: &Arc<Backplane>,
        signals: Vec<String>,
    ) -> TypedResult<()> {
        if self.child.is_some() || self.inproc.is_some() {
            return Err(problem!(Panic, "Module {} already loaded", self.name));
        }

        match self.config.kind {
            ModuleKindConfig::Exec => {
                let exe = self
                    .config
                    .executable
                    .clone()
                    .ok_or_else(|| problem!(Config, "Module {}: no executable", self.name))?;
                if !exe.exists() {
                    return Err(problem!(
                        Resource,
                        "Executable not found: {}",
                        exe.display()
                    ));
                }
                self.spawn(Command::new(&exe), shm_name, barrier_name)?;
            }
            ModuleKindConfig::Script => {
                let interpreter = self
                    .config
                    .interpreter
                    .clone()
                    .ok_or_else(|| problem!(Config, "Module {}: no interpreter", self.name))?;
                let script = self
                    .config
                    .script
                    .clone()
                    .ok_or_else(|| problem!(Config, "Module {}: no script", self.name))?;
                if !script.exists() {
                    return Err(problem!(Resource, "Script not found: {}", script.display()));
                }
                let mut command = Command::new(&interpreter);
                command.arg(&script);
                self.spawn(command, shm_name, barrier_name)?;
            }
            ModuleKindConfig::Inproc => {
                let id = self
                    .config
                    .inproc_id
                    .clone()
                    .ok_or_else(|| problem!(Config, "Module {}: no inproc_id", self.name))?;
                self.inproc = Some(registry::construct(
                    &id,
                    registry::InprocContext {
                        module_name: self.name.clone(),
                        backplane: backplane.clone(),
                        signals,
                    },
                )?);
            }
        }

        info!("Module {} loaded (pid: {:?})", self.name, self.pid());
        Ok(())
    }

    fn spawn(
        &mut self,
        mut command: Command,
        shm_name: &str,
        barrier_name: &str,
    ) -> TypedResult<()> {
        command.arg(shm_name);
        if let Some(config) = &self.config.config {
            command.arg(config);
        }
        let child = command
            .env(MODULE_NAME_ENV, &self.name)
            .env(SHM_NAME_ENV, shm_name)
            .env(BARRIER_NAME_ENV, barrier_name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| problem!(Resource, "Spawning module {} failed: {e}", self.name))?;

        self.pidfd = Some(PidFd::try_from(Pid::from_raw(child.id() as i32))?);
        self.child = Some(child);
        Ok(())
    }

    /// Transitions `Init → Staged`, staging the in-process implementation.
    /// Subprocess modules stage themselves at startup from their environment.
    pub fn stage(&mut self) -> TypedResult<()> {
        if self.state != ModuleState::Init {
            return Err(problem!(
                Panic,
                "Cannot stage module {} in state {:?}",
                self.name,
                self.state
            ));
        }
        if let Some(inproc) = &mut self.inproc {
            if let Err(e) = inproc.stage() {
                self.state = ModuleState::Error;
                return Err(e);
            }
        }
        self.state = ModuleState::Staged;
        debug!("Module {} staged", self.name);
        Ok(())
    }

    /// Transitions `Staged → Running`; idempotent
    pub fn mark_running(&mut self) {
        if self.state == ModuleState::Staged {
            self.state = ModuleState::Running;
            debug!("Module {} running", self.name);
        }
    }

    /// Advances the in-process implementation by one minor frame
    pub fn step_inproc(&mut self, dt: f64) -> TypedResult<()> {
        self.mark_running();
        let Some(inproc) = &mut self.inproc else {
            return Err(problem!(Panic, "Module {} is not in-process", self.name));
        };
        if let Err(e) = inproc.step(dt) {
            self.state = ModuleState::Error;
            return Err(e);
        }
        Ok(())
    }

    /// Returns `Running | Staged` to `Staged` without respawning
    pub fn reset(&mut self) -> TypedResult<()> {
        match self.state {
            ModuleState::Running | ModuleState::Staged => {
                if let Some(inproc) = &mut self.inproc {
                    inproc.reset()?;
                }
                self.state = ModuleState::Staged;
                Ok(())
            }
            ModuleState::Init => Ok(()),
            state => Err(problem!(
                Panic,
                "Cannot reset module {} in state {state:?}",
                self.name
            )),
        }
    }

    /// Whether the subprocess is still alive
    pub fn is_alive(&mut self) -> bool {
        match &mut self.child {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Graceful termination: SIGTERM, bounded wait, then SIGKILL and reap.
    /// In-process modules simply transition to `Done`.
    pub fn terminate(&mut self, graceful: Duration) {
        if let Some(mut child) = self.child.take() {
            info!("Terminating module {}", self.name);
            let pid = Pid::from_raw(child.id() as i32);
            let _ = kill(pid, Signal::SIGTERM);

            let exited = self
                .pidfd
                .take()
                .map(|fd| fd.wait_exited_timeout(graceful).unwrap_or(false))
                .unwrap_or(false);
            if !exited {
                warn!("Module {} did not terminate, killing", self.name);
                let _ = child.kill();
            }
            let _ = child.wait();
        }

        if self.state != ModuleState::Error {
            self.state = ModuleState::Done;
        }
    }

    /// Forceful termination without grace
    pub fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!("Killing module {}", self.name);
            let _ = child.kill();
            let _ = child.wait();
        }
        self.pidfd = None;
        if self.state != ModuleState::Error {
            self.state = ModuleState::Done;
        }
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("kind", &self.config.kind)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .finish()
    }
}
