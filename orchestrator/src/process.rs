//! Process manager owning the shared resources and module records
//!
//! Derives the segment and barrier names from the orchestrator pid, creates
//! the backplane and barrier, instantiates module records in declared order
//! and coordinates staging, lockstep stepping and orderly teardown. Any
//! failure during initialization unwinds the resources created so far.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hermes_core::backplane::Backplane;
use hermes_core::barrier::FrameBarrier;
use hermes_core::error::TypedResult;
use hermes_core::problem;
use hermes_core::signal::SignalDescriptor;

use crate::config::{Config, Schedule};
use crate::module::{Module, ModuleState};

pub struct ProcessManager {
    config: Config,
    schedule: Schedule,
    signals: Vec<SignalDescriptor>,
    shm_name: String,
    barrier_name: String,
    backplane: Option<Arc<Backplane>>,
    barrier: Option<FrameBarrier>,
    modules: Vec<Module>,
}

impl ProcessManager {
    pub fn new(config: Config) -> TypedResult<Self> {
        // Process-unique token; the sequence number keeps concurrent managers
        // within one process (tests, embedding) from colliding
        static INSTANCE_SEQ: AtomicU64 = AtomicU64::new(0);
        let schedule = config.generate_schedule()?;
        let token = format!(
            "{}_{}",
            nix::unistd::getpid(),
            INSTANCE_SEQ.fetch_add(1, Ordering::SeqCst)
        );
        Ok(Self {
            signals: config.signal_set(),
            schedule,
            config,
            shm_name: format!("/hermes_{token}"),
            barrier_name: format!("/hermes_barrier_{token}"),
            backplane: None,
            barrier: None,
            modules: Vec::new(),
        })
    }

    pub fn shm_name(&self) -> &str {
        &self.shm_name
    }

    pub fn barrier_name(&self) -> &str {
        &self.barrier_name
    }

    /// All declared signals in layout order
    pub fn signals(&self) -> &[SignalDescriptor] {
        &self.signals
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn backplane(&self) -> TypedResult<Arc<Backplane>> {
        self.backplane
            .clone()
            .ok_or_else(|| problem!(Resource, "Process manager not initialized"))
    }

    pub fn module_state(&self, name: &str) -> Option<ModuleState> {
        self.modules
            .iter()
            .find(|m| m.name() == name)
            .map(Module::state)
    }

    /// Creates the backplane and barrier and instantiates the module records.
    /// Partially created resources are unwound on failure.
    pub fn initialize(&mut self) -> TypedResult<()> {
        if self.backplane.is_some() {
            return Err(problem!(Panic, "Process manager already initialized"));
        }
        if self.config.modules.is_empty() {
            return Err(problem!(Config, "Configuration declares no modules"));
        }

        info!("Initializing process manager ({})", self.shm_name);
        let backplane = Arc::new(Backplane::create(&self.shm_name, &self.signals)?);

        let subprocess_count = self.config.subprocess_count();
        let barrier = if subprocess_count > 0 {
            match FrameBarrier::create(&self.barrier_name, subprocess_count) {
                Ok(barrier) => Some(barrier),
                Err(e) => {
                    backplane.destroy()?;
                    return Err(e);
                }
            }
        } else {
            None
        };

        self.modules = self
            .config
            .modules
            .iter()
            .map(|(name, module_config)| Module::new(name, module_config.clone()))
            .collect();

        self.backplane = Some(backplane);
        self.barrier = barrier;
        Ok(())
    }

    /// Spawns subprocess modules and registers in-process implementations,
    /// in declared order
    pub fn load_all(&mut self) -> TypedResult<()> {
        let backplane = self.backplane()?;
        for module in &mut self.modules {
            let signals = self
                .signals
                .iter()
                .map(|s| &s.name)
                .filter(|n| {
                    n.rsplit_once('.')
                        .is_some_and(|(module_name, _)| module_name == module.name())
                })
                .cloned()
                .collect();
            module.load(&self.shm_name, &self.barrier_name, &backplane, signals)?;
        }
        Ok(())
    }

    /// Stages every module for execution
    pub fn stage_all(&mut self) -> TypedResult<()> {
        for module in &mut self.modules {
            module.stage()?;
        }
        Ok(())
    }

    /// Executes one major frame across all modules.
    ///
    /// Subprocess modules run in parallel behind the barrier; in-process
    /// modules run afterwards in schedule order, substepped according to
    /// their rate.
    pub fn step_all(&mut self, timeout: Duration) -> TypedResult<()> {
        if self.backplane.is_none() {
            return Err(problem!(Resource, "Process manager not initialized"));
        }

        let has_subprocess = self.modules.iter().any(Module::is_subprocess);
        if has_subprocess {
            let barrier = self
                .barrier
                .as_ref()
                .ok_or_else(|| problem!(Resource, "Barrier not initialized"))?;

            for module in &mut self.modules {
                if module.is_subprocess() {
                    module.mark_running();
                }
            }

            barrier.signal_step()?;
            if !barrier.wait_all_done(Some(timeout))? {
                for module in &mut self.modules {
                    if module.is_subprocess() {
                        module.mark_error();
                    }
                }
                return Err(problem!(
                    FrameTimeout,
                    "Workers did not complete the frame within {timeout:?}"
                ));
            }
        }

        for entry in &self.schedule.entries {
            let Some(module) = self
                .modules
                .iter_mut()
                .find(|m| m.name() == entry.module && !m.is_subprocess())
            else {
                continue;
            };
            for _ in 0..entry.substeps {
                module.step_inproc(entry.dt_seconds)?;
            }
        }
        Ok(())
    }

    /// Writes frame number and simulation time into the backplane header.
    /// Two sequential 8-byte writes; both fields are monotone, so observers
    /// tolerate the brief inconsistency.
    pub fn update_time(&self, frame: u64, time_ns: u64) -> TypedResult<()> {
        let backplane = self.backplane()?;
        backplane.set_frame(frame);
        backplane.set_time_ns(time_ns);
        Ok(())
    }

    /// Returns every non-terminal module to `Staged`
    pub fn reset_all(&mut self) -> TypedResult<()> {
        for module in &mut self.modules {
            module.reset()?;
        }
        Ok(())
    }

    /// Terminates all modules in reverse declared order, then destroys the
    /// IPC resources. Idempotent.
    pub fn terminate_all(&mut self) {
        for module in self.modules.iter_mut().rev() {
            module.terminate(self.config.graceful_timeout);
        }

        if let Some(mut barrier) = self.barrier.take() {
            barrier.destroy();
        }
        if let Some(backplane) = self.backplane.take() {
            if let Err(e) = backplane.destroy() {
                error!("Destroying backplane failed: {e}");
            }
        }
        if !self.modules.is_empty() {
            info!("All modules terminated");
        }
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionMode;
    use hermes_core::error::SystemError;

    fn inproc_pair_config() -> Config {
        serde_yaml::from_str(
            "
modules:
  inputs:
    kind: inproc
    inproc_id: injection
    signals: [{name: cmd, writable: true}]
  physics:
    kind: inproc
    inproc_id: mock_physics
    signals:
      - {name: input, writable: true}
      - {name: output}
      - {name: state}
execution:
  mode: single_frame
  rate_hz: 100.0
server:
  enabled: false
",
        )
        .unwrap()
    }

    #[test]
    fn initialize_load_stage_step_terminate() {
        let mut pm = ProcessManager::new(inproc_pair_config()).unwrap();
        pm.initialize().unwrap();
        pm.load_all().unwrap();
        pm.stage_all().unwrap();

        assert_eq!(pm.module_state("inputs"), Some(ModuleState::Staged));

        let bp = pm.backplane().unwrap();
        assert_eq!(
            bp.signal_names(),
            ["inputs.cmd", "physics.input", "physics.output", "physics.state"]
        );

        bp.set_signal("physics.input", 1.0).unwrap();
        pm.step_all(Duration::from_secs(1)).unwrap();
        assert_eq!(pm.module_state("physics"), Some(ModuleState::Running));
        assert_eq!(bp.get_signal("physics.state").unwrap(), 0.01);

        pm.reset_all().unwrap();
        assert_eq!(pm.module_state("physics"), Some(ModuleState::Staged));
        assert_eq!(bp.get_signal("physics.state").unwrap(), 0.0);

        pm.terminate_all();
        assert_eq!(pm.module_state("inputs"), Some(ModuleState::Done));
        assert!(Backplane::attach(pm.shm_name()).is_err());
    }

    #[test]
    fn rejects_empty_module_set() {
        let mut config = inproc_pair_config();
        config.modules.clear();
        let mut pm = ProcessManager::new(config).unwrap();
        assert_eq!(pm.initialize().unwrap_err().err(), SystemError::Config);
    }

    #[test]
    fn update_time_reaches_header() {
        let mut pm = ProcessManager::new(inproc_pair_config()).unwrap();
        pm.initialize().unwrap();

        pm.update_time(3, 30_000_000).unwrap();
        let bp = pm.backplane().unwrap();
        assert_eq!(bp.frame(), 3);
        assert_eq!(bp.time_ns(), 30_000_000);

        pm.terminate_all();
    }

    #[test]
    fn dead_worker_raises_frame_timeout() {
        let mut config = inproc_pair_config();
        config.execution.mode = ExecutionMode::Afap;
        // A worker that exits immediately without ever joining the barrier
        config.modules.insert(
            "rogue".to_string(),
            serde_yaml::from_str(
                "
kind: exec
executable: /bin/true
signals: []
",
            )
            .unwrap(),
        );
        config.graceful_timeout = Duration::from_millis(500);

        let mut pm = ProcessManager::new(config).unwrap();
        pm.initialize().unwrap();
        pm.load_all().unwrap();
        pm.stage_all().unwrap();

        let err = pm.step_all(Duration::from_millis(200)).unwrap_err();
        assert_eq!(err.err(), SystemError::FrameTimeout);
        assert_eq!(pm.module_state("rogue"), Some(ModuleState::Error));

        pm.terminate_all();
        assert_eq!(pm.module_state("rogue"), Some(ModuleState::Error));
        assert!(Backplane::attach(pm.shm_name()).is_err());
    }
}
