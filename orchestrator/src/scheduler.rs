//! Multi-rate lockstep scheduler with deterministic integer time
//!
//! Time is carried as integer nanoseconds and maintained by construction as
//! `time_ns = frame × major_dt_ns`; there is no floating-point accumulation
//! and therefore no drift. Each major frame executes as:
//!
//! 1. write `(frame, time_ns)` into the backplane header
//! 2. route wires
//! 3. step all modules (barrier-parallel workers, substepped in-process)
//! 4. advance the frame counter and recompute the time
//!
//! The run loop paces according to the configured [`ExecutionMode`] and
//! shares its pause/stop state with the control server through atomics, so
//! control commands interleave with stepping at frame granularity.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hermes_core::error::TypedResult;
use hermes_core::problem;
use hermes_core::NANOS_PER_SECOND;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{Config, ExecutionMode};
use crate::process::ProcessManager;
use crate::router::WireRouter;

/// Sleep interval while paused or in single-frame mode
const IDLE_POLL: Duration = Duration::from_millis(20);
/// In AFAP mode, yield to the event loop every this many frames
const YIELD_INTERVAL: u64 = 100;

/// Pause/stop/running state shared between the run loop and the control
/// server
#[derive(Debug, Default)]
pub struct RunFlags {
    running: AtomicBool,
    paused: AtomicBool,
    stop: AtomicBool,
}

impl RunFlags {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// The lockstep scheduler
pub struct Scheduler {
    pm: ProcessManager,
    router: WireRouter,
    mode: ExecutionMode,
    frame: u64,
    time_ns: u64,
    major_dt_ns: u64,
    end_time_ns: Option<u64>,
    frame_timeout: Duration,
    flags: Arc<RunFlags>,
}

impl Scheduler {
    /// Builds a scheduler over an initialized process manager, compiling the
    /// wire routing table against the backplane directory
    pub fn new(pm: ProcessManager, config: &Config) -> TypedResult<Self> {
        let router = WireRouter::compile(pm.backplane()?, &config.wiring)?;
        let major_dt_ns = pm.schedule().major_dt_ns;
        Ok(Self {
            pm,
            router,
            mode: config.execution.mode,
            frame: 0,
            time_ns: 0,
            major_dt_ns,
            end_time_ns: config.end_time_ns(),
            frame_timeout: config.execution.frame_timeout,
            flags: Arc::new(RunFlags::default()),
        })
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Authoritative simulation time in integer nanoseconds
    pub fn time_ns(&self) -> u64 {
        self.time_ns
    }

    pub fn time_seconds(&self) -> f64 {
        self.time_ns as f64 / NANOS_PER_SECOND as f64
    }

    pub fn major_dt_ns(&self) -> u64 {
        self.major_dt_ns
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn flags(&self) -> Arc<RunFlags> {
        self.flags.clone()
    }

    pub fn process_manager(&self) -> &ProcessManager {
        &self.pm
    }

    pub fn process_manager_mut(&mut self) -> &mut ProcessManager {
        &mut self.pm
    }

    /// Stages all modules and zeroes the clock
    pub fn stage(&mut self) -> TypedResult<()> {
        self.pm.stage_all()?;
        self.frame = 0;
        self.time_ns = 0;
        self.pm.update_time(0, 0)
    }

    /// Executes `n` major frames
    pub fn step(&mut self, n: u64) -> TypedResult<()> {
        if n == 0 {
            return Err(problem!(Config, "Step count must be positive"));
        }

        for _ in 0..n {
            self.pm.update_time(self.frame, self.time_ns)?;
            if !self.router.is_empty() {
                self.router.route()?;
            }
            self.pm.step_all(self.frame_timeout)?;

            self.frame += 1;
            self.time_ns = self.frame * self.major_dt_ns;
        }
        Ok(())
    }

    /// Zeroes frame and time and publishes the fresh header; modules and
    /// wires stay untouched
    pub fn reset(&mut self) -> TypedResult<()> {
        self.frame = 0;
        self.time_ns = 0;
        self.pm.update_time(0, 0)
    }

    fn end_reached(&self) -> bool {
        self.end_time_ns
            .is_some_and(|end_ns| self.time_ns >= end_ns)
    }
}

/// Shared handle over the scheduler
///
/// The run loop and the control server both hold one; the scheduler body is
/// locked per frame, pause/stop are lock-free atomics.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<Mutex<Scheduler>>,
    flags: Arc<RunFlags>,
}

impl SchedulerHandle {
    pub fn new(scheduler: Scheduler) -> Self {
        let flags = scheduler.flags();
        Self {
            inner: Arc::new(Mutex::new(scheduler)),
            flags,
        }
    }

    /// Direct access for the driver (staging, teardown)
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Scheduler> {
        self.inner.lock().await
    }

    pub fn pause(&self) {
        self.flags.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.flags.paused.store(false, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.flags.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.flags.is_running()
    }

    pub fn is_paused(&self) -> bool {
        self.flags.is_paused()
    }

    /// Steps `n` frames and returns the resulting frame number
    pub async fn step(&self, n: u64) -> TypedResult<u64> {
        let mut scheduler = self.inner.lock().await;
        scheduler.step(n)?;
        Ok(scheduler.frame())
    }

    pub async fn reset(&self) -> TypedResult<()> {
        self.inner.lock().await.reset()
    }

    pub async fn frame(&self) -> u64 {
        self.inner.lock().await.frame()
    }

    pub async fn time_ns(&self) -> u64 {
        self.inner.lock().await.time_ns()
    }

    /// Runs the frame loop until [`SchedulerHandle::stop`] or the configured
    /// end time.
    ///
    /// The callback is invoked after every major frame; a callback error
    /// terminates the loop and propagates after `running` is cleared. While
    /// paused the loop sleeps cooperatively; the wall-clock origin is
    /// advanced by the paused duration so realtime pacing stays aligned.
    pub async fn run<F>(&self, mut callback: F) -> TypedResult<()>
    where
        F: FnMut(u64, f64) -> TypedResult<()>,
    {
        let (mode, end_time_ns) = {
            let scheduler = self.inner.lock().await;
            (scheduler.mode, scheduler.end_time_ns)
        };

        self.flags.stop.store(false, Ordering::SeqCst);
        self.flags.running.store(true, Ordering::SeqCst);
        let mut wall_start = Instant::now();
        let mut paused_since: Option<Instant> = None;

        let result = loop {
            if self.flags.stop_requested() {
                break Ok(());
            }
            {
                let scheduler = self.inner.lock().await;
                if end_time_ns.is_some() && scheduler.end_reached() {
                    break Ok(());
                }
            }

            if self.flags.is_paused() {
                paused_since.get_or_insert_with(Instant::now);
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
            if let Some(since) = paused_since.take() {
                wall_start += since.elapsed();
            }

            if mode == ExecutionMode::SingleFrame {
                // External step requests are the only time source
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }

            let (frame, time_ns) = {
                let mut scheduler = self.inner.lock().await;
                if let Err(e) = scheduler.step(1) {
                    break Err(e);
                }
                (scheduler.frame(), scheduler.time_ns())
            };

            if let Err(e) = callback(frame, time_ns as f64 / NANOS_PER_SECOND as f64) {
                break Err(e);
            }

            match mode {
                ExecutionMode::Realtime => {
                    let target = wall_start + Duration::from_nanos(time_ns);
                    let now = Instant::now();
                    if target > now {
                        tokio::time::sleep(target - now).await;
                    }
                }
                ExecutionMode::Afap => {
                    if frame % YIELD_INTERVAL == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                ExecutionMode::SingleFrame => unreachable!(),
            }
        };

        self.flags.running.store(false, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use hermes_core::error::SystemError;

    fn build(yaml: &str) -> Scheduler {
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        let mut pm = ProcessManager::new(config.clone()).unwrap();
        pm.initialize().unwrap();
        pm.load_all().unwrap();
        let mut scheduler = Scheduler::new(pm, &config).unwrap();
        scheduler.stage().unwrap();
        scheduler
    }

    const SINGLE_MODULE: &str = "
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
";

    const WIRED_PAIR: &str = "
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
wiring:
  - {src: inputs.cmd, dst: physics.input, gain: 2.0, offset: 10.0}
execution:
  mode: single_frame
  rate_hz: 100.0
server:
  enabled: false
";

    const MULTI_RATE: &str = "
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
wiring:
  - {src: inputs.cmd, dst: physics.input}
execution:
  mode: single_frame
  rate_hz: 200.0
  schedule:
    - {name: inputs, rate_hz: 200.0}
    - {name: physics, rate_hz: 1000.0}
server:
  enabled: false
";

    #[test]
    fn initial_state_and_stage() {
        let scheduler = build(SINGLE_MODULE);
        assert_eq!(scheduler.frame(), 0);
        assert_eq!(scheduler.time_ns(), 0);
        assert_eq!(scheduler.major_dt_ns(), 10_000_000);
        assert!(!scheduler.flags().is_running());

        let bp = scheduler.process_manager().backplane().unwrap();
        assert_eq!(bp.frame(), 0);
        assert_eq!(bp.time_ns(), 0);
    }

    #[test]
    fn step_advances_integer_time() {
        let mut scheduler = build(SINGLE_MODULE);

        scheduler.step(1).unwrap();
        assert_eq!(scheduler.frame(), 1);
        assert_eq!(scheduler.time_ns(), 10_000_000);

        // The header carries the frame that was just executed
        let bp = scheduler.process_manager().backplane().unwrap();
        assert_eq!(bp.frame(), 0);
        scheduler.step(1).unwrap();
        assert_eq!(bp.frame(), 1);
        assert_eq!(bp.time_ns(), 10_000_000);
    }

    #[test]
    fn step_rejects_zero() {
        let mut scheduler = build(SINGLE_MODULE);
        assert_eq!(
            scheduler.step(0).unwrap_err().err(),
            SystemError::Config
        );
    }

    #[test]
    fn no_accumulation_drift() {
        let mut scheduler = build(SINGLE_MODULE);
        for _ in 0..10_000 {
            scheduler.step(1).unwrap();
        }
        assert_eq!(scheduler.frame(), 10_000);
        assert_eq!(scheduler.time_ns(), 10_000 * scheduler.major_dt_ns());
        assert_eq!(scheduler.time_seconds(), 100.0);
    }

    #[test]
    fn reset_zeroes_clock_and_header() {
        let mut scheduler = build(SINGLE_MODULE);
        scheduler.step(7).unwrap();
        scheduler.reset().unwrap();

        assert_eq!(scheduler.frame(), 0);
        assert_eq!(scheduler.time_ns(), 0);
        let bp = scheduler.process_manager().backplane().unwrap();
        assert_eq!(bp.frame(), 0);
        assert_eq!(bp.time_ns(), 0);
    }

    #[test]
    fn wire_gain_offset_applied_before_stepping() {
        let mut scheduler = build(WIRED_PAIR);
        let bp = scheduler.process_manager().backplane().unwrap();

        bp.set_signal("inputs.cmd", 5.0).unwrap();
        scheduler.step(1).unwrap();
        assert_eq!(bp.get_signal("physics.input").unwrap(), 20.0);

        bp.destroy().unwrap();
    }

    #[test]
    fn multi_rate_substepping() {
        let mut scheduler = build(MULTI_RATE);
        let bp = scheduler.process_manager().backplane().unwrap();

        bp.set_signal("inputs.cmd", 1.0).unwrap();
        scheduler.step(1).unwrap();

        assert!((bp.get_signal("physics.state").unwrap() - 0.005).abs() < 1e-12);
        assert!((bp.get_signal("physics.output").unwrap() - 2.005).abs() < 1e-12);
        assert_eq!(scheduler.time_ns(), 5_000_000);

        scheduler.step(9).unwrap();
        assert_eq!(scheduler.frame(), 10);
        assert_eq!(scheduler.time_ns(), 50_000_000);
    }

    #[tokio::test]
    async fn run_until_end_time() {
        let handle = SchedulerHandle::new(build(SINGLE_MODULE));
        let mut frames = Vec::new();
        handle
            .run(|frame, time| {
                frames.push((frame, time));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(handle.frame().await, 5);
        assert_eq!(handle.time_ns().await, 50_000_000);
        assert_eq!(frames.len(), 5);
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn stop_terminates_open_ended_run() {
        let mut config: Config = serde_yaml::from_str(SINGLE_MODULE).unwrap();
        config.execution.end_time = None;
        config.validate().unwrap();
        let mut pm = ProcessManager::new(config.clone()).unwrap();
        pm.initialize().unwrap();
        pm.load_all().unwrap();
        let mut scheduler = Scheduler::new(pm, &config).unwrap();
        scheduler.stage().unwrap();
        let handle = SchedulerHandle::new(scheduler);

        let stopper = handle.clone();
        handle
            .run(move |frame, _| {
                if frame >= 10 {
                    stopper.stop();
                }
                Ok(())
            })
            .await
            .unwrap();

        assert!(handle.frame().await >= 10);
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn callback_error_terminates_run() {
        let handle = SchedulerHandle::new(build(SINGLE_MODULE));
        let err = handle
            .run(|frame, _| {
                if frame >= 2 {
                    return Err(problem!(Panic, "callback exploded"));
                }
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.err(), SystemError::Panic);
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn identical_runs_are_deterministic() {
        use hermes_core::telemetry::TelemetryEncoder;

        let subscription = vec!["physics.state".to_string(), "physics.output".to_string()];
        let mut traces = Vec::new();
        for _ in 0..2 {
            let mut scheduler = build(MULTI_RATE);
            let bp = scheduler.process_manager().backplane().unwrap();
            bp.set_signal("inputs.cmd", 1.0).unwrap();
            let encoder = TelemetryEncoder::new(bp.clone(), subscription.clone());

            let mut trace = Vec::new();
            for _ in 0..20 {
                scheduler.step(1).unwrap();
                trace.push((
                    scheduler.frame(),
                    scheduler.time_ns(),
                    encoder.encode().unwrap(),
                ));
            }
            traces.push(trace);
        }
        assert_eq!(traces[0], traces[1]);
    }
}
