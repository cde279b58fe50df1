//! Configuration for the hermes orchestrator
//!
//! A configuration declares the module set (with their signals), the wiring
//! between signals, the execution plan and the control server settings:
//!
//! ```rust
//! # use hermes_orchestrator::config::Config;
//! # let yaml = "
//! modules:
//!   inputs:
//!     kind: inproc
//!     inproc_id: injection
//!     signals:
//!       - name: cmd
//!         type: f64
//!         writable: true
//!   physics:
//!     kind: inproc
//!     inproc_id: mock_physics
//!     signals:
//!       - name: input
//!         writable: true
//!       - name: output
//!       - name: state
//! wiring:
//!   - src: inputs.cmd
//!     dst: physics.input
//!     gain: 2.0
//! execution:
//!   mode: single_frame
//!   rate_hz: 200.0
//!   schedule:
//!     - name: inputs
//!     - name: physics
//!       rate_hz: 1000.0
//! server:
//!   enabled: false
//! # ";
//! # serde_yaml::from_str::<Config>(yaml).unwrap().validate().unwrap();
//! ```
//!
//! All validation happens once at load; a validated configuration never
//! produces a `Config` error during the run.
use std::path::{Path, PathBuf};
use std::time::Duration;

use hermes_core::error::{ResultExt, SystemError, TypedResult};
use hermes_core::problem;
use hermes_core::signal::{SignalDescriptor, SignalFlags, SignalType};
use hermes_core::NANOS_PER_SECOND;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::registry;

/// Tolerance when checking that a module rate is an integer multiple of the
/// major rate
const SUBSTEP_RATIO_TOLERANCE: f64 = 1e-6;

/// Pacing policy of the run loop
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Pace frames against the wall clock
    Realtime,
    /// No pacing; yield to the event loop periodically
    #[default]
    Afap,
    /// Never auto-advance; external `step` requests are the only time source
    SingleFrame,
}

/// Kind of a configured module
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKindConfig {
    /// External executable coordinated through the frame barrier
    Exec,
    /// Script run by an interpreter, coordinated through the frame barrier
    Script,
    /// In-process implementation from the compile-time registry
    Inproc,
}

/// One signal declared by a module
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SignalConfig {
    pub name: String,
    #[serde(default, rename = "type")]
    pub ty: SignalType,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub published: bool,
}

/// Configuration of a single module
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModuleConfig {
    pub kind: ModuleKindConfig,

    /// Path to the executable (`kind: exec`)
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Interpreter binary (`kind: script`)
    #[serde(default)]
    pub interpreter: Option<PathBuf>,

    /// Script file handed to the interpreter (`kind: script`)
    #[serde(default)]
    pub script: Option<PathBuf>,

    /// Registry identifier (`kind: inproc`)
    #[serde(default)]
    pub inproc_id: Option<String>,

    /// Per-module configuration file passed on the command line
    #[serde(default)]
    pub config: Option<PathBuf>,

    #[serde(default)]
    pub signals: Vec<SignalConfig>,

    /// Free-form module options, passed through uninterpreted
    #[serde(default)]
    pub options: serde_yaml::Value,
}

impl ModuleConfig {
    pub fn is_subprocess(&self) -> bool {
        matches!(
            self.kind,
            ModuleKindConfig::Exec | ModuleKindConfig::Script
        )
    }
}

/// A directed affine transfer between two signals
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WireConfig {
    pub src: String,
    pub dst: String,
    #[serde(default = "default_gain")]
    pub gain: f64,
    #[serde(default)]
    pub offset: f64,
}

fn default_gain() -> f64 {
    1.0
}

/// One entry of the execution schedule
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScheduleEntryConfig {
    pub name: String,
    /// Module rate; defaults to the base `rate_hz`
    #[serde(default)]
    pub rate_hz: Option<f64>,
}

/// Execution settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Base simulation rate; also the default for schedule entries
    #[serde(default = "default_rate_hz")]
    pub rate_hz: f64,

    /// Simulation end time in seconds; absent means run until stopped
    #[serde(default)]
    pub end_time: Option<f64>,

    /// Per-module schedule; empty means every module at the base rate in
    /// declaration order
    #[serde(default)]
    pub schedule: Vec<ScheduleEntryConfig>,

    /// Bound on one barrier frame before the run is aborted
    #[serde(default = "default_frame_timeout", with = "humantime_serde")]
    pub frame_timeout: Duration,
}

fn default_rate_hz() -> f64 {
    100.0
}

fn default_frame_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            rate_hz: default_rate_hz(),
            end_time: None,
            schedule: Vec::new(),
            frame_timeout: default_frame_timeout(),
        }
    }
}

/// Control server settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Telemetry broadcast rate
    #[serde(default = "default_telemetry_hz")]
    pub telemetry_hz: f64,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_telemetry_hz() -> f64 {
    60.0
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            host: default_host(),
            port: default_port(),
            telemetry_hz: default_telemetry_hz(),
        }
    }
}

/// Root configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Module configurations keyed by name; declaration order determines the
    /// backplane layout and default stepping order
    pub modules: IndexMap<String, ModuleConfig>,

    #[serde(default)]
    pub wiring: Vec<WireConfig>,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub server: ServerSettings,

    /// Grace period between SIGTERM and SIGKILL when terminating modules
    #[serde(default = "default_graceful_timeout", with = "humantime_serde")]
    pub graceful_timeout: Duration,
}

fn default_graceful_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Per-module stepping plan derived from the configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleEntry {
    pub module: String,
    pub rate_hz: f64,
    /// Minor frames per major frame
    pub substeps: u32,
    /// Timestep handed to the module on each minor frame
    pub dt_seconds: f64,
}

/// The complete stepping plan of one major frame
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub major_rate_hz: f64,
    pub major_dt_ns: u64,
    pub entries: Vec<ScheduleEntry>,
}

impl Config {
    /// Loads and validates a configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> TypedResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| problem!(Config, "Reading {} failed: {e}", path.display()))?;
        let config: Config = serde_yaml::from_str(&raw).typ(SystemError::Config)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every load-time invariant; a validated configuration never
    /// raises `Config` during the run
    pub fn validate(&self) -> TypedResult<()> {
        for (name, module) in &self.modules {
            match module.kind {
                ModuleKindConfig::Exec => {
                    if module.executable.is_none() {
                        return Err(problem!(
                            Config,
                            "Module {name}: 'executable' required for kind exec"
                        ));
                    }
                }
                ModuleKindConfig::Script => {
                    if module.interpreter.is_none() || module.script.is_none() {
                        return Err(problem!(
                            Config,
                            "Module {name}: 'interpreter' and 'script' required for kind script"
                        ));
                    }
                }
                ModuleKindConfig::Inproc => {
                    let id = module.inproc_id.as_deref().ok_or_else(|| {
                        problem!(Config, "Module {name}: 'inproc_id' required for kind inproc")
                    })?;
                    if !registry::contains(id) {
                        return Err(problem!(
                            Config,
                            "Module {name}: unknown inproc implementation '{id}'"
                        ));
                    }
                }
            }

            if let Some(dup) = module
                .signals
                .iter()
                .map(|s| s.name.as_str())
                .duplicates()
                .next()
            {
                return Err(problem!(
                    Config,
                    "Module {name}: duplicate signal '{dup}'"
                ));
            }
        }

        let declared: Vec<String> = self.signal_set().iter().map(|s| s.name.clone()).collect();
        for wire in &self.wiring {
            if !declared.contains(&wire.src) {
                return Err(problem!(Config, "Wire source not declared: {}", wire.src));
            }
            if !declared.contains(&wire.dst) {
                return Err(problem!(
                    Config,
                    "Wire destination not declared: {}",
                    wire.dst
                ));
            }
        }

        if self.execution.rate_hz <= 0.0 {
            return Err(problem!(
                Config,
                "rate_hz must be positive, got {}",
                self.execution.rate_hz
            ));
        }
        if self.server.telemetry_hz <= 0.0 {
            return Err(problem!(
                Config,
                "telemetry_hz must be positive, got {}",
                self.server.telemetry_hz
            ));
        }

        // Substep ratios are checked here so a bad schedule never reaches
        // the scheduler
        self.generate_schedule().map(|_| ())
    }

    /// All declared signals as qualified descriptors, in declaration order
    pub fn signal_set(&self) -> Vec<SignalDescriptor> {
        let mut signals = Vec::new();
        for (module_name, module) in &self.modules {
            for sig in &module.signals {
                let mut flags = SignalFlags::empty();
                if sig.writable {
                    flags |= SignalFlags::WRITABLE;
                }
                if sig.published {
                    flags |= SignalFlags::PUBLISHED;
                }
                signals.push(
                    SignalDescriptor::new(format!("{module_name}.{}", sig.name))
                        .with_type(sig.ty)
                        .with_flags(flags)
                        .with_unit(sig.unit.clone()),
                );
            }
        }
        signals
    }

    /// Number of modules coordinated through the frame barrier
    pub fn subprocess_count(&self) -> u32 {
        self.modules.values().filter(|m| m.is_subprocess()).count() as u32
    }

    /// Derives the multi-rate stepping plan.
    ///
    /// The major rate is the minimum effective module rate; each module's
    /// rate must be an integer multiple of it (within 1e-6).
    pub fn generate_schedule(&self) -> TypedResult<Schedule> {
        let mut effective: Vec<(String, f64)> = if self.execution.schedule.is_empty() {
            self.modules
                .keys()
                .map(|name| (name.clone(), self.execution.rate_hz))
                .collect()
        } else {
            let mut entries = Vec::with_capacity(self.execution.schedule.len());
            for entry in &self.execution.schedule {
                if !self.modules.contains_key(&entry.name) {
                    return Err(problem!(
                        Config,
                        "Schedule references unknown module: {}",
                        entry.name
                    ));
                }
                let rate = entry.rate_hz.unwrap_or(self.execution.rate_hz);
                if rate <= 0.0 {
                    return Err(problem!(
                        Config,
                        "Module {} has non-positive rate {rate}",
                        entry.name
                    ));
                }
                entries.push((entry.name.clone(), rate));
            }
            entries
        };

        // The base rate_hz only enters as the fallback applied above;
        // the major rate is the minimum of the effective module rates
        let major_rate_hz = effective
            .iter()
            .map(|(_, rate)| *rate)
            .fold(f64::INFINITY, f64::min);

        let entries = effective
            .drain(..)
            .map(|(module, rate_hz)| {
                let ratio = rate_hz / major_rate_hz;
                let substeps = ratio.round();
                if (ratio - substeps).abs() > SUBSTEP_RATIO_TOLERANCE {
                    return Err(problem!(
                        Config,
                        "Module {module} rate {rate_hz} Hz is not an integer multiple \
                         of the major rate {major_rate_hz} Hz"
                    ));
                }
                Ok(ScheduleEntry {
                    module,
                    rate_hz,
                    substeps: substeps as u32,
                    dt_seconds: 1.0 / rate_hz,
                })
            })
            .collect::<TypedResult<Vec<_>>>()?;

        Ok(Schedule {
            major_rate_hz,
            major_dt_ns: (NANOS_PER_SECOND as f64 / major_rate_hz).round() as u64,
            entries,
        })
    }

    /// End time converted to authoritative integer nanoseconds
    pub fn end_time_ns(&self) -> Option<u64> {
        self.execution
            .end_time
            .map(|t| (t * NANOS_PER_SECOND as f64).round() as u64)
    }
}
