#[macro_use]
extern crate log;

pub mod backplane;
pub mod barrier;
pub mod error;
pub mod pidfd;
pub mod protocol;
pub mod signal;
pub mod telemetry;

/// Environment variable carrying the module name into a worker process
pub const MODULE_NAME_ENV: &str = "MODULE_NAME";
/// Environment variable carrying the backplane segment name into a worker process
pub const SHM_NAME_ENV: &str = "SHM_NAME";
/// Environment variable carrying the barrier base name into a worker process
pub const BARRIER_NAME_ENV: &str = "BARRIER_NAME";

/// Nanoseconds per second, used wherever seconds are converted to the
/// authoritative integer-nanosecond representation
pub const NANOS_PER_SECOND: u64 = 1_000_000_000;
