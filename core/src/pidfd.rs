//! Process file descriptors for bounded child waits
// TODO: Remove this, as soon as the following is available in stable Rust:
// https://doc.rust-lang.org/stable/std/os/linux/process/struct.PidFd.html
use std::io::ErrorKind;
use std::os::unix::prelude::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use nix::libc::{c_uint, syscall, SYS_pidfd_open};
use nix::unistd::Pid;
use polling::{Event, Events, Poller};

use crate::error::{ResultExt, SystemError, TypedError, TypedResult};

/// A pidfd of a spawned module process
///
/// Becomes readable once the process has exited, which gives the process
/// manager a race-free bounded wait for graceful termination.
#[derive(Debug)]
pub struct PidFd(OwnedFd);

impl PidFd {
    /// Waits for the process to exit. `Ok(false)` if the timeout elapses first.
    pub fn wait_exited_timeout(&self, timeout: Duration) -> TypedResult<bool> {
        let start = Instant::now();

        let poller = Poller::new()
            .map_err(anyhow::Error::from)
            .typ(SystemError::Resource)?;
        unsafe { poller.add(self.0.as_raw_fd(), Event::readable(0)) }
            .map_err(anyhow::Error::from)
            .typ(SystemError::Resource)?;

        let mut events = Events::new();
        loop {
            events.clear();
            let remaining = timeout.saturating_sub(start.elapsed());
            match poller.wait(&mut events, Some(remaining)) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(anyhow::Error::from(e)).typ(SystemError::Resource);
                }
            }
        }
    }
}

impl AsRawFd for PidFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl TryFrom<Pid> for PidFd {
    type Error = TypedError;

    fn try_from(value: Pid) -> TypedResult<Self> {
        let pidfd: std::os::raw::c_int = unsafe {
            syscall(SYS_pidfd_open, value.as_raw(), 0 as c_uint)
                .try_into()
                .typ(SystemError::Resource)?
        };
        if pidfd < 0 {
            return Err(anyhow!("Could not open pidfd for {value}"))
                .typ(SystemError::Resource);
        }
        Ok(PidFd(unsafe { OwnedFd::from_raw_fd(pidfd) }))
    }
}
