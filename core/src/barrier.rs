//! Two-semaphore lockstep barrier for frame coordination
//!
//! Protocol per frame:
//! 1. Scheduler [`FrameBarrier::signal_step`] releases all workers
//! 2. Each worker [`FrameBarrier::wait_step`]s, executes its step
//! 3. Each worker [`FrameBarrier::signal_done`]s
//! 4. Scheduler [`FrameBarrier::wait_all_done`]s for N completions
//!
//! After a successful `wait_all_done` both semaphores are back at 0 and the
//! cycle repeats without further bookkeeping. A timeout on the scheduler side
//! is fatal for the frame; the process manager decides teardown policy.
use std::ffi::CString;
use std::ptr;
use std::time::Duration;

use nix::errno::Errno;

use crate::error::TypedResult;
use crate::problem;

/// A pair of POSIX named counting semaphores `<base>_step` / `<base>_done`
pub struct FrameBarrier {
    name: String,
    count: u32,
    step_sem: *mut libc::sem_t,
    done_sem: *mut libc::sem_t,
    owner: bool,
}

// The semaphore handles are process-wide; sem_wait/sem_post are thread-safe.
unsafe impl Send for FrameBarrier {}
unsafe impl Sync for FrameBarrier {}

fn sem_name(base: &str, suffix: &str) -> TypedResult<CString> {
    CString::new(format!("{base}_{suffix}"))
        .map_err(|e| problem!(Resource, "Invalid barrier name {base}: {e}"))
}

fn open_sem(name: &CString, create: bool) -> TypedResult<*mut libc::sem_t> {
    let sem = if create {
        unsafe {
            libc::sem_open(
                name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                0 as libc::c_uint,
            )
        }
    } else {
        unsafe { libc::sem_open(name.as_ptr(), 0) }
    };
    if sem == libc::SEM_FAILED {
        return Err(problem!(
            Resource,
            "Opening semaphore {name:?} failed: {}",
            Errno::last()
        ));
    }
    Ok(sem)
}

/// Acquires one unit, optionally bounded by a relative timeout.
/// Returns `Ok(false)` on timeout; EINTR is retried.
fn acquire(sem: *mut libc::sem_t, timeout: Option<Duration>) -> TypedResult<bool> {
    let Some(timeout) = timeout else {
        loop {
            if unsafe { libc::sem_wait(sem) } == 0 {
                return Ok(true);
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                return Err(problem!(Resource, "sem_wait failed: {errno}"));
            }
        }
    };

    let mut deadline = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline) } != 0 {
        return Err(problem!(Resource, "clock_gettime failed: {}", Errno::last()));
    }
    deadline.tv_sec += timeout.as_secs() as libc::time_t;
    deadline.tv_nsec += timeout.subsec_nanos() as libc::c_long;
    if deadline.tv_nsec >= 1_000_000_000 {
        deadline.tv_sec += 1;
        deadline.tv_nsec -= 1_000_000_000;
    }

    loop {
        if unsafe { libc::sem_timedwait(sem, &deadline) } == 0 {
            return Ok(true);
        }
        match Errno::last() {
            Errno::ETIMEDOUT => return Ok(false),
            Errno::EINTR => continue,
            errno => return Err(problem!(Resource, "sem_timedwait failed: {errno}")),
        }
    }
}

fn release(sem: *mut libc::sem_t) -> TypedResult<()> {
    if unsafe { libc::sem_post(sem) } != 0 {
        return Err(problem!(Resource, "sem_post failed: {}", Errno::last()));
    }
    Ok(())
}

impl FrameBarrier {
    /// Creates both semaphores with initial value 0, sized to `count` workers
    pub fn create(name: &str, count: u32) -> TypedResult<Self> {
        if count == 0 {
            return Err(problem!(Config, "Barrier requires at least one worker"));
        }

        let step_name = sem_name(name, "step")?;
        let done_name = sem_name(name, "done")?;

        let step_sem = open_sem(&step_name, true)?;
        let done_sem = match open_sem(&done_name, true) {
            Ok(sem) => sem,
            Err(e) => {
                unsafe {
                    libc::sem_close(step_sem);
                    libc::sem_unlink(step_name.as_ptr());
                }
                return Err(e);
            }
        };

        debug!("Created barrier {name} (count={count})");
        Ok(Self {
            name: name.to_string(),
            count,
            step_sem,
            done_sem,
            owner: true,
        })
    }

    /// Opens an existing barrier from the worker side.
    /// Worker-side operations only; the scheduler-side calls need the
    /// creating instance with its worker count.
    pub fn attach(name: &str) -> TypedResult<Self> {
        let step_sem = open_sem(&sem_name(name, "step")?, false)?;
        let done_sem = match open_sem(&sem_name(name, "done")?, false) {
            Ok(sem) => sem,
            Err(e) => {
                unsafe { libc::sem_close(step_sem) };
                return Err(e);
            }
        };

        trace!("Attached barrier {name}");
        Ok(Self {
            name: name.to_string(),
            count: 0,
            step_sem,
            done_sem,
            owner: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of workers this barrier synchronizes (0 on attached instances)
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Scheduler: releases the step semaphore once per worker
    pub fn signal_step(&self) -> TypedResult<()> {
        if self.count == 0 {
            return Err(problem!(Resource, "Barrier {} has no worker count", self.name));
        }
        for _ in 0..self.count {
            release(self.step_sem)?;
        }
        Ok(())
    }

    /// Worker: acquires one step unit. `Ok(false)` on timeout.
    pub fn wait_step(&self, timeout: Option<Duration>) -> TypedResult<bool> {
        acquire(self.step_sem, timeout)
    }

    /// Worker: signals completion of the current step
    pub fn signal_done(&self) -> TypedResult<()> {
        release(self.done_sem)
    }

    /// Scheduler: acquires one done unit per worker.
    /// `Ok(false)` if any single acquisition times out.
    pub fn wait_all_done(&self, timeout: Option<Duration>) -> TypedResult<bool> {
        if self.count == 0 {
            return Err(problem!(Resource, "Barrier {} has no worker count", self.name));
        }
        for _ in 0..self.count {
            if !acquire(self.done_sem, timeout)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Closes the local handles without unlinking
    pub fn close(&mut self) {
        if !self.step_sem.is_null() {
            unsafe { libc::sem_close(self.step_sem) };
            self.step_sem = ptr::null_mut();
        }
        if !self.done_sem.is_null() {
            unsafe { libc::sem_close(self.done_sem) };
            self.done_sem = ptr::null_mut();
        }
    }

    /// Closes and unlinks both semaphores; idempotent
    pub fn destroy(&mut self) {
        self.close();
        for suffix in ["step", "done"] {
            if let Ok(name) = sem_name(&self.name, suffix) {
                unsafe { libc::sem_unlink(name.as_ptr()) };
            }
        }
        self.owner = false;
    }
}

impl Drop for FrameBarrier {
    fn drop(&mut self) {
        if self.owner {
            self.destroy();
        } else {
            self.close();
        }
    }
}

impl std::fmt::Debug for FrameBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBarrier")
            .field("name", &self.name)
            .field("count", &self.count)
            .field("owner", &self.owner)
            .finish()
    }
}
