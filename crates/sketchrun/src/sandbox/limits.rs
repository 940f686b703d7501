//! Kernel limits applied to a child between fork and exec

use std::io;

use tokio::process::Command;

use crate::types::ResourceLimits;

/// rlimit values derived from [`ResourceLimits`], in kernel units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RlimitPlan {
    /// Soft CPU limit in whole seconds; the hard limit is one second later
    pub cpu_seconds: Option<u64>,
    /// Bytes
    pub address_space: Option<u64>,
    /// Bytes
    pub stack: Option<u64>,
    pub processes: Option<u64>,
    /// Bytes
    pub file_size: Option<u64>,
    pub open_files: Option<u64>,
}

impl RlimitPlan {
    pub fn from_limits(limits: &ResourceLimits) -> Self {
        let kib = |kb: u64| kb.saturating_mul(1024);
        Self {
            cpu_seconds: limits
                .time_limit
                .filter(|secs| secs.is_finite() && *secs > 0.0)
                .map(|secs| secs.ceil() as u64),
            address_space: limits.memory_limit.map(kib),
            stack: limits.stack_limit.map(kib),
            processes: limits.max_processes.map(u64::from),
            file_size: limits.max_file_size.map(kib),
            open_files: limits.max_open_files.map(u64::from),
        }
    }

    /// Set the limits on the calling process. Core dumps are always disabled.
    ///
    /// Only calls `setrlimit`, so it is safe to run in a `pre_exec` hook.
    pub fn apply(&self) -> io::Result<()> {
        // SAFETY: setrlimit only reads the rlimit struct we pass by reference
        unsafe {
            if let Some(secs) = self.cpu_seconds {
                set(libc::RLIMIT_CPU, secs, secs.saturating_add(1))?;
            }
            if let Some(bytes) = self.address_space {
                set(libc::RLIMIT_AS, bytes, bytes)?;
            }
            if let Some(bytes) = self.stack {
                set(libc::RLIMIT_STACK, bytes, bytes)?;
            }
            if let Some(count) = self.processes {
                set(libc::RLIMIT_NPROC, count, count)?;
            }
            if let Some(bytes) = self.file_size {
                set(libc::RLIMIT_FSIZE, bytes, bytes)?;
            }
            if let Some(count) = self.open_files {
                set(libc::RLIMIT_NOFILE, count, count)?;
            }
            set(libc::RLIMIT_CORE, 0, 0)?;
        }
        Ok(())
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

unsafe fn set(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // SAFETY: `limit` is a valid rlimit for the duration of the call
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Install the rlimits as a `pre_exec` hook on `command`
pub(crate) fn install(command: &mut Command, plan: RlimitPlan) {
    // SAFETY: the hook runs between fork and exec and only calls setrlimit,
    // which is async-signal-safe. `plan` is Copy, so nothing is allocated in
    // the child.
    unsafe {
        command.pre_exec(move || plan.apply());
    }
}
