//! Namespace jail for the process backend
//!
//! Between fork and exec the spawned child unshares mount, PID, network, IPC
//! and UTS namespaces, plus a user namespace unless it is root and will drop
//! to `run.user`. It bind-mounts a read-only view of the host's system
//! directories into the phase directory, chroots there and forks twice:
//!
//! ```text
//! spawned child      host PID namespace, leaves with the program's status
//! └── init           PID 1, reaps orphans; its exit kills the namespace
//!     └── program    PID 2, credentials and rlimits, then exec
//! ```
//!
//! Whatever the program forks, with or without `setsid`, dies with init.
//! The hook only makes system calls on data allocated before the fork.

use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::ptr;

use libc::c_int;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{BackendKind, Config};
use crate::sandbox::SandboxError;
use crate::sandbox::limits::RlimitPlan;

/// Device nodes bound into every jail. They keep their host mount flags.
const DEVICES: &[&str] = &["/dev/null"];

/// Exit code of the spawned child when init leaves no status behind
const LOST_STATUS: c_int = 125;

#[derive(Debug)]
struct BindMount {
    source: CString,
    target: CString,
    device: bool,
}

/// Everything the `pre_exec` hook needs, allocated up front
#[derive(Debug)]
pub(crate) struct Jail {
    root: CString,
    writable: bool,
    binds: Vec<BindMount>,
    user_namespace: bool,
    credentials: Option<(u32, u32)>,
}

impl Jail {
    /// Create mount points below `root` for every bind source present on
    /// this host.
    ///
    /// A writable root is handed to `credentials`, so the toolchain can write
    /// its output after dropping privileges.
    pub(crate) fn prepare(
        root: &Path,
        binds: &[PathBuf],
        writable: bool,
        credentials: Option<(u32, u32)>,
    ) -> Result<Self, SandboxError> {
        let devices = DEVICES.iter().map(Path::new);
        let mut mounts = Vec::with_capacity(binds.len() + DEVICES.len());

        for source in binds.iter().map(PathBuf::as_path).chain(devices) {
            let Ok(meta) = std::fs::metadata(source) else {
                debug!(source = %source.display(), "bind source missing, skipped");
                continue;
            };
            let relative = source
                .strip_prefix("/")
                .ok()
                .filter(|rest| !rest.as_os_str().is_empty())
                .ok_or_else(|| SandboxError::InvalidPath(source.display().to_string()))?;

            let target = root.join(relative);
            if meta.is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&target)?;
            }

            mounts.push(BindMount {
                source: c_path(source)?,
                target: c_path(&target)?,
                device: meta.file_type().is_char_device(),
            });
        }

        if writable && let Some((uid, gid)) = credentials {
            std::os::unix::fs::chown(root, Some(uid), Some(gid))?;
        }

        // SAFETY: geteuid cannot fail
        let is_root = unsafe { libc::geteuid() } == 0;
        Ok(Self {
            root: c_path(root)?,
            writable,
            binds: mounts,
            user_namespace: !(is_root && credentials.is_some()),
            credentials,
        })
    }

    /// Body of the `pre_exec` hook. Returns only in the program process.
    fn enter(&self, plan: &RlimitPlan) -> io::Result<()> {
        let mut flags = libc::CLONE_NEWNS
            | libc::CLONE_NEWPID
            | libc::CLONE_NEWNET
            | libc::CLONE_NEWIPC
            | libc::CLONE_NEWUTS;
        if self.user_namespace {
            flags |= libc::CLONE_NEWUSER;
        }
        // SAFETY: unshare takes no pointers
        check(unsafe { libc::unshare(flags) })?;
        self.enter_root()?;

        let [status_read, status_write] = status_pipe()?;
        match fork()? {
            0 => {}
            init => mirror(init, status_read, status_write),
        }

        // PID 1 of the new namespace
        // SAFETY: closes our own descriptor; prctl takes no pointers
        unsafe {
            libc::close(status_read);
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);
        }
        match fork()? {
            0 => {}
            program => reap(program, status_write),
        }

        // SAFETY: closes our own descriptor
        unsafe { libc::close(status_write) };
        self.drop_privileges()?;
        // After setuid, so NPROC does not count the account's other processes
        // against the exec
        plan.apply()
    }

    fn enter_root(&self) -> io::Result<()> {
        // SAFETY: every pointer is a NUL-terminated string owned by `self`
        unsafe {
            mount(None, c"/", libc::MS_REC | libc::MS_PRIVATE)?;
            if !self.writable {
                mount(Some(&self.root), &self.root, libc::MS_BIND | libc::MS_REC)?;
            }
            for bind in &self.binds {
                mount(Some(&bind.source), &bind.target, libc::MS_BIND | libc::MS_REC)?;
            }

            if !self.writable {
                remount_read_only(&self.root)?;
            }
            for bind in self.binds.iter().filter(|bind| !bind.device) {
                remount_read_only(&bind.target)?;
            }

            check(libc::chroot(self.root.as_ptr()))?;
            check(libc::chdir(c"/".as_ptr()))?;
        }
        Ok(())
    }

    fn drop_privileges(&self) -> io::Result<()> {
        // SAFETY: prctl takes no pointers; setgroups gets an empty list
        unsafe {
            check(libc::prctl(
                libc::PR_SET_NO_NEW_PRIVS,
                1 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            ))?;
            if let Some((uid, gid)) = self.credentials {
                check(libc::setgroups(0, ptr::null()))?;
                check(libc::setgid(gid))?;
                check(libc::setuid(uid))?;
            }
        }
        Ok(())
    }
}

/// Install `jail` and `plan` as the `pre_exec` hook of `command`
pub(crate) fn install(command: &mut Command, jail: Jail, plan: RlimitPlan) {
    // SAFETY: the hook only makes async-signal-safe system calls on memory
    // owned by `jail` and `plan`; nothing is allocated after the fork.
    unsafe {
        command.pre_exec(move || jail.enter(&plan));
    }
}

fn c_path(path: &Path) -> Result<CString, SandboxError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SandboxError::InvalidPath(path.display().to_string()))
}

fn check(rc: c_int) -> io::Result<()> {
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn interrupted() -> bool {
    io::Error::last_os_error().raw_os_error() == Some(libc::EINTR)
}

fn fork() -> io::Result<libc::pid_t> {
    // SAFETY: both sides only make system calls until they exec or _exit
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pid)
}

fn status_pipe() -> io::Result<[c_int; 2]> {
    let mut fds = [0; 2];
    // SAFETY: `fds` has room for the two descriptors
    check(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    Ok(fds)
}

unsafe fn mount(source: Option<&CStr>, target: &CStr, flags: libc::c_ulong) -> io::Result<()> {
    let source = source.map_or(ptr::null(), CStr::as_ptr);
    // SAFETY: the strings outlive the call; no filesystem type or data
    check(unsafe { libc::mount(source, target.as_ptr(), ptr::null(), flags, ptr::null()) })
}

/// Remount the bind mount at `target` read-only, nosuid and nodev.
///
/// Flags the mount already has are passed again: a user namespace may not
/// clear flags locked by its parent.
unsafe fn remount_read_only(target: &CStr) -> io::Result<()> {
    // SAFETY: statvfs fills the zeroed struct we pass
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    check(unsafe { libc::statvfs(target.as_ptr(), &mut stat) })?;

    let mut flags =
        libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | libc::MS_NOSUID | libc::MS_NODEV;
    for (held, flag) in [
        (libc::ST_NOEXEC, libc::MS_NOEXEC),
        (libc::ST_NOATIME, libc::MS_NOATIME),
        (libc::ST_NODIRATIME, libc::MS_NODIRATIME),
        (libc::ST_RELATIME, libc::MS_RELATIME),
    ] {
        if stat.f_flag & held != 0 {
            flags |= flag;
        }
    }
    unsafe { mount(None, target, flags) }
}

/// Close every descriptor from 3 up except `keep`
unsafe fn close_all_except(keep: c_int) {
    unsafe {
        close_range(3, keep - 1);
        close_range(keep + 1, c_int::MAX);
    }
}

unsafe fn close_range(first: c_int, last: c_int) {
    if first > last {
        return;
    }
    // SAFETY: close_range takes no pointers
    let rc = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            first as libc::c_uint,
            last as libc::c_uint,
            0 as libc::c_uint,
        )
    };
    if rc == 0 {
        return;
    }

    // Kernels before 5.9
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let top = if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == 0 {
        limit.rlim_cur.min(65536) as c_int
    } else {
        1024
    };
    for fd in first..=last.min(top) {
        unsafe { libc::close(fd) };
    }
}

/// Spawned child: wait for init, then leave the way the program left
fn mirror(init: libc::pid_t, status_read: c_int, status_write: c_int) -> ! {
    // SAFETY: system calls on this process's own descriptors and child
    unsafe {
        libc::close(status_write);
        close_all_except(status_read);

        let mut init_status = LOST_STATUS << 8;
        loop {
            if libc::waitpid(init, &mut init_status, 0) == init || !interrupted() {
                break;
            }
        }

        let mut raw = [0u8; 4];
        let mut filled = 0;
        while filled < raw.len() {
            let n = libc::read(
                status_read,
                raw[filled..].as_mut_ptr().cast(),
                raw.len() - filled,
            );
            if n > 0 {
                filled += n as usize;
            } else if n == 0 || !interrupted() {
                break;
            }
        }

        let status = if filled == raw.len() {
            c_int::from_ne_bytes(raw)
        } else {
            init_status
        };
        exit_like(status)
    }
}

/// Init: reap every process of the namespace until the program exits, pass
/// its status on and exit, which kills whatever is left
fn reap(program: libc::pid_t, status_write: c_int) -> ! {
    // SAFETY: system calls on this process's own descriptors and children
    unsafe {
        close_all_except(status_write);
        loop {
            let mut status = 0;
            let pid = libc::waitpid(-1, &mut status, 0);
            if pid == program {
                let bytes = status.to_ne_bytes();
                libc::write(status_write, bytes.as_ptr().cast(), bytes.len());
                libc::_exit(0);
            }
            if pid < 0 && !interrupted() {
                libc::_exit(LOST_STATUS);
            }
        }
    }
}

unsafe fn exit_like(status: c_int) -> ! {
    unsafe {
        if libc::WIFSIGNALED(status) {
            let signal = libc::WTERMSIG(status);
            let no_core = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            libc::setrlimit(libc::RLIMIT_CORE, &no_core);
            libc::signal(signal, libc::SIG_DFL);
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, signal);
            libc::sigprocmask(libc::SIG_UNBLOCK, &set, ptr::null_mut());
            libc::kill(libc::getpid(), signal);
            libc::_exit(128 + signal);
        }
        if libc::WIFEXITED(status) {
            libc::_exit(libc::WEXITSTATUS(status));
        }
        libc::_exit(LOST_STATUS)
    }
}

/// Whether this host can build the jail `config` asks for
pub async fn confinement_available(config: &Config) -> bool {
    match probe(config).await {
        Ok(true) => true,
        Ok(false) => {
            debug!("jail probe exited unsuccessfully");
            false
        }
        Err(e) => {
            debug!(error = %e, "jail probe failed");
            false
        }
    }
}

async fn probe(config: &Config) -> Result<bool, SandboxError> {
    let root = tempfile::tempdir()?;
    std::fs::set_permissions(root.path(), std::fs::Permissions::from_mode(0o755))?;
    let jail = Jail::prepare(
        root.path(),
        &config.confinement.bind,
        false,
        config.run.credentials(),
    )?;

    let mut command = Command::new("/bin/sh");
    command
        .args(["-c", "exit 0"])
        .current_dir(root.path())
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .kill_on_drop(true);
    install(&mut command, jail, RlimitPlan::default());

    Ok(command.status().await?.success())
}

/// Why the process backend must not run sketches under this account, if it
/// must not
fn privilege_problem(euid: u32, config: &Config) -> Option<&'static str> {
    match (euid, config.run.user) {
        (0, None) => Some("refusing to run sketches as root; set run.user to an unprivileged uid"),
        (0, Some(0)) => Some("run.user must not be root"),
        (0, Some(_)) => None,
        (_, Some(_)) => Some("run.user needs the server to start as root"),
        (_, None) => None,
    }
}

/// Check that the process backend can fence sketches off as configured.
///
/// Fails when sketches would run as root, or when the jail is enabled but
/// this host cannot build it. Only `confinement.enabled = false` runs
/// sketches without the jail.
pub async fn preflight(config: &Config) -> Result<(), SandboxError> {
    if config.backend != BackendKind::Process {
        return Ok(());
    }

    // SAFETY: geteuid cannot fail
    let euid = unsafe { libc::geteuid() };
    if let Some(problem) = privilege_problem(euid, config) {
        return Err(SandboxError::Preflight(problem.to_owned()));
    }

    if !config.confinement.enabled {
        warn!("confinement disabled: sketches see the server's files and network");
        return Ok(());
    }
    if !confinement_available(config).await {
        return Err(SandboxError::Preflight(
            "this host cannot create the namespaces the job jail needs; \
             set confinement.enabled = false to run sketches unconfined"
                .to_owned(),
        ));
    }
    debug!("job jail available");
    Ok(())
}

/// Turn the jail off when this host cannot build it, so tests of other
/// behavior run anywhere
#[cfg(test)]
pub(crate) async fn confine_if_possible(config: &mut Config) {
    config.confinement.enabled = confinement_available(config).await;
}
