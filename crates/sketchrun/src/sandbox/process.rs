//! Child-process backend
//!
//! Each phase runs as the leader of a new process group, jailed in its own
//! namespaces and chrooted into its directory (see [`super::jail`]), with
//! rlimits set in `pre_exec`. The wall clock budget is enforced from the
//! outside: when it elapses the whole group gets SIGKILL, which also takes
//! down the jail's PID namespace.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::assembler::CompilationUnit;
use crate::config::{Config, ConfinementConfig, RunConfig, ToolchainConfig};
use crate::sandbox::capture::read_capped;
use crate::sandbox::jail::{self, Jail};
use crate::sandbox::limits::{self, RlimitPlan};
use crate::sandbox::scratch::ScratchDir;
use crate::sandbox::{Captured, PhaseOutcome, PhaseStatus, SandboxError, compile_command};
use crate::types::ResourceLimits;

/// Sends SIGKILL to a whole process group when dropped.
///
/// Covers every exit path of a phase, including cancellation of the job
/// future, so no descendant of the sketch outlives its job.
#[derive(Debug)]
pub struct ProcessGroup {
    pgid: Option<libc::pid_t>,
}

impl ProcessGroup {
    /// Guard the group led by `pid` (as returned by `Child::id`)
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|pid| libc::pid_t::try_from(pid).ok()),
        }
    }

    pub fn id(&self) -> Option<libc::pid_t> {
        self.pgid
    }

    /// Kill every process in the group. Later calls do nothing.
    pub fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        // SAFETY: kill takes no pointers; a negative pid addresses the group
        if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!(pgid, error = %err, "failed to kill process group");
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// How a phase is fenced off from the host
#[derive(Debug)]
enum Confinement {
    /// Namespaces and a chroot into the phase directory
    Jail(Jail),
    /// The server's own filesystem and network, optionally another account
    Unconfined(Option<(u32, u32)>),
}

/// One bounded process invocation
#[derive(Debug)]
struct Invocation<'a> {
    command: Vec<String>,
    cwd: &'a Path,
    env: HashMap<String, String>,
    limits: &'a ResourceLimits,
    confinement: Confinement,
}

/// Spawn, capture, and wait under the wall clock budget
#[instrument(skip_all, fields(program))]
async fn run_bounded(invocation: Invocation<'_>) -> Result<PhaseOutcome, SandboxError> {
    let (program, args) = invocation
        .command
        .split_first()
        .ok_or(SandboxError::EmptyCommand)?;
    tracing::Span::current().record("program", program.as_str());

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(invocation.cwd)
        .env_clear()
        .envs(&invocation.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    let plan = RlimitPlan::from_limits(invocation.limits);
    match invocation.confinement {
        Confinement::Jail(jail) => jail::install(&mut command, jail, plan),
        Confinement::Unconfined(credentials) => {
            if let Some((uid, gid)) = credentials {
                command.uid(uid).gid(gid);
            }
            limits::install(&mut command, plan);
        }
    }

    debug!(command = ?invocation.command, cwd = %invocation.cwd.display(), "spawning");

    let started = Instant::now();
    let mut child = command.spawn().map_err(|source| SandboxError::SpawnFailed {
        program: program.clone(),
        source,
    })?;
    let mut group = ProcessGroup::new(child.id());

    let cap = invocation.limits.output_cap();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let budget = invocation.limits.wall_time().unwrap_or(Duration::MAX);

    let finished = tokio::time::timeout(budget, async {
        let (status, stdout, stderr) = tokio::join!(
            child.wait(),
            read_capped(stdout, cap),
            read_capped(stderr, cap)
        );
        Ok::<_, std::io::Error>((status?, stdout?, stderr?))
    })
    .await;
    let wall_time = started.elapsed().as_secs_f64();

    // Stragglers (forked children, background jobs) die with the group
    group.kill();

    match finished {
        Ok(result) => {
            let (status, stdout, stderr) = result?;
            let outcome = outcome_from_exit(status, wall_time, stdout, stderr);
            debug!(status = ?outcome.status, wall_time, "process finished");
            Ok(outcome)
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            debug!(wall_time, "wall time limit exceeded, process group killed");
            Ok(PhaseOutcome::timed_out(wall_time))
        }
    }
}

fn outcome_from_exit(
    status: ExitStatus,
    wall_time: f64,
    stdout: Captured,
    stderr: Captured,
) -> PhaseOutcome {
    let signal = status.signal();
    let status_kind = match (status.code(), signal) {
        (Some(0), _) => PhaseStatus::Ok,
        (Some(_), _) => PhaseStatus::RuntimeError,
        (None, Some(libc::SIGXCPU)) => PhaseStatus::TimeLimitExceeded,
        (None, Some(_)) => PhaseStatus::Signaled,
        (None, None) => PhaseStatus::InternalError,
    };
    let message = (status_kind == PhaseStatus::TimeLimitExceeded)
        .then(|| "cpu time limit exceeded".to_owned());

    PhaseOutcome {
        status: status_kind,
        exit_code: status.code(),
        signal,
        wall_time,
        message,
        stdout,
        stderr,
    }
}

/// Settings shared by every job of a [`ProcessBackend`]
#[derive(Debug)]
struct ProcessSettings {
    scratch_root: PathBuf,
    toolchain: ToolchainConfig,
    compile_limits: ResourceLimits,
    run: RunConfig,
    run_limits: ResourceLimits,
    confinement: ConfinementConfig,
}

impl ProcessSettings {
    /// Jail rooted at `dir`, or `unconfined` credentials if the jail is off
    fn confinement(
        &self,
        dir: &Path,
        writable: bool,
        unconfined: Option<(u32, u32)>,
    ) -> Result<Confinement, SandboxError> {
        if !self.confinement.enabled {
            return Ok(Confinement::Unconfined(unconfined));
        }
        Jail::prepare(dir, &self.confinement.bind, writable, self.run.credentials())
            .map(Confinement::Jail)
    }
}

/// Runs jobs as plain child processes
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    settings: Arc<ProcessSettings>,
}

impl ProcessBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            settings: Arc::new(ProcessSettings {
                scratch_root: config.scratch_root.clone(),
                toolchain: config.toolchain.clone(),
                compile_limits: config.toolchain.effective_limits(),
                run: config.run.clone(),
                run_limits: config.run.effective_limits(),
                confinement: config.confinement.clone(),
            }),
        }
    }

    pub(crate) async fn prepare(&self, job_id: Uuid) -> Result<ProcessWorkspace, SandboxError> {
        let scratch = ScratchDir::create(&self.settings.scratch_root, job_id)?;
        Ok(ProcessWorkspace {
            scratch,
            settings: Arc::clone(&self.settings),
            binary: None,
        })
    }
}

/// Scratch directory plus the compiled binary of one job
#[derive(Debug)]
pub struct ProcessWorkspace {
    scratch: ScratchDir,
    settings: Arc<ProcessSettings>,
    binary: Option<PathBuf>,
}

impl ProcessWorkspace {
    pub fn path(&self) -> &Path {
        self.scratch.path()
    }

    #[instrument(skip_all, fields(dir = %self.scratch.path().display()))]
    pub(crate) async fn compile(
        &mut self,
        unit: &CompilationUnit,
    ) -> Result<PhaseOutcome, SandboxError> {
        let toolchain = &self.settings.toolchain;
        let source = toolchain.source_name.as_str();
        let output = toolchain.output_name.as_str();
        let build_dir = self.scratch.build_dir();

        unit.materialize(build_dir, source).await?;
        let command = compile_command(toolchain)?;
        let confinement = self.settings.confinement(build_dir, true, None)?;

        // Inside the jail the build directory is `/`
        let tmpdir = match confinement {
            Confinement::Jail(_) => "/".to_owned(),
            Confinement::Unconfined(_) => build_dir.to_string_lossy().into_owned(),
        };
        let mut env = toolchain.env.clone();
        env.insert("PATH".to_owned(), toolchain.path.clone());
        env.insert("TMPDIR".to_owned(), tmpdir);

        let outcome = run_bounded(Invocation {
            command,
            cwd: build_dir,
            env,
            limits: &self.settings.compile_limits,
            confinement,
        })
        .await?;

        if outcome.is_success() {
            let binary = self.scratch.install_binary(output).await?;
            if self.settings.run.credentials().is_some() {
                self.scratch.open_for_run()?;
            }
            self.binary = Some(binary);
        }
        Ok(outcome)
    }

    #[instrument(skip_all, fields(dir = %self.scratch.path().display()))]
    pub(crate) async fn run(&mut self) -> Result<PhaseOutcome, SandboxError> {
        let binary = self.binary.as_ref().ok_or(SandboxError::NotCompiled)?;
        let run_dir = self.scratch.run_dir();
        let confinement =
            self.settings
                .confinement(run_dir, false, self.settings.run.credentials())?;

        // The jail's root is the run directory
        let program = match (&confinement, binary.file_name()) {
            (Confinement::Jail(_), Some(name)) => Path::new("/").join(name),
            _ => binary.clone(),
        };

        run_bounded(Invocation {
            command: vec![program.to_string_lossy().into_owned()],
            cwd: run_dir,
            env: self.settings.run.env.clone(),
            limits: &self.settings.run_limits,
            confinement,
        })
        .await
    }

    pub(crate) fn release(self) -> Result<(), SandboxError> {
        self.scratch.close()
    }
}
