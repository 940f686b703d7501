//! Bounded compile and run phases
//!
//! A [`Backend`] hands out one [`Workspace`] per job. The workspace owns every
//! host resource of that job (scratch directory, isolate box) and releases
//! it in [`Workspace::release`], or on drop if the job future is cancelled.
//!
//! Two backends exist:
//!
//! - [`ProcessBackend`] runs the toolchain and the sketch as child processes
//!   in a fresh process group with rlimits, each phase jailed in its own
//!   namespaces and chrooted into its directory.
//! - [`IsolateBackend`] runs both phases inside an IOI Isolate box.

use std::path::Path;

use thiserror::Error;
use uuid::Uuid;

pub use crate::sandbox::capture::{Captured, TRUNCATION_MARKER, read_capped};
pub use crate::sandbox::isolate::{IsolateBackend, IsolateBox, prepare_cgroup, validate_mounts};
#[cfg(test)]
pub(crate) use crate::sandbox::jail::confine_if_possible;
pub use crate::sandbox::jail::{confinement_available, preflight};
pub use crate::sandbox::limits::RlimitPlan;
pub use crate::sandbox::process::{ProcessBackend, ProcessGroup};
pub use crate::sandbox::scratch::ScratchDir;
use crate::assembler::CompilationUnit;
use crate::config::{BackendKind, Config, ToolchainConfig};
use crate::job::TransitionError;

mod capture;
pub mod isolate;
mod jail;
mod limits;
mod process;
mod scratch;

/// Errors that keep a job from reaching a verdict
///
/// All of these are host-side failures; the executor reports them as
/// internal errors and never shows their text to the caller.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("command is empty")]
    EmptyCommand,

    #[error("command '{0}' not found in PATH")]
    CommandNotFound(String),

    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("toolchain exited successfully but produced no '{0}'")]
    MissingArtifact(String),

    #[error("run phase started before a successful compile")]
    NotCompiled,

    #[error("failed to initialize box {id}: {message}")]
    InitFailed { id: u32, message: String },

    #[error("failed to cleanup box {id}: {message}")]
    CleanupFailed { id: u32, message: String },

    #[error("isolate command failed: {0}")]
    IsolateFailed(String),

    #[error("mount source path does not exist: {0}")]
    MountSourceNotFound(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("sandbox preflight failed: {0}")]
    Preflight(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    /// Exited with status zero
    Ok,
    /// Exited with a nonzero status
    RuntimeError,
    /// CPU or wall clock budget exceeded; the process group was killed
    TimeLimitExceeded,
    /// Killed by a signal
    Signaled,
    /// The sandbox itself failed
    InternalError,
}

impl PhaseStatus {
    /// Map an isolate meta-file status code
    pub fn from_isolate_status(status: &str) -> Self {
        match status {
            "RE" => PhaseStatus::RuntimeError,
            "TO" => PhaseStatus::TimeLimitExceeded,
            "SG" => PhaseStatus::Signaled,
            "XX" => PhaseStatus::InternalError,
            _ => PhaseStatus::Ok,
        }
    }
}

/// Result of one bounded compile or run phase
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    pub status: PhaseStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Wall clock seconds the phase took
    pub wall_time: f64,
    /// Explanation from the sandbox, if it gave one
    pub message: Option<String>,
    pub stdout: Captured,
    pub stderr: Captured,
}

impl PhaseOutcome {
    /// Outcome of a phase killed at its wall clock budget
    pub fn timed_out(wall_time: f64) -> Self {
        Self {
            status: PhaseStatus::TimeLimitExceeded,
            exit_code: None,
            signal: None,
            wall_time,
            message: Some("wall time limit exceeded".to_owned()),
            stdout: Captured::default(),
            stderr: Captured::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PhaseStatus::Ok && self.exit_code.is_none_or(|code| code == 0)
    }

    pub fn is_timeout(&self) -> bool {
        self.status == PhaseStatus::TimeLimitExceeded
    }

    /// One-line description of how the process ended
    pub fn termination(&self) -> String {
        if let Some(signal) = self.signal {
            return match signal_name(signal) {
                Some(name) => format!("killed by signal {signal} ({name})"),
                None => format!("killed by signal {signal}"),
            };
        }
        if let Some(code) = self.exit_code {
            return format!("exited with code {code}");
        }
        self.message
            .clone()
            .unwrap_or_else(|| "terminated abnormally".to_owned())
    }
}

fn signal_name(signal: i32) -> Option<&'static str> {
    Some(match signal {
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGILL => "SIGILL",
        libc::SIGKILL => "SIGKILL",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGSYS => "SIGSYS",
        libc::SIGTERM => "SIGTERM",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        _ => return None,
    })
}

/// Sandbox implementation selected by the config
#[derive(Debug)]
pub enum Backend {
    Process(ProcessBackend),
    Isolate(IsolateBackend),
}

impl Backend {
    pub fn from_config(config: &Config) -> Self {
        match config.backend {
            BackendKind::Process => Backend::Process(ProcessBackend::new(config)),
            BackendKind::Isolate => Backend::Isolate(IsolateBackend::new(config)),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Process(_) => BackendKind::Process,
            Backend::Isolate(_) => BackendKind::Isolate,
        }
    }

    /// Allocate the host resources for one job running on worker `slot`
    pub async fn prepare(&self, slot: u32, job_id: Uuid) -> Result<Workspace, SandboxError> {
        match self {
            Backend::Process(backend) => backend.prepare(job_id).await.map(Workspace::Process),
            Backend::Isolate(backend) => backend
                .prepare(slot, job_id)
                .await
                .map(Workspace::Isolate),
        }
    }
}

/// Everything one job owns on the host
#[derive(Debug)]
pub enum Workspace {
    Process(process::ProcessWorkspace),
    Isolate(isolate::IsolateWorkspace),
}

impl Workspace {
    /// Host directory holding the job's scratch files
    pub fn path(&self) -> &Path {
        match self {
            Workspace::Process(workspace) => workspace.path(),
            Workspace::Isolate(workspace) => workspace.path(),
        }
    }

    /// Materialize the unit and run the toolchain on it
    pub async fn compile(&mut self, unit: &CompilationUnit) -> Result<PhaseOutcome, SandboxError> {
        match self {
            Workspace::Process(workspace) => workspace.compile(unit).await,
            Workspace::Isolate(workspace) => workspace.compile(unit).await,
        }
    }

    /// Run the binary produced by a successful [`compile`](Self::compile)
    pub async fn run(&mut self) -> Result<PhaseOutcome, SandboxError> {
        match self {
            Workspace::Process(workspace) => workspace.run().await,
            Workspace::Isolate(workspace) => workspace.run().await,
        }
    }

    /// Remove every file and sandbox the job created
    pub async fn release(self) -> Result<(), SandboxError> {
        match self {
            Workspace::Process(workspace) => workspace.release(),
            Workspace::Isolate(workspace) => workspace.release().await,
        }
    }
}

/// The toolchain's compile command with its program resolved against
/// `toolchain.path`, the search path the toolchain itself runs with
pub fn compile_command(toolchain: &ToolchainConfig) -> Result<Vec<String>, SandboxError> {
    let mut command = toolchain.expand_command(
        toolchain.source_name.as_str(),
        toolchain.output_name.as_str(),
    );
    resolve_command(&mut command, &toolchain.path)?;
    Ok(command)
}

/// Resolve the program in a command to an absolute path using `search_path`.
///
/// Bare names like `g++` are looked up in each directory of `search_path`
/// and canonicalized. Commands whose program already contains a `/` are left
/// unchanged.
pub fn resolve_command(command: &mut [String], search_path: &str) -> Result<(), SandboxError> {
    let Some(first) = command.first_mut() else {
        return Err(SandboxError::EmptyCommand);
    };

    if first.contains('/') {
        return Ok(());
    }

    let found = search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(&*first))
        .find(|candidate| candidate.is_file());

    match found {
        Some(candidate) => {
            *first = std::fs::canonicalize(&candidate)
                .unwrap_or(candidate)
                .to_string_lossy()
                .into_owned();
            Ok(())
        }
        None => Err(SandboxError::CommandNotFound(first.clone())),
    }
}
