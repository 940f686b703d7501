//! IOI Isolate backend
//!
//! Worker slot `n` owns box `first_box_id + n`, so two in-flight jobs never
//! share a box. Each job initializes the box, compiles and runs inside it,
//! then cleans it up.
//!
//! References for isolate's CLI and meta files:
//! - https://www.ucw.cz/isolate/isolate.1.html
//! - https://github.com/ioi/isolate

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, instrument};
use uuid::Uuid;

pub use crate::sandbox::isolate::boxes::IsolateBox;
pub use crate::sandbox::isolate::command::{IsolateAction, IsolateCommand};
pub use crate::sandbox::isolate::meta::MetaFile;
use crate::assembler::CompilationUnit;
use crate::config::{Config, ToolchainConfig};
use crate::sandbox::scratch::ScratchDir;
use crate::sandbox::{PhaseOutcome, PhaseStatus, SandboxError, compile_command, read_capped};
use crate::types::{MountConfig, ResourceLimits};

mod boxes;
mod command;
mod meta;

/// Slack on top of isolate's own wall clock limit before the isolate process
/// itself is killed
const FENCE_SLACK: Duration = Duration::from_secs(1);

const BOX_WORKDIR: &str = "/box";

/// Set up the cgroup v2 hierarchy isolate expects at `cg_root`.
///
/// Containers usually lack `isolate-cg-keeper`, so this does its job: move
/// this process into a leaf cgroup, then enable the memory and pids
/// controllers at the root and at `cg_root`.
///
/// Returns `Ok(false)` when cgroup v2 or its memory controller is missing;
/// the caller should then run isolate without `--cg`.
pub fn prepare_cgroup(cg_root: &Path) -> Result<bool, SandboxError> {
    const CONTROLLERS: &str = "+memory +pids";
    let cg_base = Path::new("/sys/fs/cgroup");

    let has_memory = |file: &Path| {
        fs::read_to_string(file)
            .map(|content| content.split_whitespace().any(|c| c == "memory"))
            .unwrap_or(false)
    };

    if !has_memory(&cg_base.join("cgroup.controllers")) {
        return Ok(false);
    }
    if has_memory(&cg_root.join("cgroup.subtree_control")) {
        return Ok(true);
    }

    // cgroup v2 refuses to enable controllers on a cgroup that has member
    // processes, so leave the root first
    let leaf = cg_base.join("init");
    fs::create_dir_all(&leaf)?;
    fs::write(leaf.join("cgroup.procs"), std::process::id().to_string())?;
    fs::write(cg_base.join("cgroup.subtree_control"), CONTROLLERS)?;

    fs::create_dir_all(cg_root)?;
    fs::write(cg_root.join("cgroup.subtree_control"), CONTROLLERS)?;
    Ok(true)
}

/// Check that every required mount source exists on the host
pub fn validate_mounts(mounts: &[MountConfig]) -> Result<(), SandboxError> {
    match mounts
        .iter()
        .find(|mount| !mount.optional && !Path::new(&mount.source).exists())
    {
        Some(mount) => Err(SandboxError::MountSourceNotFound(mount.source.clone())),
        None => Ok(()),
    }
}

#[derive(Debug)]
struct IsolateSettings {
    isolate_path: PathBuf,
    cgroup: bool,
    first_box_id: u32,
    mounts: Vec<MountConfig>,
    scratch_root: PathBuf,
    toolchain: ToolchainConfig,
    compile_limits: ResourceLimits,
    run_limits: ResourceLimits,
    run_env: HashMap<String, String>,
}

/// Runs jobs inside isolate boxes
#[derive(Debug, Clone)]
pub struct IsolateBackend {
    settings: Arc<IsolateSettings>,
}

impl IsolateBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            settings: Arc::new(IsolateSettings {
                isolate_path: config.isolate.binary(),
                cgroup: config.isolate.cgroup,
                first_box_id: config.isolate.first_box_id,
                mounts: config.isolate.mounts.clone(),
                scratch_root: config.scratch_root.clone(),
                toolchain: config.toolchain.clone(),
                compile_limits: box_limits(&config.toolchain.effective_limits()),
                run_limits: box_limits(&config.run.effective_limits()),
                run_env: config.run.env.clone(),
            }),
        }
    }

    /// Box id used by worker `slot`
    pub fn box_id(&self, slot: u32) -> Option<u32> {
        self.settings.first_box_id.checked_add(slot)
    }

    pub(crate) async fn prepare(
        &self,
        slot: u32,
        job_id: Uuid,
    ) -> Result<IsolateWorkspace, SandboxError> {
        let id = self.box_id(slot).ok_or_else(|| SandboxError::InitFailed {
            id: u32::MAX,
            message: format!("box id overflow for slot {slot}"),
        })?;
        let scratch = ScratchDir::create(&self.settings.scratch_root, job_id)?;
        let sandbox =
            IsolateBox::init(id, &self.settings.isolate_path, self.settings.cgroup).await?;

        Ok(IsolateWorkspace {
            sandbox,
            scratch,
            settings: Arc::clone(&self.settings),
            compiled: false,
        })
    }
}

/// Programs inside the box write their stdout to a file, which RLIMIT_FSIZE
/// also covers. Raise the file size limit to one kilobyte past the output cap
/// so overflow is visible as truncation.
fn box_limits(limits: &ResourceLimits) -> ResourceLimits {
    let mut limits = limits.clone();
    limits.max_file_size = match (limits.max_file_size, limits.max_output) {
        (Some(fsize), Some(output)) => Some(fsize.max(output.saturating_add(1))),
        (fsize, None) => fsize,
        (None, Some(_)) => None,
    };
    limits
}

/// Box and host scratch directory of one job
#[derive(Debug)]
pub struct IsolateWorkspace {
    sandbox: IsolateBox,
    /// Meta files live on the host, out of the sketch's reach
    scratch: ScratchDir,
    settings: Arc<IsolateSettings>,
    compiled: bool,
}

impl IsolateWorkspace {
    pub fn path(&self) -> &Path {
        self.scratch.path()
    }

    #[instrument(skip_all, fields(box_id = self.sandbox.id()))]
    pub(crate) async fn compile(
        &mut self,
        unit: &CompilationUnit,
    ) -> Result<PhaseOutcome, SandboxError> {
        let toolchain = &self.settings.toolchain;
        let source = toolchain.source_name.as_str();
        let output = toolchain.output_name.as_str();

        self.sandbox
            .write_file(source, unit.text().as_bytes())
            .await?;

        // isolate execs the program directly; the box sees the host's /usr
        let argv = compile_command(toolchain)?;

        let command = self
            .base_command(self.settings.compile_limits.clone())
            .env("PATH", toolchain.path.as_str())
            .envs(toolchain.env.clone())
            .command(argv);
        let outcome = self
            .run_phase(command, "compile", &self.settings.compile_limits)
            .await?;

        if outcome.is_success() {
            let artifact = self.sandbox.file_path(output)?;
            if !tokio::fs::metadata(&artifact)
                .await
                .is_ok_and(|meta| meta.is_file())
            {
                return Err(SandboxError::MissingArtifact(output.to_owned()));
            }
            // Leave only the binary for the run phase
            self.sandbox
                .remove_files(&[source, "compile.out", "compile.err"])
                .await?;
            self.compiled = true;
        }
        Ok(outcome)
    }

    #[instrument(skip_all, fields(box_id = self.sandbox.id()))]
    pub(crate) async fn run(&mut self) -> Result<PhaseOutcome, SandboxError> {
        if !self.compiled {
            return Err(SandboxError::NotCompiled);
        }
        let binary = format!("./{}", self.settings.toolchain.output_name);

        let command = self
            .base_command(self.settings.run_limits.clone())
            .envs(self.settings.run_env.clone())
            .command([binary]);
        self.run_phase(command, "run", &self.settings.run_limits)
            .await
    }

    pub(crate) async fn release(mut self) -> Result<(), SandboxError> {
        let cleaned = self.sandbox.cleanup().await;
        let removed = self.scratch.close();
        cleaned.and(removed)
    }

    fn base_command(&self, limits: ResourceLimits) -> IsolateCommand {
        IsolateCommand::new(&self.settings.isolate_path, self.sandbox.id())
            .cgroup(self.settings.cgroup)
            .limits(limits)
            .mounts(self.settings.mounts.iter().cloned())
            .working_dir(BOX_WORKDIR)
    }

    /// Run `command` in the box and collect meta file and output streams
    async fn run_phase(
        &self,
        command: IsolateCommand,
        phase: &str,
        limits: &ResourceLimits,
    ) -> Result<PhaseOutcome, SandboxError> {
        let meta_path = self.scratch.path().join(format!("{phase}.meta"));
        let stdout_name = format!("{phase}.out");
        let stderr_name = format!("{phase}.err");

        let args = command
            .meta_file(&meta_path)
            .stdout(self.sandbox.sandbox_path(&stdout_name)?)
            .stderr(self.sandbox.sandbox_path(&stderr_name)?)
            .build();
        let (program, rest) = args.split_first().ok_or(SandboxError::EmptyCommand)?;
        debug!(?args, "running isolate");

        let started = Instant::now();
        let child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SandboxError::SpawnFailed {
                program: program.clone(),
                source,
            })?;

        let fence = limits
            .wall_time()
            .and_then(|wall| wall.checked_add(extra_time(limits)))
            .and_then(|wall| wall.checked_add(FENCE_SLACK))
            .unwrap_or(Duration::MAX);
        let Ok(finished) = tokio::time::timeout(fence, child.wait_with_output()).await else {
            // Box processes are killed by the cleanup in `release`
            debug!("isolate exceeded its fence, killed");
            return Ok(PhaseOutcome::timed_out(started.elapsed().as_secs_f64()));
        };
        let finished = finished?;

        if !tokio::fs::try_exists(&meta_path).await.unwrap_or(false) {
            return Err(SandboxError::IsolateFailed(
                String::from_utf8_lossy(&finished.stderr).trim().to_owned(),
            ));
        }
        let meta = MetaFile::load(&meta_path).await?;
        if meta.status() == PhaseStatus::InternalError {
            return Err(SandboxError::IsolateFailed(
                meta.message().unwrap_or_else(|| "sandbox error".to_owned()),
            ));
        }

        let cap = limits.output_cap();
        let stdout = read_capped(self.open_output(&stdout_name).await, cap).await?;
        let stderr = read_capped(self.open_output(&stderr_name).await, cap).await?;
        let outcome = meta.into_outcome(stdout, stderr);
        debug!(status = ?outcome.status, wall_time = outcome.wall_time, "isolate phase finished");
        Ok(outcome)
    }

    async fn open_output(&self, name: &str) -> Option<tokio::fs::File> {
        let path = self.sandbox.file_path(name).ok()?;
        tokio::fs::File::open(path).await.ok()
    }
}

fn extra_time(limits: &ResourceLimits) -> Duration {
    limits
        .extra_time
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(Duration::ZERO)
}
