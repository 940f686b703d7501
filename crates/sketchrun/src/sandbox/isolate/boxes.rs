//! Lifecycle of a single isolate box

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::sandbox::SandboxError;
use crate::sandbox::isolate::command::{IsolateAction, IsolateCommand};

/// An initialized isolate box.
///
/// Call [`cleanup`](Self::cleanup) when the job is done. If the box is
/// dropped while still initialized (the job future was cancelled), cleanup
/// is attempted on a background thread.
#[derive(Debug)]
pub struct IsolateBox {
    id: u32,
    box_path: PathBuf,
    isolate_path: PathBuf,
    cgroup: bool,
    initialized: bool,
}

impl IsolateBox {
    /// `isolate --init` box `id`
    #[instrument(skip(isolate_path))]
    pub async fn init(
        id: u32,
        isolate_path: impl Into<PathBuf>,
        cgroup: bool,
    ) -> Result<Self, SandboxError> {
        let isolate_path = isolate_path.into();
        let args = IsolateCommand::new(&isolate_path, id)
            .action(IsolateAction::Init)
            .cgroup(cgroup)
            .build();

        let output = invoke(&args).await?;
        if !output.status.success() {
            return Err(SandboxError::InitFailed {
                id,
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let box_path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        if !box_path.is_dir() {
            return Err(SandboxError::InitFailed {
                id,
                message: format!("box path does not exist: {}", box_path.display()),
            });
        }

        debug!(box_path = %box_path.display(), "box initialized");
        Ok(Self {
            id,
            box_path,
            isolate_path,
            cgroup,
            initialized: true,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Host directory of the box (isolate's `<box>/`, not `<box>/box/`)
    pub fn path(&self) -> &Path {
        &self.box_path
    }

    pub fn isolate_path(&self) -> &Path {
        &self.isolate_path
    }

    pub fn cgroup(&self) -> bool {
        self.cgroup
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Host path of `name` inside the box's working directory
    pub fn file_path(&self, name: &str) -> Result<PathBuf, SandboxError> {
        check_name(name)?;
        Ok(self.box_path.join("box").join(name))
    }

    /// The same file as seen from inside the sandbox
    pub fn sandbox_path(&self, name: &str) -> Result<PathBuf, SandboxError> {
        check_name(name)?;
        Ok(Path::new("/box").join(name))
    }

    pub async fn write_file(&self, name: &str, content: &[u8]) -> Result<(), SandboxError> {
        let path = self.file_path(name)?;
        tokio::fs::write(&path, content).await?;
        debug!(path = %path.display(), len = content.len(), "wrote file to box");
        Ok(())
    }

    /// Delete files from the box working directory, ignoring missing ones
    pub async fn remove_files(&self, names: &[&str]) -> Result<(), SandboxError> {
        for name in names {
            match tokio::fs::remove_file(self.file_path(name)?).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// `isolate --cleanup`, which also kills anything still running in the box
    #[instrument(skip(self), fields(id = self.id))]
    pub async fn cleanup(&mut self) -> Result<(), SandboxError> {
        if !self.initialized {
            return Ok(());
        }

        let output = invoke(&self.cleanup_args()).await?;
        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            warn!(stderr = %message, "cleanup failed");
            return Err(SandboxError::CleanupFailed {
                id: self.id,
                message,
            });
        }

        self.initialized = false;
        debug!("box cleaned up");
        Ok(())
    }

    fn cleanup_args(&self) -> Vec<String> {
        IsolateCommand::new(&self.isolate_path, self.id)
            .action(IsolateAction::Cleanup)
            .cgroup(self.cgroup)
            .build()
    }
}

impl Drop for IsolateBox {
    fn drop(&mut self) {
        if !self.initialized {
            return;
        }
        warn!(
            box_id = self.id,
            "isolate box dropped without cleanup, cleaning up in the background"
        );

        let args = self.cleanup_args();
        let id = self.id;
        std::thread::spawn(move || {
            let Some((program, rest)) = args.split_first() else {
                return;
            };
            match std::process::Command::new(program).args(rest).output() {
                Ok(output) if output.status.success() => {
                    debug!(box_id = id, "background cleanup succeeded");
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    warn!(box_id = id, stderr = %stderr, "background cleanup failed");
                }
                Err(e) => warn!(box_id = id, error = %e, "background cleanup spawn failed"),
            }
        });
    }
}

fn check_name(name: &str) -> Result<(), SandboxError> {
    if name.is_empty() || name.contains("..") || name.starts_with('/') {
        return Err(SandboxError::InvalidPath(format!(
            "not a file name inside the box: {name}"
        )));
    }
    Ok(())
}

async fn invoke(args: &[String]) -> Result<std::process::Output, SandboxError> {
    let (program, rest) = args.split_first().ok_or(SandboxError::EmptyCommand)?;
    debug!(?args, "invoking isolate");
    Command::new(program)
        .args(rest)
        .output()
        .await
        .map_err(|source| SandboxError::SpawnFailed {
            program: program.clone(),
            source,
        })
}
