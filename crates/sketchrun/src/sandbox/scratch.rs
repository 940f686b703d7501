//! Per-job scratch directories

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;
use uuid::Uuid;

use crate::sandbox::SandboxError;

const BUILD_DIR: &str = "build";
const RUN_DIR: &str = "run";

/// Uniquely named directory owned by one job.
///
/// Layout: `<root>/job-<uuid>-XXXX/{build,run}`. The toolchain works in
/// `build/`; the binary is moved to `run/` before it executes. Dropping the
/// value removes the whole tree.
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
    build: PathBuf,
    run: PathBuf,
}

impl ScratchDir {
    /// Create the job directory below `scratch_root`
    pub fn create(scratch_root: &Path, job_id: Uuid) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(scratch_root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{job_id}-"))
            .tempdir_in(scratch_root)?;

        let build = dir.path().join(BUILD_DIR);
        let run = dir.path().join(RUN_DIR);
        std::fs::create_dir(&build)?;
        std::fs::create_dir(&run)?;

        debug!(path = %dir.path().display(), "created scratch directory");
        Ok(Self { dir, build, run })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Working directory of the compile phase
    pub fn build_dir(&self) -> &Path {
        &self.build
    }

    /// Working directory of the run phase
    pub fn run_dir(&self) -> &Path {
        &self.run
    }

    /// Move the compiled binary `name` into the run directory and delete the
    /// build tree, so the sketch never sees its own sources.
    pub async fn install_binary(&self, name: &str) -> Result<PathBuf, SandboxError> {
        let built = self.build.join(name);
        match tokio::fs::metadata(&built).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(SandboxError::MissingArtifact(name.to_owned())),
        }

        let installed = self.run.join(name);
        tokio::fs::rename(&built, &installed).await?;
        tokio::fs::remove_dir_all(&self.build).await?;
        Ok(installed)
    }

    /// Let another account traverse to the run directory and execute the
    /// binary without being able to write anywhere in the tree.
    pub fn open_for_run(&self) -> Result<(), SandboxError> {
        std::fs::set_permissions(self.dir.path(), std::fs::Permissions::from_mode(0o711))?;
        std::fs::set_permissions(&self.run, std::fs::Permissions::from_mode(0o711))?;
        for entry in std::fs::read_dir(&self.run)? {
            let entry = entry?;
            std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    }

    /// Remove the directory, reporting failures instead of ignoring them
    pub fn close(self) -> Result<(), SandboxError> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        debug!(path = %path.display(), "removed scratch directory");
        Ok(())
    }
}
