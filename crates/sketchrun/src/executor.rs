//! Drives one job through compile and run on a sandbox backend

use tracing::{debug, error, info, instrument, warn};

use crate::assembler::{CompilationUnit, assemble};
use crate::config::Config;
use crate::harness::Harness;
use crate::job::{ExecutionJob, JobState};
use crate::report;
use crate::sandbox::{Backend, SandboxError, Workspace};
use crate::types::ExecutionResult;

/// Turns compilation units into results.
///
/// Every failure inside the sandbox becomes an [`ExecutionResult`]; nothing
/// escapes [`execute`](Self::execute) as an error.
#[derive(Debug)]
pub struct Executor {
    harness: Harness,
    backend: Backend,
}

impl Executor {
    pub fn new(config: &Config) -> Self {
        Self::with_backend(Harness::new(&config.harness), Backend::from_config(config))
    }

    pub fn with_backend(harness: Harness, backend: Backend) -> Self {
        Self { harness, backend }
    }

    pub fn harness(&self) -> &Harness {
        &self.harness
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Splice `code` into this executor's harness
    pub fn assemble(&self, code: &str) -> CompilationUnit {
        assemble(&self.harness, code)
    }

    /// Run `job` to a terminal state on worker `slot`
    #[instrument(skip_all, fields(job = %job.id(), slot))]
    pub async fn execute(&self, job: &mut ExecutionJob, slot: u32) -> ExecutionResult {
        let result = match self.drive(job, slot).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "job failed inside the sandbox");
                ExecutionResult::internal_error()
            }
        };

        // A refused transition is already logged by the job
        let _ = job.finish(&result);
        info!(
            kind = %result.kind,
            state = ?job.state(),
            elapsed_ms = job.elapsed().as_millis() as u64,
            "job finished"
        );
        result
    }

    async fn drive(&self, job: &mut ExecutionJob, slot: u32) -> Result<ExecutionResult, SandboxError> {
        job.advance(JobState::Compiling)?;
        let mut workspace = self.backend.prepare(slot, job.id()).await?;
        debug!(path = %workspace.path().display(), "workspace ready");

        let result = compile_and_run(job, &mut workspace)
            .await
            .map(|result| report::hide_workspace(result, workspace.path()));

        if let Err(e) = workspace.release().await {
            warn!(error = %e, "failed to release job workspace");
        }
        result
    }
}

async fn compile_and_run(
    job: &mut ExecutionJob,
    workspace: &mut Workspace,
) -> Result<ExecutionResult, SandboxError> {
    let compiled = workspace.compile(job.unit()).await?;
    debug!(status = ?compiled.status, wall_time = compiled.wall_time, "compile finished");
    if let Some(result) = report::classify_compile(&compiled) {
        return Ok(result);
    }

    job.advance(JobState::Running)?;
    let ran = workspace.run().await?;
    debug!(status = ?ran.status, wall_time = ran.wall_time, "run finished");
    Ok(report::classify_run(&ran))
}
