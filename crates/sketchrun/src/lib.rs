//! Compile and run Arduino-style sketches in bounded sandboxes.
//!
//! Student code is spliced into a harness that emulates `setup()`, `loop()`
//! and `Serial`, compiled with a native toolchain, and executed under CPU,
//! memory, process and wall clock limits. Each request ends in exactly one
//! [`ExecutionResult`].
//!
//! # Pipeline
//!
//! - [`assembler`] splices the sketch into the [`harness`].
//! - [`queue`] admits the job or rejects it when the pool is saturated.
//! - [`executor`] compiles and runs it on a [`sandbox`] backend.
//! - [`report`] maps the outcome to the `POST /run` response served by [`api`].

pub use api::{AppState, router, serve};
pub use assembler::{AssemblyError, CompilationUnit, assemble};
pub use config::{BackendKind, Config, ConfigError, EXAMPLE_CONFIG};
pub use executor::Executor;
pub use harness::Harness;
pub use job::{ExecutionJob, JobState, TransitionError};
pub use queue::JobQueue;
pub use report::Report;
pub use sandbox::{Backend, SandboxError, confinement_available, preflight, prepare_cgroup};
pub use types::{ExecutionRequest, ExecutionResult, MountConfig, ResourceLimits, ResultKind};

pub mod api;
pub mod assembler;
pub mod config;
pub mod executor;
pub mod harness;
pub mod job;
pub mod queue;
pub mod report;
pub mod sandbox;
pub mod types;
