use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resource ceilings for one phase (compile or run) of a job.
///
/// Every field is optional so that partial tables in the config file only
/// override what they name (see [`ResourceLimits::with_overrides`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time limit in seconds
    #[serde(default)]
    pub time_limit: Option<f64>,

    /// Wall clock time limit in seconds
    #[serde(default)]
    pub wall_time_limit: Option<f64>,

    /// Address space limit in kilobytes
    #[serde(default)]
    pub memory_limit: Option<u64>,

    /// Stack size limit in kilobytes
    #[serde(default)]
    pub stack_limit: Option<u64>,

    /// Maximum number of processes/threads
    #[serde(default)]
    pub max_processes: Option<u32>,

    /// Maximum captured size of each output stream in kilobytes
    #[serde(default)]
    pub max_output: Option<u64>,

    /// Maximum size of any file the program writes, in kilobytes
    #[serde(default)]
    pub max_file_size: Option<u64>,

    /// Maximum open files
    #[serde(default)]
    pub max_open_files: Option<u32>,

    /// Grace period past the CPU limit before isolate kills the box, in seconds
    #[serde(default)]
    pub extra_time: Option<f64>,
}

impl ResourceLimits {
    /// 1 kilobyte in kilobytes
    pub const KB: u64 = 1;
    /// 1 megabyte in kilobytes
    pub const MB: u64 = 1024;
    /// 1 gigabyte in kilobytes
    pub const GB: u64 = 1024 * 1024;

    /// Limits with every field unset
    pub fn unlimited() -> Self {
        Self {
            time_limit: None,
            wall_time_limit: None,
            memory_limit: None,
            stack_limit: None,
            max_processes: None,
            max_output: None,
            max_file_size: None,
            max_open_files: None,
            extra_time: None,
        }
    }

    pub fn with_time_limit(mut self, seconds: f64) -> Self {
        self.time_limit = Some(seconds);
        self
    }

    pub fn with_wall_time_limit(mut self, seconds: f64) -> Self {
        self.wall_time_limit = Some(seconds);
        self
    }

    pub fn with_memory_limit(mut self, kb: u64) -> Self {
        self.memory_limit = Some(kb);
        self
    }

    pub fn with_max_processes(mut self, count: u32) -> Self {
        self.max_processes = Some(count);
        self
    }

    pub fn with_max_output(mut self, kb: u64) -> Self {
        self.max_output = Some(kb);
        self
    }

    pub fn with_max_file_size(mut self, kb: u64) -> Self {
        self.max_file_size = Some(kb);
        self
    }

    /// Apply overrides from another ResourceLimits, preferring values from `overrides`
    pub fn with_overrides(&self, overrides: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            time_limit: overrides.time_limit.or(self.time_limit),
            wall_time_limit: overrides.wall_time_limit.or(self.wall_time_limit),
            memory_limit: overrides.memory_limit.or(self.memory_limit),
            stack_limit: overrides.stack_limit.or(self.stack_limit),
            max_processes: overrides.max_processes.or(self.max_processes),
            max_output: overrides.max_output.or(self.max_output),
            max_file_size: overrides.max_file_size.or(self.max_file_size),
            max_open_files: overrides.max_open_files.or(self.max_open_files),
            extra_time: overrides.extra_time.or(self.extra_time),
        }
    }

    /// Wall clock budget for the phase.
    ///
    /// Negative, non-finite or out-of-range values are treated as unset.
    pub fn wall_time(&self) -> Option<Duration> {
        self.wall_time_limit
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Capture cap for one output stream in bytes
    pub fn output_cap(&self) -> Option<usize> {
        self.max_output
            .map(|kb| usize::try_from(kb.saturating_mul(1024)).unwrap_or(usize::MAX))
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            time_limit: Some(2.0),
            wall_time_limit: Some(5.0),
            memory_limit: Some(262144), // 256 MB
            stack_limit: Some(65536),   // 64 MB
            max_processes: Some(1),
            max_output: Some(64),
            max_file_size: Some(0),
            max_open_files: Some(64),
            extra_time: Some(0.5),
        }
    }
}

/// Configuration for a directory mount in Isolate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Source path on the host
    pub source: String,

    /// Target path in the sandbox
    pub target: String,

    /// Whether the mount is read-write (default: read-only)
    #[serde(default)]
    pub writable: bool,

    /// Whether this mount is optional (maps to isolate's `:maybe` flag)
    #[serde(default)]
    pub optional: bool,
}

/// Body of a `POST /run` request
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionRequest {
    /// Student source text, spliced into the harness as-is
    pub code: String,
}

/// Classification of a finished job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// Program compiled, ran and exited zero within budget
    Success,
    /// Toolchain rejected the compilation unit
    CompileError,
    /// Program exited nonzero or died from a signal
    RuntimeError,
    /// A compile or run budget elapsed
    Timeout,
    /// Admission control refused the job
    Rejected,
    /// The host could not run the job (toolchain missing, I/O failure, ...)
    InternalError,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Success => "success",
            ResultKind::CompileError => "compile_error",
            ResultKind::RuntimeError => "runtime_error",
            ResultKind::Timeout => "timeout",
            ResultKind::Rejected => "rejected",
            ResultKind::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ResultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one job, produced exactly once and then discarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub kind: ResultKind,

    /// Captured stdout of the sketch (empty unless it ran)
    pub output: String,

    /// Compiler or runtime diagnostic text, when there is one
    pub diagnostic: Option<String>,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            kind: ResultKind::Success,
            output: output.into(),
            diagnostic: None,
        }
    }

    pub fn compile_error(diagnostic: impl Into<String>) -> Self {
        Self {
            kind: ResultKind::CompileError,
            output: String::new(),
            diagnostic: Some(diagnostic.into()),
        }
    }

    pub fn runtime_error(output: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            kind: ResultKind::RuntimeError,
            output: output.into(),
            diagnostic: Some(diagnostic.into()),
        }
    }

    pub fn timeout() -> Self {
        Self::bare(ResultKind::Timeout)
    }

    pub fn rejected() -> Self {
        Self::bare(ResultKind::Rejected)
    }

    pub fn internal_error() -> Self {
        Self::bare(ResultKind::InternalError)
    }

    fn bare(kind: ResultKind) -> Self {
        Self {
            kind,
            output: String::new(),
            diagnostic: None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.kind == ResultKind::Success
    }
}
