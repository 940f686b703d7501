use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, de};

use crate::config::ConfigError;
use crate::types::ResourceLimits;

/// Default PATH for sandboxed processes
pub const DEFAULT_SANDBOX_PATH: &str = "/usr/bin:/bin";

/// Bare file name for an artifact inside a job directory (e.g. "sketch.cpp")
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileName(String);

impl FileName {
    pub fn new(name: &str) -> Result<Self, ConfigError> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(ConfigError::InvalidFileName);
        }
        Ok(Self(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for FileName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FileName::new(&s).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"a non-empty file name without '/' or '..'",
            )
        })
    }
}

impl std::fmt::Display for FileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for the compile phase
#[derive(Debug, Clone, Deserialize)]
pub struct ToolchainConfig {
    /// Command and arguments with placeholders
    /// Placeholders: {source}, {output}
    #[serde(default = "default_compile_command")]
    pub command: Vec<String>,

    /// Name of the compilation unit file in the build directory
    #[serde(default = "default_source_name")]
    pub source_name: FileName,

    /// Name of the produced binary
    #[serde(default = "default_output_name")]
    pub output_name: FileName,

    /// PATH for the compiler (it locates `as` and `ld` through it)
    #[serde(default = "default_sandbox_path")]
    pub path: String,

    /// Environment variables to set during compilation
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Resource limits for compilation (overrides the compile defaults)
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

impl ToolchainConfig {
    /// Expand placeholders in the compile command
    pub fn expand_command(&self, source: &str, output: &str) -> Vec<String> {
        expand_command(&self.command, source, output)
    }

    /// Compile defaults with the configured overrides applied
    pub fn effective_limits(&self) -> ResourceLimits {
        let base = default_compile_limits();
        match self.limits {
            Some(ref limits) => base.with_overrides(limits),
            None => base,
        }
    }
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            command: default_compile_command(),
            source_name: default_source_name(),
            output_name: default_output_name(),
            path: default_sandbox_path(),
            env: HashMap::new(),
            limits: None,
        }
    }
}

/// Configuration for the run phase
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunConfig {
    /// Resource limits for the sketch (overrides the run defaults)
    #[serde(default)]
    pub limits: Option<ResourceLimits>,

    /// Unprivileged uid for the sketch (process backend). Inside the jail the
    /// compiler drops to it as well. Required when the server starts as root.
    #[serde(default)]
    pub user: Option<u32>,

    /// Unprivileged gid to go with `user` (defaults to `user`)
    #[serde(default)]
    pub group: Option<u32>,

    /// Environment variables for the sketch; nothing else is inherited
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl RunConfig {
    /// Run defaults with the configured overrides applied
    pub fn effective_limits(&self) -> ResourceLimits {
        let base = ResourceLimits::default();
        match self.limits {
            Some(ref limits) => base.with_overrides(limits),
            None => base,
        }
    }

    /// `(uid, gid)` to switch to, if an account is configured
    pub fn credentials(&self) -> Option<(u32, u32)> {
        self.user.map(|uid| (uid, self.group.unwrap_or(uid)))
    }
}

/// Default compilation limits
pub fn default_compile_limits() -> ResourceLimits {
    ResourceLimits {
        time_limit: Some(10.0),
        wall_time_limit: Some(20.0),
        memory_limit: Some(1048576), // 1 GB
        stack_limit: None,
        max_processes: None,
        max_output: Some(64),
        max_file_size: Some(65536), // 64 MB
        max_open_files: Some(256),
        extra_time: Some(0.5),
    }
}

/// Expand `{source}` and `{output}` placeholders in a command
pub fn expand_command(command: &[String], source: &str, output: &str) -> Vec<String> {
    command
        .iter()
        .map(|arg| arg.replace("{source}", source).replace("{output}", output))
        .collect()
}

fn default_compile_command() -> Vec<String> {
    ["g++", "-std=gnu++17", "-O0", "-pipe", "{source}", "-o", "{output}"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

fn default_source_name() -> FileName {
    FileName("sketch.cpp".to_owned())
}

fn default_output_name() -> FileName {
    FileName("sketch".to_owned())
}

fn default_sandbox_path() -> String {
    DEFAULT_SANDBOX_PATH.to_owned()
}
