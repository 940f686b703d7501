use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub use crate::config::toolchain::{
    DEFAULT_SANDBOX_PATH, FileName, RunConfig, ToolchainConfig, default_compile_limits,
};
use crate::types::MountConfig;

mod loader;
pub mod toolchain;

/// Example configuration embedded at compile time.
///
/// It is also the default configuration, and `sketchrun init` writes it out.
pub const EXAMPLE_CONFIG: &str = include_str!("../../sketchrun.example.toml");

/// Prefix for environment overrides, e.g. `SKETCHRUN__POOL__WORKERS=4`
pub const ENV_PREFIX: &str = "SKETCHRUN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("file names must be non-empty and contain no '/' or '..'")]
    InvalidFileName,

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which sandbox implementation runs jobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Child processes with rlimits and a process group, jailed in namespaces
    #[default]
    Process,
    /// IOI Isolate boxes
    Isolate,
}

/// Config for sketchrun
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendKind,

    /// Directory under which each job gets its own scratch directory
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub harness: HarnessConfig,

    #[serde(default)]
    pub toolchain: ToolchainConfig,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub confinement: ConfinementConfig,

    #[serde(default)]
    pub isolate: IsolateConfig,
}

/// HTTP surface settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Upper bound in seconds a caller waits for its job, queueing included
    #[serde(default = "default_request_timeout")]
    pub request_timeout: f64,

    /// Origins allowed by CORS (the IDE front end)
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid bind address '{}'", self.bind)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.request_timeout).unwrap_or(Duration::MAX)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout: default_request_timeout(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

/// Worker pool and admission control
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Jobs compiled/run at the same time
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Jobs allowed to wait for a worker before new ones are rejected
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Emulated runtime settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HarnessConfig {
    /// How many times `main` calls `loop()`.
    ///
    /// Real firmware loops forever; the emulator stops after this many calls.
    #[serde(default = "default_loop_iterations")]
    pub loop_iterations: u32,

    /// Whether `Serial.println` appends a newline
    #[serde(default)]
    pub println_newline: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            loop_iterations: default_loop_iterations(),
            println_newline: false,
        }
    }
}

/// Namespace jail of the process backend
#[derive(Debug, Clone, Deserialize)]
pub struct ConfinementConfig {
    /// Run both phases in fresh user, mount, PID, network, IPC and UTS
    /// namespaces, chrooted into the phase directory. When off, sketches see
    /// the server's filesystem and network.
    #[serde(default = "default_confined")]
    pub enabled: bool,

    /// Host paths mounted read-only inside the jail. Paths missing on the
    /// host are skipped; `/dev/null` is always available.
    #[serde(default = "default_binds")]
    pub bind: Vec<PathBuf>,
}

impl Default for ConfinementConfig {
    fn default() -> Self {
        Self {
            enabled: default_confined(),
            bind: default_binds(),
        }
    }
}

/// Settings for the isolate backend
#[derive(Debug, Clone, Deserialize)]
pub struct IsolateConfig {
    /// Path to the Isolate binary (uses PATH if not specified).
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Use cgroup memory limiting instead of RLIMIT_AS.
    #[serde(default)]
    pub cgroup: bool,

    /// Cgroup root path for isolate. Must match isolate's `cg_root` config value.
    #[serde(default = "default_cg_root")]
    pub cg_root: PathBuf,

    /// Box id of worker slot 0; slot `n` uses `first_box_id + n`
    #[serde(default)]
    pub first_box_id: u32,

    /// Extra directory mounts for both phases
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
}

impl IsolateConfig {
    /// Get the path to the isolate binary
    pub fn binary(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| PathBuf::from("isolate"))
    }
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            path: None,
            cgroup: false,
            cg_root: default_cg_root(),
            first_box_id: 0,
            mounts: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_scratch_root() -> PathBuf {
    std::env::temp_dir().join("sketchrun")
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_owned()
}

fn default_request_timeout() -> f64 {
    30.0
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_owned()]
}

fn default_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    8
}

fn default_loop_iterations() -> u32 {
    1
}

fn default_confined() -> bool {
    true
}

fn default_binds() -> Vec<PathBuf> {
    ["/usr", "/bin", "/lib", "/lib64", "/etc/ld.so.cache"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

fn default_cg_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/isolate")
}
