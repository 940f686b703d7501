//! Isolate meta files
//!
//! After `isolate --run`, the meta file holds `key:value` lines describing
//! how the program ended (`status`, `exitcode`, `exitsig`, `time-wall`,
//! `message`, ...).

use std::collections::HashMap;
use std::path::Path;

use crate::sandbox::{Captured, PhaseOutcome, PhaseStatus, SandboxError};

#[derive(Debug, Clone, Default)]
pub struct MetaFile {
    entries: HashMap<String, String>,
}

impl MetaFile {
    /// Parse meta file content, skipping lines without a key
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| line.trim().split_once(':'))
            .map(|(key, value)| (key.trim(), value.trim()))
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect();
        Self { entries }
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SandboxError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(Self::parse(&content))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Missing status means the program exited normally
    pub fn status(&self) -> PhaseStatus {
        self.get("status")
            .map(PhaseStatus::from_isolate_status)
            .unwrap_or(PhaseStatus::Ok)
    }

    pub fn wall_time(&self) -> f64 {
        self.parsed("time-wall").unwrap_or(0.0)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.parsed("exitcode")
    }

    pub fn signal(&self) -> Option<i32> {
        self.parsed("exitsig")
    }

    pub fn message(&self) -> Option<String> {
        self.get("message").map(str::to_owned)
    }

    /// Combine with the captured streams of the same run
    pub fn into_outcome(self, stdout: Captured, stderr: Captured) -> PhaseOutcome {
        PhaseOutcome {
            status: self.status(),
            exit_code: self.exit_code(),
            signal: self.signal(),
            wall_time: self.wall_time(),
            message: self.message(),
            stdout,
            stderr,
        }
    }
}
