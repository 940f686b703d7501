//! Splices student code into the harness
//!
//! The sketch is opaque text: it is never parsed, escaped or rewritten.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::harness::Harness;

/// Request could not be turned into a compilation unit
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("request is missing the `code` field")]
    MissingCode,
}

/// Harness plus one sketch, ready for the toolchain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationUnit {
    text: String,
    sketch_len: usize,
}

impl CompilationUnit {
    /// Full source text of the unit
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Length in bytes of the spliced sketch
    pub fn sketch_len(&self) -> usize {
        self.sketch_len
    }

    /// Write the unit to `dir/name` and return the path
    pub async fn materialize(&self, dir: &Path, name: &str) -> std::io::Result<PathBuf> {
        let path = dir.join(name);
        tokio::fs::write(&path, self.text.as_bytes()).await?;
        debug!(?path, len = self.text.len(), "materialized compilation unit");
        Ok(path)
    }
}

/// Produce exactly one compilation unit from one sketch
pub fn assemble(harness: &Harness, code: &str) -> CompilationUnit {
    let prologue = harness.prologue();
    let epilogue = harness.epilogue();

    let mut text = String::with_capacity(prologue.len() + code.len() + epilogue.len());
    text.push_str(prologue);
    text.push_str(code);
    text.push_str(epilogue);

    CompilationUnit {
        text,
        sketch_len: code.len(),
    }
}
