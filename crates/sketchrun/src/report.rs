//! Classifies phase outcomes and renders the `/run` response contract
//!
//! | kind | status | body |
//! |---|---|---|
//! | success | 200 | `{"output": stdout}` |
//! | compile_error | 200 | `{"error": compiler output}` |
//! | runtime_error | 200 | `{"error": stderr + exit info}` |
//! | timeout | 200 | `{"error": "execution timed out"}` |
//! | rejected | 503 | `{"error": "server busy, try again"}` |
//! | internal_error | 500 | `{"error": "internal error, please try again later"}` |
//! | bad request | 400 | `{"error": what is wrong}` |

use std::path::Path;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::assembler::AssemblyError;
use crate::sandbox::PhaseOutcome;
use crate::types::{ExecutionResult, ResultKind};

pub const TIMEOUT_MESSAGE: &str = "execution timed out";
pub const REJECTED_MESSAGE: &str = "server busy, try again";
pub const INTERNAL_MESSAGE: &str = "internal error, please try again later";

/// Verdict of the compile phase, or `None` if the run phase should follow
pub fn classify_compile(outcome: &PhaseOutcome) -> Option<ExecutionResult> {
    if outcome.is_timeout() {
        return Some(ExecutionResult::timeout());
    }
    if outcome.is_success() {
        return None;
    }

    let mut diagnostic = String::new();
    for stream in [&outcome.stdout, &outcome.stderr] {
        if stream.is_empty() {
            continue;
        }
        if !diagnostic.is_empty() && !diagnostic.ends_with('\n') {
            diagnostic.push('\n');
        }
        diagnostic.push_str(&stream.to_text());
    }
    if outcome.signal.is_some() || diagnostic.is_empty() {
        push_line(&mut diagnostic, &format!("compiler {}", outcome.termination()));
    }
    Some(ExecutionResult::compile_error(diagnostic))
}

/// Verdict of the run phase
pub fn classify_run(outcome: &PhaseOutcome) -> ExecutionResult {
    if outcome.is_timeout() {
        return ExecutionResult::timeout();
    }

    let output = outcome.stdout.to_text();
    if outcome.is_success() {
        return ExecutionResult::success(output);
    }

    let mut diagnostic = outcome.stderr.to_text();
    push_line(&mut diagnostic, &format!("program {}", outcome.termination()));
    ExecutionResult::runtime_error(output, diagnostic)
}

/// Rewrite host paths under `workspace` in the diagnostic as `.`
///
/// Toolchains print absolute object and temp file paths; callers only ever
/// see the job's directory as `.`.
pub fn hide_workspace(mut result: ExecutionResult, workspace: &Path) -> ExecutionResult {
    let Some(diagnostic) = result.diagnostic.as_mut() else {
        return result;
    };

    let mut prefixes = vec![workspace.to_string_lossy().into_owned()];
    if let Ok(canonical) = workspace.canonicalize() {
        prefixes.push(canonical.to_string_lossy().into_owned());
    }
    // Longest first, so a canonical path is not half rewritten
    prefixes.sort_by_key(|prefix| std::cmp::Reverse(prefix.len()));
    for prefix in prefixes.iter().filter(|prefix| prefix.len() > 1) {
        if diagnostic.contains(prefix.as_str()) {
            *diagnostic = diagnostic.replace(prefix.as_str(), ".");
        }
    }
    result
}

fn push_line(text: &mut String, line: &str) {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(line);
}

/// JSON body of a `/run` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Output { output: String },
    Error { error: String },
}

/// Status code and body for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub status: StatusCode,
    pub body: ResponseBody,
}

impl Report {
    pub fn from_result(result: &ExecutionResult) -> Self {
        let error = |status, message: &str| Report {
            status,
            body: ResponseBody::Error {
                error: message.to_owned(),
            },
        };

        match result.kind {
            ResultKind::Success => Report {
                status: StatusCode::OK,
                body: ResponseBody::Output {
                    output: result.output.clone(),
                },
            },
            ResultKind::CompileError | ResultKind::RuntimeError => error(
                StatusCode::OK,
                result.diagnostic.as_deref().unwrap_or_default(),
            ),
            ResultKind::Timeout => error(StatusCode::OK, TIMEOUT_MESSAGE),
            ResultKind::Rejected => error(StatusCode::SERVICE_UNAVAILABLE, REJECTED_MESSAGE),
            ResultKind::InternalError => error(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_MESSAGE),
        }
    }

    pub fn assembly_error(err: &AssemblyError) -> Self {
        Report {
            status: StatusCode::BAD_REQUEST,
            body: ResponseBody::Error {
                error: err.to_string(),
            },
        }
    }
}

impl From<ExecutionResult> for Report {
    fn from(result: ExecutionResult) -> Self {
        Report::from_result(&result)
    }
}

impl From<AssemblyError> for Report {
    fn from(err: AssemblyError) -> Self {
        Report::assembly_error(&err)
    }
}

impl IntoResponse for Report {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
