//! Execution jobs and their one-way state machine

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::assembler::CompilationUnit;
use crate::types::{ExecutionResult, ResultKind};

/// Where a job is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Compiling,
    Running,
    Completed,
    Failed,
    TimedOut,
    Rejected,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::TimedOut | JobState::Rejected
        )
    }

    /// Whether `self -> next` is a legal step
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Compiling | Rejected)
                | (Compiling, Running | Failed | TimedOut)
                | (Running, Completed | Failed | TimedOut)
        )
    }

    /// Terminal state a finished job with this result ends in
    pub fn for_result(kind: ResultKind) -> JobState {
        match kind {
            ResultKind::Success => JobState::Completed,
            ResultKind::CompileError | ResultKind::RuntimeError | ResultKind::InternalError => {
                JobState::Failed
            }
            ResultKind::Timeout => JobState::TimedOut,
            ResultKind::Rejected => JobState::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {job} cannot go from {from:?} to {to:?}")]
pub struct TransitionError {
    pub job: Uuid,
    pub from: JobState,
    pub to: JobState,
}

/// One compile-and-run attempt of one compilation unit.
///
/// Jobs never retry: a terminal job stays terminal.
#[derive(Debug)]
pub struct ExecutionJob {
    id: Uuid,
    unit: CompilationUnit,
    submitted_at: Instant,
    state: JobState,
}

impl ExecutionJob {
    pub fn new(unit: CompilationUnit) -> Self {
        Self {
            id: Uuid::new_v4(),
            unit,
            submitted_at: Instant::now(),
            state: JobState::Queued,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn unit(&self) -> &CompilationUnit {
        &self.unit
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Time since submission
    pub fn elapsed(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    /// Move to `next`, refusing (and logging) illegal transitions
    pub fn advance(&mut self, next: JobState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            let err = TransitionError {
                job: self.id,
                from: self.state,
                to: next,
            };
            warn!(%err, "refused job state transition");
            return Err(err);
        }
        self.state = next;
        Ok(())
    }

    /// Enter the terminal state matching `result`
    pub fn finish(&mut self, result: &ExecutionResult) -> Result<(), TransitionError> {
        self.advance(JobState::for_result(result.kind))
    }
}
