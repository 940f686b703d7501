//! Admission control and worker slots
//!
//! At most `workers + queue_capacity` jobs are admitted at once. Anything
//! beyond that is rejected on the spot. Admitted jobs wait for one of
//! `workers` slots in arrival order.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, instrument, warn};

use crate::config::PoolConfig;
use crate::executor::Executor;
use crate::job::{ExecutionJob, JobState};
use crate::types::ExecutionResult;

type FreeList = Arc<Mutex<Vec<u32>>>;

/// A worker slot held by one job. The id returns to the free list on drop.
#[derive(Debug)]
struct WorkerSlot {
    id: u32,
    free: FreeList,
    _permit: OwnedSemaphorePermit,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        // The id goes back before the permit is released (fields drop after
        // this body), so the next holder always finds a free id
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.id);
    }
}

/// Bounded, fair job queue in front of an [`Executor`]
#[derive(Debug)]
pub struct JobQueue {
    executor: Arc<Executor>,
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    free: FreeList,
    worker_count: usize,
    capacity: usize,
}

impl JobQueue {
    pub fn new(executor: Executor, pool: &PoolConfig) -> Self {
        let worker_count = pool.workers;
        let capacity = pool.workers.saturating_add(pool.queue_capacity);
        // Slot 0 is handed out first
        let free = (0..worker_count as u32).rev().collect();

        Self {
            executor: Arc::new(executor),
            admission: Arc::new(Semaphore::new(capacity)),
            workers: Arc::new(Semaphore::new(worker_count)),
            free: Arc::new(Mutex::new(free)),
            worker_count,
            capacity,
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Jobs that may be admitted at once, running and waiting
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn workers(&self) -> usize {
        self.worker_count
    }

    /// Worker slots not currently running a job
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Jobs admitted and not yet finished
    pub fn pending(&self) -> usize {
        self.capacity - self.admission.available_permits()
    }

    /// Assemble `code`, then compile and run it once a worker is free.
    ///
    /// Admission is decided when the returned future is first polled; a full
    /// queue yields [`ExecutionResult::rejected`] without waiting. Dropping
    /// the future at any point kills the job's processes and removes its
    /// files.
    #[instrument(skip_all, fields(job = tracing::field::Empty))]
    pub async fn submit(&self, code: &str) -> ExecutionResult {
        let mut job = ExecutionJob::new(self.executor.assemble(code));
        tracing::Span::current().record("job", tracing::field::display(job.id()));

        let Ok(_admitted) = Arc::clone(&self.admission).try_acquire_owned() else {
            let result = ExecutionResult::rejected();
            let _ = job.finish(&result);
            warn!(capacity = self.capacity, "queue full, rejecting job");
            return result;
        };

        let waiting_since = Instant::now();
        let Some(slot) = self.acquire_slot().await else {
            return ExecutionResult::internal_error();
        };
        debug!(
            slot = slot.id,
            waited_ms = waiting_since.elapsed().as_millis() as u64,
            "worker slot acquired"
        );

        self.executor.execute(&mut job, slot.id).await
    }

    async fn acquire_slot(&self) -> Option<WorkerSlot> {
        let permit = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(error = %e, "worker semaphore closed");
                return None;
            }
        };

        let id = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match id {
            Some(id) => Some(WorkerSlot {
                id,
                free: Arc::clone(&self.free),
                _permit: permit,
            }),
            None => {
                error!("worker permit granted but no slot id is free");
                None
            }
        }
    }
}
