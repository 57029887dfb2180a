use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::scheduler::job::{JobId, SessionId};
use crate::scheduler::processor::JobProcessor;
use crate::scheduler::worker::JobWorker;

/// One job as seen by a collision pass: either waiting for activation
/// (passive) or running (active/held).
pub struct CollisionJobContext {
    processor: Arc<JobProcessor>,
    worker: Arc<JobWorker>,
    passive: bool,
}

impl CollisionJobContext {
    pub(super) fn new(processor: Arc<JobProcessor>, worker: Arc<JobWorker>, passive: bool) -> Self {
        Self {
            processor,
            worker,
            passive,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.worker.job_id()
    }

    pub fn session_id(&self) -> SessionId {
        self.worker.session().session_id
    }

    pub fn task_name(&self) -> String {
        self.worker.session().task_name.clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.worker.created_at()
    }

    pub fn is_passive(&self) -> bool {
        self.passive
    }

    /// Priority attribute lookup against the job's session, used by
    /// priority-ordering policies.
    pub fn session_attribute(&self, key: &str) -> Option<serde_json::Value> {
        self.worker.session().attribute(key)
    }

    /// Activate a passive job: move it to the active map and submit it to
    /// its pool. Returns `false` if the job was concurrently cancelled or
    /// is not passive anymore.
    pub fn activate(&self) -> bool {
        self.processor.activate_from_collision(&self.worker)
    }

    /// Cancel the job. A passive job is rejected with an execution-rejected
    /// reply; an active one is cancelled as from the system.
    pub fn cancel(&self) -> bool {
        self.processor
            .cancel_from_collision(&self.worker, self.passive)
    }
}

/// Hook a policy can use to ask the scheduler for another collision pass,
/// e.g. when its own internal queue changed.
pub trait CollisionExternalListener: Send + Sync {
    fn on_external_collision(&self);
}

/// Pluggable admission and prioritization over queued and running jobs.
///
/// Views are snapshots of the scheduler maps at the instant of the call;
/// held jobs are excluded from `active` and surfaced separately.
pub trait CollisionPolicy: Send + Sync {
    fn on_collision(
        &self,
        passive: &[CollisionJobContext],
        active: &[CollisionJobContext],
        held: &[CollisionJobContext],
    );

    /// Install the scheduler's re-pass trigger. Policies that never
    /// re-evaluate on their own can ignore it.
    fn set_external_listener(&self, _listener: Arc<dyn CollisionExternalListener>) {}

    fn unset_external_listener(&self) {}

    /// Session attribute keys that carry task/job priorities. A change to
    /// one of these re-runs the collision pass.
    fn priority_attribute_keys(&self) -> (Option<String>, Option<String>) {
        (None, None)
    }
}

/// Reference policy: activate jobs in arrival order while the number of
/// running (non-held) jobs stays under the parallelism limit.
pub struct FifoQueuePolicy {
    parallel_jobs: usize,
}

impl FifoQueuePolicy {
    pub fn new(parallel_jobs: usize) -> Self {
        Self {
            parallel_jobs: parallel_jobs.max(1),
        }
    }
}

impl CollisionPolicy for FifoQueuePolicy {
    fn on_collision(
        &self,
        passive: &[CollisionJobContext],
        active: &[CollisionJobContext],
        _held: &[CollisionJobContext],
    ) {
        let mut running = active.len();

        for ctx in passive {
            if running >= self.parallel_jobs {
                break;
            }

            if ctx.activate() {
                running += 1;
            }
        }
    }
}
