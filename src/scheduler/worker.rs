use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::{Cluster, GridNode, NodeId};
use crate::deployment::Deployment;
use crate::error::GridError;
use crate::messenger::{Message, Messenger, Topic};
use crate::scheduler::job::{
    ComputeJob, ExecuteResponse, JobContext, JobFailure, JobHoldSupport, JobId, JobResult,
    JobSession,
};
use crate::scheduler::reservation::PartitionReservation;

/// Externally visible worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    Queued,
    Started,
    Held,
    Finishing,
    Finished,
    Cancelled,
}

/// Internal execution phase; `held` and `cancelled` are orthogonal flags.
const PHASE_QUEUED: u8 = 0;
const PHASE_STARTED: u8 = 1;
const PHASE_FINISHING: u8 = 2;
const PHASE_FINISHED: u8 = 3;

/// Lifecycle callbacks fired by a worker, consumed by the scheduler to
/// keep its maps consistent.
pub trait JobEventListener: Send + Sync {
    fn on_job_queued(&self, worker: &JobWorker);

    fn on_job_started(&self, worker: &JobWorker);

    fn on_before_response_sent(&self, worker: &JobWorker);

    fn on_job_finished(&self, worker: &JobWorker);
}

/// Hold/unhold callbacks; the scheduler keeps held jobs out of the
/// collision active view.
pub trait JobHoldListener: Send + Sync {
    fn on_held(&self, worker: &JobWorker) -> bool;

    fn on_unheld(&self, worker: &JobWorker) -> bool;
}

pub type InterruptTimeoutSupplier = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Executes one job to completion, reporting the result back to the task
/// originator and firing lifecycle callbacks along the way.
pub struct JobWorker {
    self_weak: Weak<JobWorker>,
    session: Arc<JobSession>,
    context: Arc<JobContext>,
    deployment: Arc<Deployment>,
    job: Mutex<Option<Arc<dyn ComputeJob>>>,
    origin: GridNode,
    internal: bool,
    created_at: DateTime<Utc>,
    queued_at: Instant,
    started_at: Mutex<Option<Instant>>,
    finished_at: Mutex<Option<Instant>>,
    phase: AtomicU8,
    held: AtomicBool,
    cancel_requested: AtomicBool,
    sys_cancelled: AtomicBool,
    timed_out: AtomicBool,
    master_left: AtomicBool,
    stopping: AtomicBool,
    dep_released: AtomicBool,
    reservation: Option<Arc<PartitionReservation>>,
    interrupt_timeout: InterruptTimeoutSupplier,
    event_listener: Arc<dyn JobEventListener>,
    hold_listener: Arc<dyn JobHoldListener>,
    messenger: Arc<dyn Messenger>,
    cluster: Arc<dyn Cluster>,
    local: NodeId,
    /// Hard-interrupt signal, fired when cooperative cancellation is not
    /// honored within the interrupt timeout.
    interrupt: CancellationToken,
    timeout_task: Mutex<Option<AbortHandle>>,
    finished_tx: tokio::sync::watch::Sender<bool>,
}

#[allow(clippy::too_many_arguments)]
impl JobWorker {
    pub fn new(
        session: Arc<JobSession>,
        context: Arc<JobContext>,
        deployment: Arc<Deployment>,
        origin: GridNode,
        internal: bool,
        created_at: DateTime<Utc>,
        reservation: Option<Arc<PartitionReservation>>,
        interrupt_timeout: InterruptTimeoutSupplier,
        event_listener: Arc<dyn JobEventListener>,
        hold_listener: Arc<dyn JobHoldListener>,
        messenger: Arc<dyn Messenger>,
        cluster: Arc<dyn Cluster>,
        local: NodeId,
    ) -> Arc<Self> {
        let (finished_tx, _) = tokio::sync::watch::channel(false);

        Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            session,
            context,
            deployment,
            job: Mutex::new(None),
            origin,
            internal,
            created_at,
            queued_at: Instant::now(),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
            phase: AtomicU8::new(PHASE_QUEUED),
            held: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            sys_cancelled: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            master_left: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            dep_released: AtomicBool::new(false),
            reservation,
            interrupt_timeout,
            event_listener,
            hold_listener,
            messenger,
            cluster,
            local,
            interrupt: CancellationToken::new(),
            timeout_task: Mutex::new(None),
            finished_tx,
        })
    }

    /// Bind the job instance from the deployment. A failure finishes the
    /// worker immediately with the creation error.
    pub fn initialize(self: &Arc<Self>) -> bool {
        let args = self.context.attributes();

        match self
            .deployment
            .create_job(&self.session.task_class, &args)
        {
            Ok(job) => {
                *self.job.lock() = Some(job);

                self.context
                    .bind_worker(self.self_weak.clone() as Weak<dyn JobHoldSupport>);

                self.event_listener.on_job_queued(self);
                true
            }
            Err(e) => {
                tracing::error!(
                    job_id = %self.job_id(),
                    task_class = %self.session.task_class,
                    error = %e,
                    "Failed to instantiate job"
                );

                self.finish_job(None, Some(e), true);
                false
            }
        }
    }

    pub fn job_id(&self) -> JobId {
        self.session.job_id
    }

    pub fn session(&self) -> &Arc<JobSession> {
        &self.session
    }

    pub fn context(&self) -> &Arc<JobContext> {
        &self.context
    }

    pub fn deployment(&self) -> &Arc<Deployment> {
        &self.deployment
    }

    pub fn origin(&self) -> &GridNode {
        &self.origin
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub fn is_finishing(&self) -> bool {
        self.phase.load(Ordering::SeqCst) >= PHASE_FINISHING
    }

    pub fn is_finished(&self) -> bool {
        self.phase.load(Ordering::SeqCst) == PHASE_FINISHED
    }

    pub fn status(&self) -> WorkerStatus {
        let phase = self.phase.load(Ordering::SeqCst);

        if self.is_cancelled() && phase != PHASE_FINISHED {
            return WorkerStatus::Cancelled;
        }

        match phase {
            PHASE_QUEUED => WorkerStatus::Queued,
            PHASE_STARTED if self.held() => WorkerStatus::Held,
            PHASE_STARTED => WorkerStatus::Started,
            PHASE_FINISHING => WorkerStatus::Finishing,
            _ => WorkerStatus::Finished,
        }
    }

    /// Milliseconds spent queued before execution started.
    pub fn queued_time_ms(&self) -> u64 {
        let started = self.started_at.lock().unwrap_or_else(Instant::now);
        started.duration_since(self.queued_at).as_millis() as u64
    }

    /// Milliseconds of execution so far (or total, once finished).
    pub fn execute_time_ms(&self) -> u64 {
        let started = match *self.started_at.lock() {
            Some(s) => s,
            None => return 0,
        };

        let end = self.finished_at.lock().unwrap_or_else(Instant::now);
        end.duration_since(started).as_millis() as u64
    }

    pub fn end_time_ms(&self) -> i64 {
        self.session.end_time_ms
    }

    /// Wait until the worker finished (response sent, bookkeeping done).
    pub async fn await_finished(&self) {
        let mut rx = self.finished_tx.subscribe();

        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Execute the job on the current task.
    pub async fn run(self: Arc<Self>) {
        if self
            .phase
            .compare_exchange(
                PHASE_QUEUED,
                PHASE_STARTED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            // Already rejected or finished before reaching a thread.
            return;
        }

        *self.started_at.lock() = Some(Instant::now());

        self.event_listener.on_job_started(&self);

        self.register_timeout();

        if let Some(reservation) = &self.reservation {
            match reservation.reserve() {
                Ok(true) => {}
                Ok(false) => {
                    self.finish_job(
                        None,
                        Some(GridError::PartitionsLost(
                            "partitions are not available on this node".to_string(),
                        )),
                        true,
                    );
                    return;
                }
                Err(e) => {
                    self.finish_job(None, Some(e), true);
                    return;
                }
            }
        }

        let job = self.job.lock().clone();

        let Some(job) = job else {
            self.finish_job(
                None,
                Some(GridError::Internal("worker was not initialized".to_string())),
                true,
            );
            return;
        };

        let outcome = tokio::select! {
            res = job.execute(self.context.clone()) => res,
            _ = self.interrupt.cancelled() => Err(self.interruption_error()),
        };

        match outcome {
            Ok(result) => self.finish_job(Some(result), None, true),
            // An error after the deadline passed reports as a timeout.
            Err(_) if self.is_timed_out() => {
                self.finish_job(None, Some(GridError::Timeout(self.job_id())), true)
            }
            Err(e) => self.finish_job(None, Some(e), true),
        }
    }

    fn interruption_error(&self) -> GridError {
        if self.is_timed_out() {
            GridError::Timeout(self.job_id())
        } else {
            GridError::ExecutionRejected("job was interrupted after cancellation".to_string())
        }
    }

    /// Request cancellation: cooperative signal first, hard interrupt once
    /// the interrupt timeout elapses without the job exiting.
    pub fn cancel(self: &Arc<Self>, system: bool) {
        self.cancel_requested.store(true, Ordering::SeqCst);

        if system {
            self.sys_cancelled.store(true, Ordering::SeqCst);
        }

        self.context.cancel_token().cancel();

        let job = self.job.lock().clone();

        if let Some(job) = job {
            job.cancel();
        }

        let timeout_ms = (self.interrupt_timeout)();
        let worker = self.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;

            if !worker.is_finishing() {
                tracing::warn!(
                    job_id = %worker.job_id(),
                    timeout_ms,
                    "Job did not exit after cancellation, interrupting"
                );

                worker.interrupt.cancel();
            }
        });
    }

    /// Called by the timeout tracker when the job's end time passed.
    pub fn on_timeout(self: &Arc<Self>) {
        if self.is_finishing() {
            return;
        }

        self.timed_out.store(true, Ordering::SeqCst);

        tracing::warn!(job_id = %self.job_id(), "Job execution timed out, cancelling");

        self.cancel(false);
    }

    /// Register for end-time expiry. No-op for jobs without a deadline.
    pub fn register_timeout(self: &Arc<Self>) {
        if self.session.end_time_ms == i64::MAX {
            return;
        }

        let delay_ms = (self.session.end_time_ms - Utc::now().timestamp_millis()).max(0) as u64;
        let worker = self.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            worker.on_timeout();
        })
        .abort_handle();

        *self.timeout_task.lock() = Some(handle);
    }

    /// Node shutdown is in progress; a cancel may follow.
    pub fn on_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// The originating node left. Returns `true` if the job promises to
    /// terminate on its own; either way its response is suppressed.
    pub fn master_node_left(&self) -> bool {
        self.master_left.store(true, Ordering::SeqCst);

        let job = self.job.lock().clone();

        match job {
            Some(job) => job.on_master_leave(),
            None => false,
        }
    }

    /// Complete the worker: send the response (unless suppressed), release
    /// the reservation and the deployment, and fire the finished callback.
    /// Idempotent; only the first call wins.
    pub fn finish_job(
        self: &Arc<Self>,
        result: Option<JobResult>,
        error: Option<GridError>,
        send_reply: bool,
    ) {
        loop {
            let current = self.phase.load(Ordering::SeqCst);

            if current >= PHASE_FINISHING {
                return;
            }

            if self
                .phase
                .compare_exchange(current, PHASE_FINISHING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        *self.finished_at.lock() = Some(Instant::now());

        self.event_listener.on_before_response_sent(self);

        let suppress = self.master_left.load(Ordering::SeqCst)
            || self.sys_cancelled.load(Ordering::SeqCst)
            || !send_reply;

        if suppress {
            tracing::debug!(job_id = %self.job_id(), "Job response suppressed");
        } else {
            self.send_response(result, error.as_ref());
        }

        if let Some(reservation) = &self.reservation {
            reservation.release();
        }

        self.release_deployment();

        if let Some(handle) = self.timeout_task.lock().take() {
            handle.abort();
        }

        self.phase.store(PHASE_FINISHED, Ordering::SeqCst);
        let _ = self.finished_tx.send(true);

        self.event_listener.on_job_finished(self);
    }

    fn send_response(&self, result: Option<JobResult>, error: Option<&GridError>) {
        let origin = self.origin.id;

        if self.cluster.node(origin).is_none() {
            // Job reply failed: the original task node left the grid.
            tracing::warn!(
                job_id = %self.job_id(),
                node = %origin,
                "Failed to reply to sender node because it left grid"
            );
            return;
        }

        let response = ExecuteResponse {
            node: self.local,
            session_id: self.session.session_id,
            job_id: self.job_id(),
            result,
            error: error.map(JobFailure::from),
            attributes: self
                .session
                .full_support
                .then(|| self.session.attributes()),
            cancelled: self.is_cancelled(),
        };

        let send_result = if self.session.full_support {
            // Ordered send on the per-job topic, so attribute updates and
            // the result keep their relative order. Expired sessions still
            // get a floor timeout: the response is always attempted.
            let timeout = self.session.remaining_time_ms().max(1) as u64;

            self.messenger.send_ordered(
                origin,
                self.session.job_topic(self.local),
                Message::ExecuteResult(response),
                timeout,
            )
        } else {
            self.messenger
                .send_unordered(origin, Topic::Task, Message::ExecuteResult(response))
        };

        if let Err(e) = send_result {
            if self.cluster.node(origin).is_none() || !self.cluster.ping(origin) {
                tracing::warn!(
                    job_id = %self.job_id(),
                    node = %origin,
                    "Failed to reply to sender node because it left grid"
                );
            } else {
                tracing::error!(
                    job_id = %self.job_id(),
                    node = %origin,
                    error = %e,
                    "Error sending job reply"
                );
            }
        }
    }

    fn release_deployment(&self) {
        if !self.dep_released.swap(true, Ordering::SeqCst) {
            self.deployment.release();
        }
    }
}

impl JobHoldSupport for JobWorker {
    fn hold(&self) -> bool {
        if self.hold_listener.on_held(self) {
            self.held.store(true, Ordering::SeqCst);
            return true;
        }

        false
    }

    fn unhold(&self) -> bool {
        let was_held = self.hold_listener.on_unheld(self);
        self.held.store(false, Ordering::SeqCst);
        was_held
    }
}

impl std::fmt::Debug for JobWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobWorker")
            .field("job_id", &self.job_id())
            .field("session_id", &self.session.session_id)
            .field("status", &self.status())
            .field("internal", &self.internal)
            .finish()
    }
}
