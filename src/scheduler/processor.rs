use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Semaphore};
use uuid::Uuid;

use crate::cluster::{Cluster, ClusterEvent, ClusterEventListener, GridNode, NodeId};
use crate::config::{DistributedLongProperty, GridConfig};
use crate::deployment::{Deployment, DeploymentRegistry};
use crate::error::{GridError, Result};
use crate::messenger::{Message, MessageListener, Messenger, Topic};
use crate::scheduler::bounded::{BoundedOrderedMap, BoundedOrderedSet, OrderedMap};
use crate::scheduler::collision::{
    CollisionExternalListener, CollisionJobContext, CollisionPolicy,
};
use crate::scheduler::gate::StopGate;
use crate::scheduler::job::{
    AttributeMap, CancelRequest, ExecuteRequest, ExecuteResponse, JobContext, JobFailure, JobId,
    JobSession, JobSibling, SessionAttrRequest, SessionId, SiblingsRequest, SiblingsResponse,
};
use crate::scheduler::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::scheduler::reservation::{CacheTopology, PartitionReservation};
use crate::scheduler::worker::{
    JobEventListener, JobHoldListener, JobWorker, WorkerStatus,
};

/// Name of the runtime-updatable worker interrupt timeout property.
pub const COMPUTE_JOB_WORKER_INTERRUPT_TIMEOUT: &str = "computeJobWorkerInterruptTimeout";

thread_local! {
    static HANDLING_COLLISIONS: Cell<bool> = const { Cell::new(false) };
}

/// State tag of an entry in the flattened jobs view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobViewState {
    Active,
    Passive,
    Cancelled,
}

/// Read-only introspection record for one tracked job.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub session_id: SessionId,
    pub task_name: String,
    pub origin: NodeId,
    pub state: JobViewState,
    pub executor: Option<String>,
    pub held: bool,
}

struct SessionEntry {
    attrs: Arc<Mutex<AttributeMap>>,
    jobs: usize,
}

#[derive(Clone)]
struct PoolHandle {
    name: Option<String>,
    semaphore: Arc<Semaphore>,
}

impl PoolHandle {
    fn new(name: Option<String>, size: usize) -> Self {
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Queue the worker for execution. Fails only when the pool has been
    /// shut down.
    fn submit(&self, worker: Arc<JobWorker>) -> bool {
        if self.semaphore.is_closed() {
            return false;
        }

        let semaphore = self.semaphore.clone();

        tokio::spawn(async move {
            match semaphore.acquire_owned().await {
                Ok(_permit) => worker.run().await,
                Err(_) => worker.finish_job(
                    None,
                    Some(GridError::ExecutionRejected(
                        "executor pool has been stopped".to_string(),
                    )),
                    true,
                ),
            }
        });

        true
    }
}

struct Pools {
    default: PoolHandle,
    custom: HashMap<String, PoolHandle>,
}

impl Pools {
    fn from_config(config: &GridConfig) -> Self {
        Self {
            default: PoolHandle::new(None, config.default_pool_size),
            custom: config
                .custom_pools
                .iter()
                .map(|(name, size)| (name.clone(), PoolHandle::new(Some(name.clone()), *size)))
                .collect(),
        }
    }

    fn resolve(&self, executor: Option<&str>) -> PoolHandle {
        match executor {
            None => self.default.clone(),
            Some(name) => match self.custom.get(name) {
                Some(pool) => pool.clone(),
                None => {
                    tracing::warn!(
                        executor = name,
                        "Custom executor doesn't exist, job will run in the default pool"
                    );
                    self.default.clone()
                }
            },
        }
    }
}

/// Responsible for all grid job execution and communication on this node.
///
/// Owns the passive/active/sync-running/cancelled maps, processes incoming
/// execute, cancel and session-attribute messages, drives collision passes
/// and publishes the compute job metrics.
pub struct JobProcessor {
    self_weak: Weak<JobProcessor>,
    local: GridNode,
    cluster: Arc<dyn Cluster>,
    messenger: Arc<dyn Messenger>,
    deployments: Arc<dyn DeploymentRegistry>,
    cache_topology: Arc<dyn CacheTopology>,
    config: GridConfig,
    collision: Option<Arc<dyn CollisionPolicy>>,
    /// Priority attribute keys of the configured policy, if any.
    priority_keys: (Option<String>, Option<String>),
    interrupt_timeout: DistributedLongProperty,

    gate: StopGate,
    cancel_on_stop: AtomicBool,

    /// Jobs admitted but not yet activated. Present only with a collision
    /// policy; without one every job activates immediately.
    passive: Option<OrderedMap<JobId, Arc<JobWorker>>>,
    /// Jobs submitted to a pool or running.
    active: OrderedMap<JobId, Arc<JobWorker>>,
    /// Internal jobs running inline on the handler task.
    sync_running: Mutex<HashMap<JobId, Arc<JobWorker>>>,
    /// Jobs a cancel path has seen but whose worker has not acknowledged
    /// termination yet.
    cancelled: Mutex<HashMap<JobId, Arc<JobWorker>>>,
    held: Mutex<HashSet<JobId>>,
    finished: BoundedOrderedSet<JobId>,
    /// Job-or-session id of observed cancel requests, mapped to the
    /// system-initiated flag.
    cancel_reqs: BoundedOrderedMap<Uuid, bool>,

    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    metrics: SchedulerMetrics,
    metrics_update_cntr: AtomicUsize,
    topic_seq: AtomicU64,
    pools: Pools,
    cluster_listener_token: Mutex<Option<usize>>,
}

impl JobProcessor {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        messenger: Arc<dyn Messenger>,
        deployments: Arc<dyn DeploymentRegistry>,
        cache_topology: Arc<dyn CacheTopology>,
        config: GridConfig,
        collision: Option<Arc<dyn CollisionPolicy>>,
    ) -> Arc<Self> {
        let local = cluster.local_node();
        let history = config.jobs_history_size;
        let pools = Pools::from_config(&config);

        let priority_keys = collision
            .as_ref()
            .map(|p| p.priority_attribute_keys())
            .unwrap_or((None, None));

        // The passive queue only exists when a collision policy gates
        // activation.
        let passive = collision.as_ref().map(|_| OrderedMap::new());

        Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            local,
            cluster,
            messenger,
            deployments,
            cache_topology,
            config,
            priority_keys,
            interrupt_timeout: DistributedLongProperty::detached(
                COMPUTE_JOB_WORKER_INTERRUPT_TIMEOUT,
            ),
            collision,
            gate: StopGate::new(),
            cancel_on_stop: AtomicBool::new(false),
            passive,
            active: OrderedMap::new(),
            sync_running: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashMap::new()),
            held: Mutex::new(HashSet::new()),
            finished: BoundedOrderedSet::new(history),
            cancel_reqs: BoundedOrderedMap::new(history),
            sessions: Mutex::new(HashMap::new()),
            metrics: SchedulerMetrics::new(),
            metrics_update_cntr: AtomicUsize::new(0),
            topic_seq: AtomicU64::new(0),
            pools,
            cluster_listener_token: Mutex::new(None),
        })
    }

    /// Whether jobs bypass the passive queue entirely.
    fn job_always_activate(&self) -> bool {
        self.collision.is_none()
    }

    fn passive_map(&self) -> Option<&OrderedMap<JobId, Arc<JobWorker>>> {
        self.passive.as_ref()
    }

    pub fn local_node(&self) -> &GridNode {
        &self.local
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Runtime-updatable interrupt timeout property.
    pub fn interrupt_timeout_property(&self) -> &DistributedLongProperty {
        &self.interrupt_timeout
    }

    /// Interrupt timeout of workers after a cancel, falling back to the
    /// failure detection timeout.
    pub fn job_worker_interrupt_timeout(&self) -> u64 {
        self.interrupt_timeout
            .get_or_default(self.config.failure_detection_timeout_ms)
    }

    /// Install message listeners, subscribe to discovery events and hook
    /// up the collision policy.
    pub fn start(self: &Arc<Self>) {
        let listener: Arc<dyn MessageListener> = Arc::new(ProcessorMessageListener {
            processor: Arc::downgrade(self),
        });

        self.messenger.add_listener(Topic::Job, listener.clone());
        self.messenger
            .add_listener(Topic::JobCancel, listener.clone());
        self.messenger.add_listener(Topic::Task, listener);

        let token = self
            .cluster
            .add_event_listener(Arc::new(ProcessorDiscoveryListener {
                processor: Arc::downgrade(self),
            }));

        *self.cluster_listener_token.lock() = Some(token);

        if let Some(policy) = &self.collision {
            policy.set_external_listener(Arc::new(ProcessorExternalListener {
                processor: Arc::downgrade(self),
            }));
        }

        tracing::debug!(node = %self.local.id, "Job processor started");
    }

    /// Stop the processor. New requests are rejected once the gate seals;
    /// passive jobs are rejected outright, and with `cancel` set active
    /// jobs are cancelled. Waits for all tracked workers to finish.
    pub async fn stop(self: &Arc<Self>, cancel: bool) {
        self.messenger.remove_listener(&Topic::Job);
        self.messenger.remove_listener(&Topic::JobCancel);
        self.messenger.remove_listener(&Topic::Task);

        if let Some(policy) = &self.collision {
            policy.unset_external_listener();
        }

        self.cancel_on_stop.store(cancel, Ordering::SeqCst);

        self.gate.seal().await;

        if let Some(passive) = self.passive_map() {
            for worker in passive.values() {
                if self.remove_from_passive(&worker) {
                    self.reject_job(&worker, false);
                }
            }
        }

        if cancel {
            for worker in self.active.values() {
                worker.on_stopping();
                self.cancel_job_worker(&worker, false);
            }
        }

        let mut to_join = self.active.values();
        to_join.extend(self.cancelled.lock().values().cloned());

        for worker in to_join {
            worker.await_finished().await;
        }

        if let Some(token) = self.cluster_listener_token.lock().take() {
            self.cluster.remove_event_listener(token);
        }

        tracing::debug!(node = %self.local.id, "Job processor stopped");
    }

    // ---- execute-request processing (the hot path) ------------------------

    pub async fn process_execute_request(self: Arc<Self>, origin: NodeId, req: ExecuteRequest) {
        tracing::debug!(
            job_id = %req.job_id,
            session_id = %req.session_id,
            node = %origin,
            "Received job request message"
        );

        let Some(gate_guard) = self.gate.try_enter() else {
            tracing::debug!(
                job_id = %req.job_id,
                "Received job execution request while stopping this node (will ignore)"
            );
            return;
        };

        // Resolve the deployment: local-only, by identity, then by scanning
        // task deployments for a matching class loader id.
        let dep = if req.deployment.force_local {
            self.deployments.local_deployment(&req.deployment.task_class)
        } else {
            self.deployments.global_deployment(&req.deployment, origin)
        };

        let dep = dep.or_else(|| {
            self.deployments
                .task_deployments()
                .into_iter()
                .find(|d| d.class_loader_id() == req.deployment.class_loader_id)
        });

        let dep = match dep {
            Some(dep) if dep.acquire() => dep,
            _ => {
                let e = GridError::DeploymentMissing(format!(
                    "task_name={}, task_class={}, version={}, class_loader_id={}",
                    req.deployment.task_name,
                    req.deployment.task_class,
                    req.deployment.user_version,
                    req.deployment.class_loader_id,
                ));

                tracing::error!(job_id = %req.job_id, error = %e, "Deployment resolution failed");

                self.handle_request_error(origin, &req, &e);
                return;
            }
        };

        // From here on every error path must release the deployment; once
        // the worker exists, its finish path owns the release.
        let worker = match self.build_worker(origin, &req, &dep) {
            Ok(worker) => worker,
            Err(e) => {
                tracing::error!(
                    job_id = %req.job_id,
                    task_name = %req.deployment.task_name,
                    error = %e,
                    "Failed to deserialize task attributes"
                );

                self.handle_request_error(origin, &req, &e);
                dep.release();
                return;
            }
        };

        if !worker.initialize() {
            // Initialization failure finished the worker; the deployment
            // release happened on its listener path.
            return;
        }

        let mut run_inline: Option<Arc<JobWorker>> = None;

        if req.internal {
            // Internal jobs run on the handler task, inside the gate: they
            // are expected to be short and must not race the stop barrier.
            self.run_sync(worker).await;
        } else if self.job_always_activate() {
            if self.on_before_activate(&worker) {
                if origin == self.local.id {
                    // Local-origin jobs always go to a pool.
                    self.execute_async(worker);
                } else {
                    // The handler task is already an RPC thread; run the
                    // job inline after the gate is released.
                    self.metrics.job_started();
                    run_inline = Some(worker);
                }
            }
        } else {
            let passive = self.passive_map().expect("collision policy is configured");

            debug_assert!(!worker.is_internal());

            match passive.put_if_absent(worker.job_id(), worker.clone()) {
                None => {
                    self.metrics.waiting_incremented();
                    self.handle_collisions();
                }
                Some(_) => {
                    tracing::error!(
                        job_id = %req.job_id,
                        session_id = %req.session_id,
                        node = %origin,
                        "Received computation request with duplicate job ID (could be network \
                         malfunction, source node may hang if task timeout was not set)"
                    );
                }
            }
        }

        drop(gate_guard);

        if let Some(worker) = run_inline {
            worker.run().await;
        }
    }

    fn build_worker(
        self: &Arc<Self>,
        origin: NodeId,
        req: &ExecuteRequest,
        dep: &Arc<Deployment>,
    ) -> Result<Arc<JobWorker>> {
        let siblings = match &req.siblings {
            Some(payload) => Some(payload.decode(dep)?),
            None => None,
        };

        let session_attrs = match (&req.session_attrs, req.full_session_support) {
            (Some(payload), true) => payload.decode(dep)?,
            _ => AttributeMap::new(),
        };

        let topology_predicate = match &req.topology_predicate {
            Some(payload) => Some(payload.decode(dep)?),
            None => None,
        };

        let job_attrs = req.job_attrs.decode(dep)?;

        let shared_attrs = self.session_attrs_entry(req.session_id, session_attrs);

        let session = Arc::new(JobSession::new(
            req,
            siblings,
            shared_attrs,
            topology_predicate,
            origin,
        ));

        let context = Arc::new(JobContext::new(req.job_id, job_attrs));

        let reservation = req.reservation.clone().map(|spec| {
            Arc::new(PartitionReservation::new(self.cache_topology.clone(), spec))
        });

        let origin_node = self
            .cluster
            .node(origin)
            .unwrap_or(GridNode { id: origin, order: 0 });

        let processor = Arc::downgrade(self);
        let interrupt = Arc::downgrade(self);

        Ok(JobWorker::new(
            session,
            context,
            dep.clone(),
            origin_node,
            req.internal,
            req.created_at,
            reservation,
            Arc::new(move || {
                interrupt
                    .upgrade()
                    .map(|p| p.job_worker_interrupt_timeout())
                    .unwrap_or(crate::config::DEFAULT_FAILURE_DETECTION_TIMEOUT_MS)
            }),
            Arc::new(ProcessorJobListener {
                processor: processor.clone(),
            }),
            Arc::new(ProcessorHoldListener {
                processor,
            }),
            self.messenger.clone(),
            self.cluster.clone(),
            self.local.id,
        ))
    }

    /// Run an internal job inline, visible to introspection through the
    /// sync-running map.
    async fn run_sync(&self, worker: Arc<JobWorker>) {
        let job_id = worker.job_id();

        self.sync_running.lock().insert(job_id, worker.clone());

        worker.run().await;

        self.sync_running.lock().remove(&job_id);
    }

    /// Admission check right before activation. Returns `true` iff the job
    /// is still eligible to run.
    fn on_before_activate(self: &Arc<Self>, worker: &Arc<JobWorker>) -> bool {
        let job_id = worker.job_id();
        let session_id = worker.session().session_id;

        if let Some(old) = self.active.insert(job_id, worker.clone()) {
            tracing::warn!(job_id = %job_id, old = ?old, "Active jobs map already contained the job");
        }

        self.metrics.active_incremented();

        // A cancel request may have arrived before activation.
        let sys_cancelled = self
            .cancel_reqs
            .get(&session_id)
            .or_else(|| self.cancel_reqs.get(&job_id));

        if let Some(sys) = sys_cancelled {
            self.remove_from_active(worker);

            // Even if another thread already removed it, the job has never
            // run and must be rejected.
            worker.finish_job(
                None,
                Some(GridError::ExecutionRejected(format!(
                    "job was cancelled before execution [job_id={job_id}]"
                ))),
                !sys,
            );

            return false;
        }

        // Master aliveness check before the job gets a runner thread, for
        // proper master-leave handling.
        if self.cluster.node(worker.origin().id).is_none() && self.remove_from_active(worker) {
            self.cancelled.lock().insert(job_id, worker.clone());

            if !worker.master_node_left() {
                tracing::warn!(
                    job_id = %job_id,
                    "Job is being cancelled because master task node left grid (as there is \
                     no one waiting for results, job will not be failed over)"
                );

                self.cancel_job_worker(worker, true);
            }
        }

        true
    }

    /// Submit to the worker pool. Returns `false` if the pool rejected the
    /// job, in which case it has been finished with a rejection error.
    fn execute_async(self: &Arc<Self>, worker: Arc<JobWorker>) -> bool {
        let pool = self
            .pools
            .resolve(worker.session().executor.as_deref());

        if pool.submit(worker.clone()) {
            self.metrics.job_started();
            return true;
        }

        self.remove_from_active(&worker);
        self.metrics.job_rejected();

        tracing::warn!(job_id = %worker.job_id(), pool = ?pool.name, "Job has been rejected by the pool");

        worker.finish_job(
            None,
            Some(GridError::ExecutionRejected(format!(
                "job has been rejected by the executor pool [job_id={}]",
                worker.job_id()
            ))),
            true,
        );

        false
    }

    fn reject_job(self: &Arc<Self>, worker: &Arc<JobWorker>, send_reply: bool) {
        worker.finish_job(
            None,
            Some(GridError::ExecutionRejected(format!(
                "job was cancelled before execution [session_id={}, job_id={}]",
                worker.session().session_id,
                worker.job_id()
            ))),
            send_reply,
        );
    }

    fn cancel_job_worker(self: &Arc<Self>, worker: &Arc<JobWorker>, system: bool) {
        // Repeated cancels still re-signal the job, but only count once.
        if !worker.is_internal() && !worker.is_cancelled() {
            self.metrics.job_canceled();
        }

        worker.cancel(system);
    }

    fn remove_from_active(&self, worker: &JobWorker) -> bool {
        let job_id = worker.job_id();
        let removed = self
            .active
            .remove_if(&job_id, |w| std::ptr::eq(Arc::as_ptr(w), worker))
            .is_some();

        if removed {
            self.metrics.active_decremented();
            self.held.lock().remove(&job_id);
        }

        removed
    }

    fn remove_from_passive(&self, worker: &JobWorker) -> bool {
        let Some(passive) = self.passive_map() else {
            return false;
        };

        let removed = passive
            .remove_if(&worker.job_id(), |w| std::ptr::eq(Arc::as_ptr(w), worker))
            .is_some();

        if removed {
            self.metrics.waiting_decremented(worker.queued_time_ms());
        }

        removed
    }

    // ---- cancel-request processing ----------------------------------------

    pub fn process_cancel_request(self: &Arc<Self>, from: NodeId, req: CancelRequest) {
        tracing::debug!(
            session_id = ?req.session_id,
            job_id = ?req.job_id,
            node = %from,
            system = req.system,
            "Received job cancel request"
        );

        self.cancel_job(req.session_id, req.job_id, req.system);
    }

    /// Cancel by job id, session id, or both.
    pub fn cancel_job(
        self: &Arc<Self>,
        session_id: Option<SessionId>,
        job_id: Option<JobId>,
        system: bool,
    ) {
        if session_id.is_none() && job_id.is_none() {
            return;
        }

        // Cancellations are still honored during a stop that awaits
        // natural completion; only a cancelling stop ignores them.
        let _gate_guard = match self.gate.try_enter() {
            Some(guard) => Some(guard),
            None => {
                if self.cancel_on_stop.load(Ordering::SeqCst) {
                    tracing::debug!(
                        session_id = ?session_id,
                        job_id = ?job_id,
                        "Received job cancellation request while stopping grid with \
                         cancellation (will ignore)"
                    );
                    return;
                }

                None
            }
        };

        // Job and session ids share one uniqueness domain.
        self.cancel_reqs
            .put_if_absent(job_id.or(session_id).expect("one id is present"), system);

        let id_match = |w: &Arc<JobWorker>| -> bool {
            let ses_ok = session_id.map_or(true, |s| w.session().session_id == s);
            let job_ok = job_id.map_or(true, |j| w.job_id() == j);
            ses_ok && job_ok
        };

        match job_id {
            None => {
                if let Some(passive) = self.passive_map() {
                    for worker in passive.values() {
                        if id_match(&worker) {
                            self.cancel_passive_job(&worker);
                        }
                    }
                }

                for worker in self.active.values() {
                    if id_match(&worker) {
                        self.cancel_active_job(&worker, system);
                    }
                }

                let sync_running: Vec<_> = self.sync_running.lock().values().cloned().collect();

                for worker in sync_running {
                    if id_match(&worker) {
                        self.cancel_job_worker(&worker, system);
                    }
                }
            }
            Some(job_id) => {
                if let Some(passive) = self.passive_map() {
                    if let Some(worker) = passive.get(&job_id) {
                        if id_match(&worker) && self.cancel_passive_job(&worker) {
                            return;
                        }
                    }
                }

                if let Some(worker) = self.active.get(&job_id) {
                    if id_match(&worker) {
                        self.cancel_active_job(&worker, system);
                        return;
                    }
                }

                let worker = self.sync_running.lock().get(&job_id).cloned();

                if let Some(worker) = worker {
                    if id_match(&worker) {
                        self.cancel_job_worker(&worker, system);
                    }
                }
            }
        }
    }

    /// Cancel a job that never activated. No response is sent; the
    /// cancelled counter is bumped.
    fn cancel_passive_job(self: &Arc<Self>, worker: &Arc<JobWorker>) -> bool {
        if self.remove_from_passive(worker) {
            tracing::debug!(job_id = %worker.job_id(), "Job has been cancelled before activation");

            self.metrics.job_canceled();
            self.reject_job(worker, false);

            return true;
        }

        false
    }

    fn cancel_active_job(self: &Arc<Self>, worker: &Arc<JobWorker>, system: bool) {
        if self.remove_from_active(worker) {
            let job_id = worker.job_id();

            self.cancelled.lock().insert(job_id, worker.clone());

            if self.finished.contains(&job_id) {
                // The job finished concurrently; drop the entry to avoid a
                // leak.
                self.cancelled.lock().remove(&job_id);
            } else {
                self.cancel_job_worker(worker, system);
            }
        }
    }

    // ---- collision handling -----------------------------------------------

    /// Run one collision pass over the current passive/active/held views.
    /// Recursive passes on the same thread are suppressed.
    pub fn handle_collisions(self: &Arc<Self>) {
        let Some(policy) = self.collision.clone() else {
            return;
        };

        if HANDLING_COLLISIONS.with(|h| h.get()) {
            tracing::debug!("Skipping recursive collision handling");
            return;
        }

        HANDLING_COLLISIONS.with(|h| h.set(true));

        let passive_view: Vec<CollisionJobContext> = self
            .passive_map()
            .map(|m| m.values())
            .unwrap_or_default()
            .into_iter()
            .map(|w| CollisionJobContext::new(self.clone(), w, true))
            .collect();

        let mut active_view = Vec::new();
        let mut held_view = Vec::new();

        for worker in self.active.values() {
            debug_assert!(!worker.is_internal());

            let ctx = CollisionJobContext::new(self.clone(), worker.clone(), false);

            if worker.held() {
                held_view.push(ctx);
            } else {
                active_view.push(ctx);
            }
        }

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            policy.on_collision(&passive_view, &active_view, &held_view);
        }));

        if let Err(e) = outcome {
            // Policy errors never bubble out of the pass.
            tracing::error!(error = ?e, "Collision policy failed");
        }

        HANDLING_COLLISIONS.with(|h| h.set(false));
    }

    /// Activation path used by collision contexts.
    pub(super) fn activate_from_collision(self: &Arc<Self>, worker: &Arc<JobWorker>) -> bool {
        self.remove_from_passive(worker)
            && self.on_before_activate(worker)
            && self.execute_async(worker.clone())
    }

    /// Cancellation path used by collision contexts.
    pub(super) fn cancel_from_collision(
        self: &Arc<Self>,
        worker: &Arc<JobWorker>,
        passive: bool,
    ) -> bool {
        self.cancel_reqs.put_if_absent(worker.job_id(), false);

        if passive {
            if self.remove_from_passive(worker) {
                self.reject_job(worker, true);
                self.metrics.job_rejected();
                return true;
            }

            return false;
        }

        if self.remove_from_active(worker) {
            let job_id = worker.job_id();

            self.cancelled.lock().insert(job_id, worker.clone());

            if self.finished.contains(&job_id) {
                self.cancelled.lock().remove(&job_id);
            } else {
                self.cancel_job_worker(worker, false);
            }

            return true;
        }

        false
    }

    // ---- session attributes and siblings ----------------------------------

    /// Send a session attribute update back to the task originator on the
    /// ordered channel.
    pub fn set_session_attributes(&self, session: &JobSession, attrs: AttributeMap) -> Result<()> {
        debug_assert!(session.full_support);

        let remaining = session.remaining_time_ms();

        if remaining <= 0 {
            tracing::warn!(
                session_id = %session.session_id,
                "Task execution timed out (remote session attributes won't be set)"
            );
            return Ok(());
        }

        if self.cluster.node(session.origin).is_none() {
            return Err(GridError::NodeLeft(session.origin));
        }

        session.merge_attributes(attrs.clone());

        self.messenger.send_ordered(
            session.origin,
            session.job_topic(self.local.id),
            Message::SessionAttrs(SessionAttrRequest {
                session_id: session.session_id,
                job_id: session.job_id,
                attrs: crate::scheduler::job::Payload::Inline(attrs),
            }),
            remaining as u64,
        )
    }

    /// Handle an incoming session attribute update for jobs of this node.
    pub fn process_session_attr_request(self: &Arc<Self>, from: NodeId, req: SessionAttrRequest) {
        let Some(_gate_guard) = self.gate.try_enter() else {
            tracing::debug!(
                session_id = %req.session_id,
                "Received job session request while stopping grid (will ignore)"
            );
            return;
        };

        let attrs = match req.attrs.decode_plain() {
            Ok(attrs) => attrs,
            Err(e) => {
                tracing::error!(
                    session_id = %req.session_id,
                    node = %from,
                    error = %e,
                    "Failed to deserialize session attributes"
                );
                return;
            }
        };

        let shared = self
            .sessions
            .lock()
            .get(&req.session_id)
            .map(|e| e.attrs.clone());

        let Some(shared) = shared else {
            tracing::debug!(
                session_id = %req.session_id,
                "Received job session request for non-existing session"
            );
            return;
        };

        shared.lock().extend(attrs.clone());

        self.on_change_task_attributes(req.session_id, req.job_id, &attrs);
    }

    /// Re-run the collision pass when a priority attribute of a passive
    /// job changed.
    fn on_change_task_attributes(self: &Arc<Self>, _session_id: SessionId, job_id: JobId, attrs: &AttributeMap) {
        let (task_key, job_key) = &self.priority_keys;

        if self.job_always_activate() || (task_key.is_none() && job_key.is_none()) {
            return;
        }

        let Some(worker) = self.passive_map().and_then(|m| m.get(&job_id)) else {
            return;
        };

        let mut rerun = false;

        if let Some(task_key) = task_key {
            if let Some(value) = attrs.get(task_key) {
                if let Some(job_key) = job_key {
                    // Task priority propagates to the job priority slot.
                    worker
                        .session()
                        .merge_attributes(AttributeMap::from([(job_key.clone(), value.clone())]));
                }

                rerun = true;
            }
        }

        if !rerun {
            if let Some(job_key) = job_key {
                rerun = attrs.contains_key(job_key);
            }
        }

        if rerun {
            self.handle_collisions();
        }
    }

    /// Request the sibling list of a session from the task originator and
    /// wait for the reply, watching for the originator's departure.
    pub async fn request_job_siblings(
        self: &Arc<Self>,
        session: &JobSession,
    ) -> Result<Vec<JobSibling>> {
        let origin = session.origin;

        if self.cluster.node(origin).is_none() {
            return Err(GridError::NodeLeft(origin));
        }

        let seq = self.topic_seq.fetch_add(1, Ordering::SeqCst);
        let topic = Topic::SiblingsReply {
            session_id: session.session_id,
            seq,
        };

        let (tx, rx) = oneshot::channel::<Result<Vec<JobSibling>>>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        self.messenger.add_listener(
            topic.clone(),
            Arc::new(SiblingsReplyListener {
                origin,
                tx: tx.clone(),
            }),
        );

        let disco_token = self.cluster.add_event_listener(Arc::new(SiblingsDiscoListener {
            origin,
            tx: tx.clone(),
        }));

        let result = async {
            self.messenger.send_unordered(
                origin,
                Topic::JobSiblings,
                Message::Siblings(SiblingsRequest {
                    session_id: session.session_id,
                    reply_topic: topic.clone(),
                }),
            )?;

            // The node may have left before the listener was installed.
            if self.cluster.node(origin).is_none() {
                return Err(GridError::NodeLeft(origin));
            }

            let timeout = std::time::Duration::from_millis(self.config.network_timeout_ms);

            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => Err(GridError::Internal(
                    "sibling response channel closed".to_string(),
                )),
                Err(_) => Err(GridError::Internal(format!(
                    "timed out waiting for job siblings (consider increasing 'network_timeout_ms' \
                     configuration property) [session_id={}]",
                    session.session_id
                ))),
            }
        }
        .await;

        self.messenger.remove_listener(&topic);
        self.cluster.remove_event_listener(disco_token);

        result
    }

    /// Invoke the master-leave hook on all active jobs of a session.
    pub fn master_leave_local(&self, session_id: SessionId) {
        for worker in self.active.values() {
            if worker.session().session_id == session_id {
                worker.master_node_left();
            }
        }
    }

    // ---- discovery events -------------------------------------------------

    fn on_node_gone(self: &Arc<Self>, node: NodeId) {
        if let Some(passive) = self.passive_map() {
            for worker in passive.values() {
                if worker.origin().id == node && self.remove_from_passive(&worker) {
                    tracing::warn!(
                        job_id = %worker.job_id(),
                        node = %node,
                        "Task node left grid (job will not be activated)"
                    );
                }
            }
        }

        for worker in self.active.values() {
            if worker.origin().id == node
                && !worker.is_finishing()
                && self.remove_from_active(&worker)
            {
                let job_id = worker.job_id();

                self.cancelled.lock().insert(job_id, worker.clone());

                if self.finished.contains(&job_id) {
                    self.cancelled.lock().remove(&job_id);
                } else if !worker.master_node_left() {
                    tracing::warn!(
                        job_id = %job_id,
                        node = %node,
                        "Job is being cancelled because master task node left grid (as there \
                         is no one waiting for results, job will not be failed over)"
                    );

                    self.cancel_job_worker(&worker, true);
                }
            }
        }

        self.collision_pass_under_gate();
    }

    fn on_metrics_updated(self: &Arc<Self>) {
        let nodes = self.cluster.all_nodes().len();
        let cntr = self.metrics_update_cntr.fetch_add(1, Ordering::SeqCst) + 1;

        // Less-than-equal rather than just equal, to guard against
        // topology changes.
        if nodes <= cntr {
            self.metrics_update_cntr.store(0, Ordering::SeqCst);
            self.collision_pass_under_gate();
        }
    }

    fn collision_pass_under_gate(self: &Arc<Self>) {
        if self.job_always_activate() {
            return;
        }

        let Some(_gate_guard) = self.gate.try_enter() else {
            tracing::debug!("Skipped collision handling (node is stopping)");
            return;
        };

        self.handle_collisions();
    }

    // ---- worker lifecycle callbacks ---------------------------------------

    fn on_worker_queued(&self, worker: &JobWorker) {
        if worker.session().full_support {
            // Session attribute requests for this job arrive on its own
            // topic to keep their order against the result.
            let listener: Arc<dyn MessageListener> = Arc::new(ProcessorMessageListener {
                processor: self.self_weak.clone(),
            });

            self.messenger
                .add_listener(worker.session().job_topic(self.local.id), listener);
        }
    }

    fn on_worker_started(&self, worker: &JobWorker) {
        tracing::debug!(job_id = %worker.job_id(), "Job execution started");
    }

    fn on_worker_before_response(&self, worker: &JobWorker) {
        debug_assert!(
            self.passive_map()
                .map(|m| !m.contains_key(&worker.job_id()))
                .unwrap_or(true),
            "job finishing while still passive"
        );

        if worker.session().full_support {
            self.messenger
                .remove_listener(&worker.session().job_topic(self.local.id));
        }
    }

    fn on_worker_finished(self: &Arc<Self>, worker: &JobWorker) {
        tracing::debug!(job_id = %worker.job_id(), "Job execution finished");

        let job_id = worker.job_id();
        let session = worker.session();
        let last_of_session = self.release_session(session.session_id);

        if session.full_support && last_of_session {
            session.on_closed();
        }

        self.finished.add(job_id);

        if worker.is_internal() {
            return;
        }

        self.metrics.job_finished(worker.execute_time_ms());

        tracing::debug!(
            job_id = %job_id,
            session_id = %session.session_id,
            queued_ms = worker.queued_time_ms(),
            execute_ms = worker.execute_time_ms(),
            timed_out = worker.is_timed_out(),
            "Job statistics recorded"
        );

        if self.job_always_activate() {
            if !self.remove_from_active(worker) {
                self.cancelled.lock().remove(&job_id);
            }

            self.held.lock().remove(&job_id);
            return;
        }

        let Some(_gate_guard) = self.gate.try_enter() else {
            tracing::debug!("Skipping collision handling on job finish (node is stopping)");
            return;
        };

        if !self.remove_from_active(worker) {
            self.cancelled.lock().remove(&job_id);
        }

        self.held.lock().remove(&job_id);

        self.handle_collisions();
    }

    fn on_worker_held(&self, worker: &JobWorker) -> bool {
        tracing::debug!(job_id = %worker.job_id(), "Received job hold callback");

        if worker.is_internal() {
            return true;
        }

        let job_id = worker.job_id();

        if !self.active.contains_key(&job_id) {
            return false;
        }

        let added = self.held.lock().insert(job_id);

        // The job may have finished between the check and the insert.
        if !self.active.contains_key(&job_id) {
            self.held.lock().remove(&job_id);
            return false;
        }

        added
    }

    fn on_worker_unheld(&self, worker: &JobWorker) -> bool {
        tracing::debug!(job_id = %worker.job_id(), "Received job unhold callback");

        if worker.is_internal() {
            return true;
        }

        self.held.lock().remove(&worker.job_id())
    }

    // ---- sessions ---------------------------------------------------------

    fn session_attrs_entry(
        &self,
        session_id: SessionId,
        seed: AttributeMap,
    ) -> Arc<Mutex<AttributeMap>> {
        let mut sessions = self.sessions.lock();

        let entry = sessions.entry(session_id).or_insert_with(|| SessionEntry {
            attrs: Arc::new(Mutex::new(seed)),
            jobs: 0,
        });

        entry.jobs += 1;
        entry.attrs.clone()
    }

    /// Returns `true` when the last job of the session finished here.
    fn release_session(&self, session_id: SessionId) -> bool {
        let mut sessions = self.sessions.lock();

        if let Some(entry) = sessions.get_mut(&session_id) {
            entry.jobs = entry.jobs.saturating_sub(1);

            if entry.jobs == 0 {
                sessions.remove(&session_id);
                return true;
            }
        }

        false
    }

    // ---- error replies ----------------------------------------------------

    /// Report an error that happened before a worker existed back to the
    /// originator.
    fn handle_request_error(&self, origin: NodeId, req: &ExecuteRequest, error: &GridError) {
        if self.cluster.node(origin).is_none() {
            // Job reply failed: the original task node left the grid.
            tracing::warn!(
                job_id = %req.job_id,
                node = %origin,
                "Failed to reply to sender node because it left grid"
            );
            return;
        }

        let response = ExecuteResponse {
            node: self.local.id,
            session_id: req.session_id,
            job_id: req.job_id,
            result: None,
            error: Some(JobFailure::from(error)),
            attributes: None,
            cancelled: false,
        };

        let send_result = if req.full_session_support {
            let end_time = crate::scheduler::job::end_time_millis(req.created_at, req.timeout_ms);
            let timeout = (end_time - chrono::Utc::now().timestamp_millis()).max(1) as u64;

            self.messenger.send_ordered(
                origin,
                Topic::TaskResult {
                    job_id: req.job_id,
                    node: self.local.id,
                },
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
                    job_id = %req.job_id,
                    node = %origin,
                    "Failed to reply to sender node because it left grid"
                );
            } else {
                tracing::error!(
                    job_id = %req.job_id,
                    node = %origin,
                    error = %e,
                    "Error sending reply for job"
                );
            }
        }
    }

    // ---- introspection ----------------------------------------------------

    /// Currently active worker for the job, if any.
    pub fn active_job(&self, job_id: JobId) -> Option<Arc<JobWorker>> {
        self.active.get(&job_id)
    }

    /// Whether the job finished within the bounded history window.
    pub fn recently_finished(&self, job_id: JobId) -> bool {
        self.finished.contains(&job_id)
    }

    /// The recorded system flag of a cancel request for the id, if one was
    /// observed within the bounded window.
    pub fn cancel_request(&self, id: &Uuid) -> Option<bool> {
        self.cancel_reqs.get(id)
    }

    /// Flattened read-only view over all tracked jobs.
    pub fn jobs_view(&self) -> Vec<JobView> {
        let held = self.held.lock().clone();

        let view_of = |worker: &Arc<JobWorker>, state: JobViewState| JobView {
            job_id: worker.job_id(),
            session_id: worker.session().session_id,
            task_name: worker.session().task_name.clone(),
            origin: worker.origin().id,
            state,
            executor: worker.session().executor.clone(),
            held: held.contains(&worker.job_id()),
        };

        let mut views = Vec::new();

        for worker in self.active.values() {
            views.push(view_of(&worker, JobViewState::Active));
        }

        for worker in self.sync_running.lock().values() {
            views.push(view_of(worker, JobViewState::Active));
        }

        if let Some(passive) = self.passive_map() {
            for worker in passive.values() {
                views.push(view_of(&worker, JobViewState::Passive));
            }
        }

        for worker in self.cancelled.lock().values() {
            views.push(view_of(worker, JobViewState::Cancelled));
        }

        views
    }

    /// Per-status job counts for one session, across all maps.
    pub fn job_statuses(&self, session_id: SessionId) -> HashMap<WorkerStatus, usize> {
        let mut counts = HashMap::new();

        let mut workers = self.active.values();

        if let Some(passive) = self.passive_map() {
            workers.extend(passive.values());
        }

        workers.extend(self.cancelled.lock().values().cloned());

        for worker in workers {
            if worker.session().session_id == session_id {
                *counts.entry(worker.status()).or_insert(0) += 1;
            }
        }

        counts
    }
}

// ---- listener adapters ----------------------------------------------------

struct ProcessorMessageListener {
    processor: Weak<JobProcessor>,
}

impl MessageListener for ProcessorMessageListener {
    fn on_message(&self, from: NodeId, msg: Message) {
        let Some(processor) = self.processor.upgrade() else {
            return;
        };

        match msg {
            Message::Execute(req) => {
                if !processor.cluster.is_alive(from) {
                    tracing::warn!(
                        node = %from,
                        "Received job request message from unknown node (ignoring)"
                    );
                    return;
                }

                tokio::spawn(processor.process_execute_request(from, req));
            }
            Message::Cancel(req) => processor.process_cancel_request(from, req),
            Message::SessionAttrs(req) => processor.process_session_attr_request(from, req),
            other => {
                tracing::debug!(message = ?other, "Ignoring message not addressed to the job processor");
            }
        }
    }
}

struct ProcessorDiscoveryListener {
    processor: Weak<JobProcessor>,
}

impl ClusterEventListener for ProcessorDiscoveryListener {
    fn on_event(&self, event: &ClusterEvent) {
        let Some(processor) = self.processor.upgrade() else {
            return;
        };

        // Node departures are processed even while stopping: a stop
        // without cancel waits for jobs whose originator may be gone.
        match event {
            ClusterEvent::NodeLeft(node) | ClusterEvent::NodeFailed(node) => {
                processor.on_node_gone(*node);
            }
            ClusterEvent::NodeMetricsUpdated(_) => processor.on_metrics_updated(),
        }
    }
}

struct ProcessorExternalListener {
    processor: Weak<JobProcessor>,
}

impl CollisionExternalListener for ProcessorExternalListener {
    fn on_external_collision(&self) {
        let Some(processor) = self.processor.upgrade() else {
            return;
        };

        tracing::debug!("Received external collision event");

        processor.collision_pass_under_gate();
    }
}

struct ProcessorJobListener {
    processor: Weak<JobProcessor>,
}

impl JobEventListener for ProcessorJobListener {
    fn on_job_queued(&self, worker: &JobWorker) {
        if let Some(p) = self.processor.upgrade() {
            p.on_worker_queued(worker);
        }
    }

    fn on_job_started(&self, worker: &JobWorker) {
        if let Some(p) = self.processor.upgrade() {
            p.on_worker_started(worker);
        }
    }

    fn on_before_response_sent(&self, worker: &JobWorker) {
        if let Some(p) = self.processor.upgrade() {
            p.on_worker_before_response(worker);
        }
    }

    fn on_job_finished(&self, worker: &JobWorker) {
        if let Some(p) = self.processor.upgrade() {
            p.on_worker_finished(worker);
        }
    }
}

struct ProcessorHoldListener {
    processor: Weak<JobProcessor>,
}

impl JobHoldListener for ProcessorHoldListener {
    fn on_held(&self, worker: &JobWorker) -> bool {
        self.processor
            .upgrade()
            .map(|p| p.on_worker_held(worker))
            .unwrap_or(false)
    }

    fn on_unheld(&self, worker: &JobWorker) -> bool {
        self.processor
            .upgrade()
            .map(|p| p.on_worker_unheld(worker))
            .unwrap_or(false)
    }
}

struct SiblingsReplyListener {
    origin: NodeId,
    tx: Arc<Mutex<Option<oneshot::Sender<Result<Vec<JobSibling>>>>>>,
}

impl MessageListener for SiblingsReplyListener {
    fn on_message(&self, from: NodeId, msg: Message) {
        let outcome = if from != self.origin {
            Err(GridError::Internal(format!(
                "received job siblings response from unexpected node [expected={}, node={from}]",
                self.origin
            )))
        } else {
            match msg {
                Message::SiblingsReply(SiblingsResponse { siblings, .. }) => Ok(siblings),
                other => Err(GridError::Internal(format!(
                    "received unexpected message instead of siblings response: {other:?}"
                ))),
            }
        };

        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(outcome);
        }
    }
}

struct SiblingsDiscoListener {
    origin: NodeId,
    tx: Arc<Mutex<Option<oneshot::Sender<Result<Vec<JobSibling>>>>>>,
}

impl ClusterEventListener for SiblingsDiscoListener {
    fn on_event(&self, event: &ClusterEvent) {
        if !matches!(
            event,
            ClusterEvent::NodeLeft(_) | ClusterEvent::NodeFailed(_)
        ) {
            return;
        }

        if event.node_id() == self.origin {
            if let Some(tx) = self.tx.lock().take() {
                let _ = tx.send(Err(GridError::NodeLeft(self.origin)));
            }
        }
    }
}
