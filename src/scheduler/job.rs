use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::cluster::NodeId;
use crate::deployment::DeploymentMeta;
use crate::error::{GridError, Result};
use crate::messenger::Topic;

pub type JobId = uuid::Uuid;
pub type SessionId = uuid::Uuid;

/// Marshalled job result.
pub type JobResult = Value;

pub type AttributeMap = HashMap<String, Value>;

/// Arguments handed to the job factory when instantiating a job.
pub type JobArgs = AttributeMap;

/// A value that either travelled inline (local or pre-decoded) or still as
/// bytes that must be decoded with the resolved deployment's codec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload<T> {
    Inline(T),
    Encoded(Vec<u8>),
}

impl<T: Clone + serde::de::DeserializeOwned> Payload<T> {
    /// Decode with the given codec-owning deployment.
    pub fn decode(&self, dep: &crate::deployment::Deployment) -> Result<T> {
        match self {
            Self::Inline(v) => Ok(v.clone()),
            Self::Encoded(bytes) => dep.decode(bytes),
        }
    }

    /// Decode without a deployment, for payloads of already-running
    /// sessions.
    pub fn decode_plain(&self) -> Result<T> {
        match self {
            Self::Inline(v) => Ok(v.clone()),
            Self::Encoded(bytes) => serde_json::from_slice(bytes)
                .map_err(|e| GridError::DeserializationFailed(e.to_string())),
        }
    }
}

/// One job of a fanned-out task, as seen by its siblings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSibling {
    pub job_id: JobId,
    pub node: NodeId,
}

/// Node filter a task was mapped with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyPredicate {
    pub allowed: Vec<NodeId>,
}

/// Cache partitions a job needs reserved for its duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub cache_ids: Vec<i32>,
    pub partition: u32,
    pub topology_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub session_id: SessionId,
    pub job_id: JobId,
    pub deployment: DeploymentMeta,
    pub created_at: DateTime<Utc>,
    /// Zero means no timeout.
    pub timeout_ms: u64,
    pub topology_version: u64,
    /// `None` when the task uses dynamic sibling resolution.
    pub siblings: Option<Payload<Vec<JobSibling>>>,
    /// Present only with full session support.
    pub session_attrs: Option<Payload<AttributeMap>>,
    pub job_attrs: Payload<AttributeMap>,
    pub topology_predicate: Option<Payload<TopologyPredicate>>,
    /// Named executor pool, or the default pool when `None`.
    pub executor: Option<String>,
    pub reservation: Option<PartitionSpec>,
    pub internal: bool,
    pub full_session_support: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub session_id: Option<SessionId>,
    pub job_id: Option<JobId>,
    /// System-initiated cancels suppress the reply.
    pub system: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionAttrRequest {
    pub session_id: SessionId,
    pub job_id: JobId,
    pub attrs: Payload<AttributeMap>,
}

/// Failure description that travels in responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    DeploymentMissing,
    DeserializationFailed,
    ExecutionRejected,
    PartitionsLost,
    Timeout,
    Internal,
}

impl From<&GridError> for JobFailure {
    fn from(e: &GridError) -> Self {
        let kind = match e {
            GridError::DeploymentMissing(_) => FailureKind::DeploymentMissing,
            GridError::DeserializationFailed(_) => FailureKind::DeserializationFailed,
            GridError::ExecutionRejected(_) => FailureKind::ExecutionRejected,
            GridError::PartitionsLost(_) => FailureKind::PartitionsLost,
            GridError::Timeout(_) => FailureKind::Timeout,
            _ => FailureKind::Internal,
        };

        Self {
            kind,
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    /// Node that executed (or rejected) the job.
    pub node: NodeId,
    pub session_id: SessionId,
    pub job_id: JobId,
    pub result: Option<JobResult>,
    pub error: Option<JobFailure>,
    /// Session attributes sent back with full session support.
    pub attributes: Option<AttributeMap>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiblingsRequest {
    pub session_id: SessionId,
    pub reply_topic: Topic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiblingsResponse {
    pub session_id: SessionId,
    pub siblings: Vec<JobSibling>,
}

/// End time of a job, clamped on overflow.
pub fn end_time_millis(created_at: DateTime<Utc>, timeout_ms: u64) -> i64 {
    if timeout_ms == 0 {
        return i64::MAX;
    }

    let timeout = i64::try_from(timeout_ms).unwrap_or(i64::MAX);

    created_at
        .timestamp_millis()
        .checked_add(timeout)
        .unwrap_or(i64::MAX)
}

/// The shared context of one task as seen by one of its jobs on this node.
///
/// Attributes are shared between all jobs of the session running here, so
/// an incoming attribute update is visible to every one of them.
pub struct JobSession {
    pub session_id: SessionId,
    pub job_id: JobId,
    pub task_name: String,
    pub task_class: String,
    pub origin: NodeId,
    pub start_time: DateTime<Utc>,
    /// Epoch millis; `i64::MAX` means no deadline.
    pub end_time_ms: i64,
    pub full_support: bool,
    pub internal: bool,
    pub executor: Option<String>,
    pub topology_predicate: Option<TopologyPredicate>,
    siblings: Mutex<Option<Vec<JobSibling>>>,
    attrs: Arc<Mutex<AttributeMap>>,
    closed: AtomicBool,
}

impl JobSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        req: &ExecuteRequest,
        siblings: Option<Vec<JobSibling>>,
        attrs: Arc<Mutex<AttributeMap>>,
        topology_predicate: Option<TopologyPredicate>,
        origin: NodeId,
    ) -> Self {
        Self {
            session_id: req.session_id,
            job_id: req.job_id,
            task_name: req.deployment.task_name.clone(),
            task_class: req.deployment.task_class.clone(),
            origin,
            start_time: req.created_at,
            end_time_ms: end_time_millis(req.created_at, req.timeout_ms),
            full_support: req.full_session_support,
            internal: req.internal,
            executor: req.executor.clone(),
            topology_predicate,
            siblings: Mutex::new(siblings),
            attrs,
            closed: AtomicBool::new(false),
        }
    }

    pub fn siblings(&self) -> Option<Vec<JobSibling>> {
        self.siblings.lock().clone()
    }

    pub fn set_siblings(&self, siblings: Vec<JobSibling>) {
        *self.siblings.lock() = Some(siblings);
    }

    pub fn attributes(&self) -> AttributeMap {
        self.attrs.lock().clone()
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attrs.lock().get(key).cloned()
    }

    pub fn merge_attributes(&self, attrs: AttributeMap) {
        self.attrs.lock().extend(attrs);
    }

    /// Milliseconds until the session deadline; negative when expired.
    pub fn remaining_time_ms(&self) -> i64 {
        if self.end_time_ms == i64::MAX {
            return i64::MAX;
        }

        self.end_time_ms - Utc::now().timestamp_millis()
    }

    /// Reply topic of this job, derived from the job id and the executing
    /// node.
    pub fn job_topic(&self, local: NodeId) -> Topic {
        Topic::TaskResult {
            job_id: self.job_id,
            node: local,
        }
    }

    pub fn on_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for JobSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSession")
            .field("session_id", &self.session_id)
            .field("job_id", &self.job_id)
            .field("task_name", &self.task_name)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Hook through which a job context reaches its worker.
pub trait JobHoldSupport: Send + Sync {
    /// Suspend the job. Returns `false` if the job can no longer be held.
    fn hold(&self) -> bool;

    /// Resume a held job. Returns `false` if it was not held.
    fn unhold(&self) -> bool;
}

/// Per-job execution context handed to user code.
pub struct JobContext {
    pub job_id: JobId,
    attrs: Mutex<AttributeMap>,
    cancel_token: CancellationToken,
    worker: Mutex<Option<Weak<dyn JobHoldSupport>>>,
}

impl JobContext {
    pub fn new(job_id: JobId, attrs: AttributeMap) -> Self {
        Self {
            job_id,
            attrs: Mutex::new(attrs),
            cancel_token: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn bind_worker(&self, worker: Weak<dyn JobHoldSupport>) {
        *self.worker.lock() = Some(worker);
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attrs.lock().get(key).cloned()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: Value) {
        self.attrs.lock().insert(key.into(), value);
    }

    pub fn attributes(&self) -> AttributeMap {
        self.attrs.lock().clone()
    }

    /// Cooperative cancellation signal for the running job.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Voluntarily suspend while waiting on an async dependency. While
    /// held the job does not count against scheduler concurrency.
    pub fn hold(&self) -> bool {
        match self.worker.lock().as_ref().and_then(Weak::upgrade) {
            Some(worker) => worker.hold(),
            None => false,
        }
    }

    /// Resume after [`hold`](Self::hold).
    pub fn unhold(&self) -> bool {
        match self.worker.lock().as_ref().and_then(Weak::upgrade) {
            Some(worker) => worker.unhold(),
            None => false,
        }
    }
}

pub type JobFuture = Pin<Box<dyn Future<Output = Result<JobResult>> + Send>>;

/// A unit of computation executed by a [`JobWorker`](super::worker::JobWorker).
///
/// `execute` should watch `ctx.cancel_token()` at blocking points; jobs
/// that ignore it are interrupted after the configured timeout.
pub trait ComputeJob: Send + Sync {
    fn execute(&self, ctx: Arc<JobContext>) -> JobFuture;

    /// Cooperative cancel hook, called once when the job is cancelled.
    fn cancel(&self) {}

    /// Called when the originating node left. Returning `true` promises
    /// the job will terminate on its own; otherwise it is cancelled.
    fn on_master_leave(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_time_clamps_on_overflow() {
        let now = Utc::now();

        assert_eq!(end_time_millis(now, 0), i64::MAX);
        assert_eq!(end_time_millis(now, u64::MAX), i64::MAX);

        let finite = end_time_millis(now, 5_000);
        assert_eq!(finite, now.timestamp_millis() + 5_000);
    }

    #[test]
    fn test_session_attributes_are_shared() {
        let attrs = Arc::new(Mutex::new(AttributeMap::new()));
        attrs.lock().insert("k".to_string(), Value::from(1));

        let other = attrs.clone();
        other.lock().insert("k2".to_string(), Value::from(2));

        assert_eq!(attrs.lock().len(), 2);
    }
}
