//! Test harness for in-process grid nodes.
//!
//! Wires one or more job-processor nodes and a client (task originator)
//! node through a shared [`LocalExchange`], with per-node static clusters
//! kept in sync by the harness.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use grid_lite::cluster::{NodeId, StaticCluster};
use grid_lite::config::GridConfig;
use grid_lite::deployment::{
    Deployment, DeploymentMeta, DeploymentMode, InMemoryDeploymentRegistry, JobFactory,
};
use grid_lite::error::{GridError, Result};
use grid_lite::messenger::{
    LocalExchange, LocalMessenger, Message, MessageListener, Messenger, Topic,
};
use grid_lite::scheduler::job::{
    ComputeJob, ExecuteRequest, ExecuteResponse, JobArgs, JobContext, JobFuture, JobId, JobSibling,
    Payload, SessionAttrRequest, SiblingsRequest, SiblingsResponse,
};
use grid_lite::scheduler::reservation::AllOwningTopology;
use grid_lite::scheduler::{CollisionPolicy, JobProcessor};

pub const TEST_TASK_CLASS: &str = "test.ControlledJob";

/// Behavior knobs and observation points shared between the test and the
/// job instances its requests spawn.
#[derive(Default)]
pub struct JobControl {
    /// Job ids whose user code actually ran.
    pub executed: Mutex<Vec<JobId>>,
    /// Wakes jobs parked in `hold` mode.
    pub proceed: Notify,
}

/// Job driven by its `mode` attribute:
/// - `sleep`: sleep `delay_ms`, return the `payload` attribute;
/// - `block`: wait for cancellation, then fail;
/// - `hold`: hold the worker, wait for [`JobControl::proceed`], unhold,
///   return the payload.
struct ControlledJob {
    control: Arc<JobControl>,
    mode: String,
    delay_ms: u64,
    payload: serde_json::Value,
}

impl ComputeJob for ControlledJob {
    fn execute(&self, ctx: Arc<JobContext>) -> JobFuture {
        let control = self.control.clone();
        let mode = self.mode.clone();
        let delay_ms = self.delay_ms;
        let payload = self.payload.clone();

        Box::pin(async move {
            control.executed.lock().push(ctx.job_id);

            match mode.as_str() {
                "block" => {
                    ctx.cancel_token().cancelled().await;
                    Err(GridError::ExecutionRejected("job was cancelled".to_string()))
                }
                "hold" => {
                    assert!(ctx.hold());
                    control.proceed.notified().await;
                    assert!(ctx.unhold());
                    Ok(payload)
                }
                _ => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => Ok(payload),
                        _ = ctx.cancel_token().cancelled() => {
                            Err(GridError::ExecutionRejected("job was cancelled".to_string()))
                        }
                    }
                }
            }
        })
    }
}

struct ControlledJobFactory {
    control: Arc<JobControl>,
}

impl JobFactory for ControlledJobFactory {
    fn create(&self, task_class: &str, args: &JobArgs) -> Result<Arc<dyn ComputeJob>> {
        if task_class != TEST_TASK_CLASS {
            return Err(GridError::DeploymentMissing(task_class.to_string()));
        }

        Ok(Arc::new(ControlledJob {
            control: self.control.clone(),
            mode: args
                .get("mode")
                .and_then(|v| v.as_str())
                .unwrap_or("sleep")
                .to_string(),
            delay_ms: args.get("delay_ms").and_then(|v| v.as_u64()).unwrap_or(50),
            payload: args
                .get("payload")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        }))
    }
}

/// Task-originator side: collects responses and session attribute updates,
/// and answers sibling requests.
pub struct ClientNode {
    pub node_id: NodeId,
    pub messenger: Arc<LocalMessenger>,
    pub responses: Arc<Mutex<Vec<ExecuteResponse>>>,
    pub session_updates: Arc<Mutex<Vec<SessionAttrRequest>>>,
    pub siblings: Arc<Mutex<Vec<JobSibling>>>,
}

struct ClientListener {
    messenger: Arc<LocalMessenger>,
    responses: Arc<Mutex<Vec<ExecuteResponse>>>,
    session_updates: Arc<Mutex<Vec<SessionAttrRequest>>>,
    siblings: Arc<Mutex<Vec<JobSibling>>>,
}

impl MessageListener for ClientListener {
    fn on_message(&self, from: NodeId, msg: Message) {
        match msg {
            Message::ExecuteResult(response) => {
                self.responses.lock().push(response);
            }
            Message::SessionAttrs(update) => {
                self.session_updates.lock().push(update);
            }
            Message::Siblings(SiblingsRequest {
                session_id,
                reply_topic,
            }) => {
                let reply = SiblingsResponse {
                    session_id,
                    siblings: self.siblings.lock().clone(),
                };

                let _ = self
                    .messenger
                    .send_unordered(from, reply_topic, Message::SiblingsReply(reply));
            }
            _ => {}
        }
    }
}

pub struct WorkerNode {
    pub node_id: NodeId,
    pub cluster: Arc<StaticCluster>,
    pub processor: Arc<JobProcessor>,
    pub registry: Arc<InMemoryDeploymentRegistry>,
}

/// One client node plus N processor nodes on a shared exchange.
pub struct LocalGrid {
    pub exchange: Arc<LocalExchange>,
    pub client: ClientNode,
    pub client_cluster: Arc<StaticCluster>,
    pub workers: Vec<WorkerNode>,
    pub control: Arc<JobControl>,
    pub class_loader_id: Uuid,
}

impl LocalGrid {
    pub async fn start(
        num_workers: usize,
        config: GridConfig,
        collision: Option<Arc<dyn CollisionPolicy>>,
    ) -> Self {
        let exchange = LocalExchange::new();
        let control = Arc::new(JobControl::default());
        let class_loader_id = Uuid::new_v4();

        let client_id = Uuid::new_v4();
        let worker_ids: Vec<NodeId> = (0..num_workers).map(|_| Uuid::new_v4()).collect();

        let make_cluster = |local: NodeId| {
            let cluster = Arc::new(StaticCluster::new(local));

            for &id in std::iter::once(&client_id).chain(worker_ids.iter()) {
                if id != local {
                    cluster.add_node(id);
                }
            }

            cluster
        };

        let client_cluster = make_cluster(client_id);
        let client_messenger = Arc::new(LocalMessenger::new(client_id, exchange.clone()));
        let responses = Arc::new(Mutex::new(Vec::new()));
        let session_updates = Arc::new(Mutex::new(Vec::new()));
        let siblings = Arc::new(Mutex::new(Vec::new()));

        let listener = Arc::new(ClientListener {
            messenger: client_messenger.clone(),
            responses: responses.clone(),
            session_updates: session_updates.clone(),
            siblings: siblings.clone(),
        });

        client_messenger.add_listener(Topic::Task, listener.clone());
        client_messenger.add_listener(Topic::JobSiblings, listener);

        let client = ClientNode {
            node_id: client_id,
            messenger: client_messenger,
            responses,
            session_updates,
            siblings,
        };

        let mut workers = Vec::new();

        for &node_id in &worker_ids {
            let cluster = make_cluster(node_id);
            let messenger = Arc::new(LocalMessenger::new(node_id, exchange.clone()));

            let registry = Arc::new(InMemoryDeploymentRegistry::new());
            registry.register(
                TEST_TASK_CLASS,
                Arc::new(Deployment::new(
                    class_loader_id,
                    "0",
                    true,
                    Arc::new(ControlledJobFactory {
                        control: control.clone(),
                    }),
                )),
            );

            let processor = JobProcessor::new(
                cluster.clone(),
                messenger,
                registry.clone(),
                Arc::new(AllOwningTopology),
                config.clone(),
                collision.clone(),
            );

            processor.start();

            workers.push(WorkerNode {
                node_id,
                cluster,
                processor,
                registry,
            });
        }

        Self {
            exchange,
            client,
            client_cluster,
            workers,
            control,
            class_loader_id,
        }
    }

    pub fn worker(&self) -> &WorkerNode {
        &self.workers[0]
    }

    pub fn deployment_meta(&self) -> DeploymentMeta {
        DeploymentMeta {
            mode: DeploymentMode::Shared,
            task_name: "test-task".to_string(),
            task_class: TEST_TASK_CLASS.to_string(),
            user_version: "0".to_string(),
            class_loader_id: self.class_loader_id,
            participants: Vec::new(),
            force_local: false,
        }
    }

    /// Register the client's listener for a full-support job's reply topic.
    pub fn listen_job_topic(&self, job_id: JobId, worker: NodeId) {
        let listener = Arc::new(ClientListener {
            messenger: self.client.messenger.clone(),
            responses: self.client.responses.clone(),
            session_updates: self.client.session_updates.clone(),
            siblings: self.client.siblings.clone(),
        });

        self.client
            .messenger
            .add_listener(Topic::TaskResult { job_id, node: worker }, listener);
    }

    /// Send an execute request from the client to the first worker node.
    pub fn submit(&self, request: ExecuteRequest) {
        self.submit_to(self.worker().node_id, request);
    }

    pub fn submit_to(&self, node: NodeId, request: ExecuteRequest) {
        // A stopped node has no listener anymore; that is a valid outcome
        // for shutdown tests.
        let _ = self
            .client
            .messenger
            .send_unordered(node, Topic::Job, Message::Execute(request));
    }

    /// Send a cancel request from the client to the first worker node.
    pub fn cancel(&self, session_id: Option<Uuid>, job_id: Option<JobId>, system: bool) {
        let _ = self.client.messenger.send_unordered(
            self.worker().node_id,
            Topic::JobCancel,
            Message::Cancel(grid_lite::scheduler::job::CancelRequest {
                session_id,
                job_id,
                system,
            }),
        );
    }

    /// Simulate the client (task originator) leaving the grid, as observed
    /// by every worker node.
    pub fn client_leaves(&self, failed: bool) {
        for worker in &self.workers {
            worker.cluster.remove_node(self.client.node_id, failed);
        }
    }

    pub fn responses(&self) -> Vec<ExecuteResponse> {
        self.client.responses.lock().clone()
    }

    pub fn response_for(&self, job_id: JobId) -> Option<ExecuteResponse> {
        self.client
            .responses
            .lock()
            .iter()
            .find(|r| r.job_id == job_id)
            .cloned()
    }

    pub fn executed_jobs(&self) -> Vec<JobId> {
        self.control.executed.lock().clone()
    }
}

/// Request builder with harness defaults. Attribute knobs drive the
/// controlled job's behavior.
pub struct RequestBuilder {
    request: ExecuteRequest,
    attrs: HashMap<String, serde_json::Value>,
}

impl RequestBuilder {
    pub fn new(grid: &LocalGrid) -> Self {
        Self {
            request: ExecuteRequest {
                session_id: Uuid::new_v4(),
                job_id: Uuid::new_v4(),
                deployment: grid.deployment_meta(),
                created_at: Utc::now(),
                timeout_ms: 0,
                topology_version: 1,
                siblings: None,
                session_attrs: None,
                job_attrs: Payload::Inline(JobArgs::new()),
                topology_predicate: None,
                executor: None,
                reservation: None,
                internal: false,
                full_session_support: false,
            },
            attrs: HashMap::new(),
        }
    }

    pub fn session(mut self, session_id: Uuid) -> Self {
        self.request.session_id = session_id;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request.timeout_ms = timeout_ms;
        self
    }

    pub fn internal(mut self) -> Self {
        self.request.internal = true;
        self
    }

    pub fn full_session_support(mut self) -> Self {
        self.request.full_session_support = true;
        self.request.session_attrs = Some(Payload::Inline(JobArgs::new()));
        self
    }

    pub fn mode(mut self, mode: &str) -> Self {
        self.attrs
            .insert("mode".to_string(), serde_json::json!(mode));
        self
    }

    pub fn delay_ms(mut self, delay_ms: u64) -> Self {
        self.attrs
            .insert("delay_ms".to_string(), serde_json::json!(delay_ms));
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.attrs.insert("payload".to_string(), payload);
        self
    }

    pub fn job_id(&self) -> JobId {
        self.request.job_id
    }

    pub fn session_id(&self) -> Uuid {
        self.request.session_id
    }

    pub fn build(mut self) -> ExecuteRequest {
        self.request.job_attrs = Payload::Inline(self.attrs.into_iter().collect());
        self.request
    }
}

/// Wait for a condition to become true with timeout.
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true.
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(10)).await;
    assert!(result, "{}", message);
}
