use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use grid_lite::cluster::StaticCluster;
use grid_lite::config::GridConfig;
use grid_lite::dashboard::{run_dashboard, DashboardState};
use grid_lite::deployment::{
    Deployment, DeploymentMeta, DeploymentMode, InMemoryDeploymentRegistry, JobFactory,
};
use grid_lite::error::{GridError, Result};
use grid_lite::messenger::{LocalExchange, LocalMessenger, Message, Messenger, Topic};
use grid_lite::scheduler::job::{
    ComputeJob, ExecuteRequest, JobArgs, JobContext, JobFuture, Payload,
};
use grid_lite::scheduler::reservation::AllOwningTopology;
use grid_lite::scheduler::{CollisionPolicy, FifoQueuePolicy, JobProcessor};
use grid_lite::shutdown::shutdown_token;

#[derive(Parser, Debug)]
#[command(name = "grid-lite")]
#[command(about = "In-memory data grid node: compute job scheduler with a jobs dashboard")]
struct Args {
    /// Port for the HTTP jobs dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Enable the FIFO collision policy with this parallelism limit
    #[arg(long)]
    parallel_jobs: Option<usize>,

    /// Size of the default executor pool
    #[arg(long, default_value = "8")]
    pool_size: usize,

    /// Number of demo jobs submitted at startup
    #[arg(long, default_value = "4")]
    demo_jobs: usize,
}

/// Demo job: sleeps for the configured delay, then echoes its payload.
struct SleepEchoJob {
    delay_ms: u64,
    payload: serde_json::Value,
}

impl ComputeJob for SleepEchoJob {
    fn execute(&self, ctx: Arc<JobContext>) -> JobFuture {
        let delay_ms = self.delay_ms;
        let payload = self.payload.clone();

        Box::pin(async move {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(delay_ms)) => {
                    Ok(payload)
                }
                _ = ctx.cancel_token().cancelled() => {
                    Err(GridError::ExecutionRejected("job was cancelled".to_string()))
                }
            }
        })
    }
}

struct DemoJobFactory;

impl JobFactory for DemoJobFactory {
    fn create(&self, task_class: &str, args: &JobArgs) -> Result<Arc<dyn ComputeJob>> {
        match task_class {
            "demo.SleepEchoJob" => Ok(Arc::new(SleepEchoJob {
                delay_ms: args.get("delay_ms").and_then(|v| v.as_u64()).unwrap_or(100),
                payload: args
                    .get("payload")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            })),
            other => Err(GridError::DeploymentMissing(other.to_string())),
        }
    }
}

fn demo_request(session_id: Uuid, deployment: &DeploymentMeta, index: usize) -> ExecuteRequest {
    ExecuteRequest {
        session_id,
        job_id: Uuid::new_v4(),
        deployment: deployment.clone(),
        created_at: Utc::now(),
        timeout_ms: 30_000,
        topology_version: 1,
        siblings: None,
        session_attrs: None,
        job_attrs: Payload::Inline(JobArgs::from([
            ("delay_ms".to_string(), serde_json::json!(250)),
            ("payload".to_string(), serde_json::json!({ "index": index })),
        ])),
        topology_predicate: None,
        executor: None,
        reservation: None,
        internal: false,
        full_session_support: false,
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let node_id = Uuid::new_v4();
    let cluster = Arc::new(StaticCluster::new(node_id));
    let exchange = LocalExchange::new();
    let messenger = Arc::new(LocalMessenger::new(node_id, exchange));

    let class_loader_id = Uuid::new_v4();
    let deployment_meta = DeploymentMeta {
        mode: DeploymentMode::Shared,
        task_name: "demo-task".to_string(),
        task_class: "demo.SleepEchoJob".to_string(),
        user_version: "0".to_string(),
        class_loader_id,
        participants: Vec::new(),
        force_local: false,
    };

    let registry = Arc::new(InMemoryDeploymentRegistry::new());
    registry.register(
        "demo.SleepEchoJob",
        Arc::new(Deployment::new(
            class_loader_id,
            "0",
            true,
            Arc::new(DemoJobFactory),
        )),
    );

    let config = GridConfig {
        default_pool_size: args.pool_size,
        ..GridConfig::default()
    };

    let collision = args
        .parallel_jobs
        .map(|n| Arc::new(FifoQueuePolicy::new(n)) as Arc<dyn CollisionPolicy>);

    let processor = JobProcessor::new(
        cluster.clone(),
        messenger.clone(),
        registry,
        Arc::new(AllOwningTopology),
        config,
        collision,
    );

    processor.start();

    tracing::info!(
        node = %node_id,
        parallel_jobs = ?args.parallel_jobs,
        pool_size = args.pool_size,
        "Starting grid-lite node"
    );

    if let Some(port) = args.dashboard_port {
        let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
        let state = DashboardState {
            processor: processor.clone(),
        };

        tokio::spawn(async move {
            run_dashboard(addr, state).await;
        });
    }

    // Exercise the pipeline with a few local jobs so the dashboard has
    // something to show.
    let session_id = Uuid::new_v4();

    for index in 0..args.demo_jobs {
        let request = demo_request(session_id, &deployment_meta, index);

        messenger.send_unordered(node_id, Topic::Job, Message::Execute(request))?;
    }

    let shutdown = shutdown_token();
    shutdown.cancelled().await;

    processor.stop(true).await;

    let metrics = processor.metrics();
    tracing::info!(
        started = metrics.started,
        finished = metrics.finished,
        canceled = metrics.canceled,
        rejected = metrics.rejected,
        "Node stopped"
    );

    Ok(())
}
