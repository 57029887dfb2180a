//! Scheduler pipeline tests: admission, cancellation races, master-leave
//! handling and stop semantics.

mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use test_harness::{assert_eventually, LocalGrid, RequestBuilder};
use uuid::Uuid;

use grid_lite::config::GridConfig;
use grid_lite::messenger::Messenger;
use grid_lite::scheduler::job::FailureKind;
use grid_lite::scheduler::{JobViewState, WorkerStatus};

fn small_pool_config(pool_size: usize) -> GridConfig {
    GridConfig {
        default_pool_size: pool_size,
        ..GridConfig::default()
    }
}

#[tokio::test]
async fn test_job_executes_and_replies() {
    let grid = LocalGrid::start(1, GridConfig::default(), None).await;

    let builder = RequestBuilder::new(&grid)
        .mode("sleep")
        .delay_ms(10)
        .payload(serde_json::json!({"answer": 42}));
    let job_id = builder.job_id();

    grid.submit(builder.build());

    assert_eventually(
        || async { grid.response_for(job_id).is_some() },
        Duration::from_secs(5),
        "job response should arrive",
    )
    .await;

    let response = grid.response_for(job_id).unwrap();
    assert!(response.error.is_none());
    assert_eq!(response.result, Some(serde_json::json!({"answer": 42})));
    assert!(!response.cancelled);

    let metrics = grid.worker().processor.metrics();
    assert_eq!(metrics.started, 1);
    assert_eq!(metrics.finished, 1);
    assert!(grid.worker().processor.recently_finished(job_id));
}

#[tokio::test]
async fn test_unknown_task_class_reports_deployment_missing() {
    let grid = LocalGrid::start(1, GridConfig::default(), None).await;

    let mut request = RequestBuilder::new(&grid).build();
    request.deployment.task_class = "test.NoSuchJob".to_string();
    request.deployment.class_loader_id = Uuid::new_v4();
    let job_id = request.job_id;

    grid.submit(request);

    assert_eventually(
        || async { grid.response_for(job_id).is_some() },
        Duration::from_secs(5),
        "error response should arrive",
    )
    .await;

    let response = grid.response_for(job_id).unwrap();
    assert_eq!(response.error.unwrap().kind, FailureKind::DeploymentMissing);
    assert!(grid.executed_jobs().is_empty());
}

#[tokio::test]
async fn test_internal_job_runs_inline() {
    let grid = LocalGrid::start(1, GridConfig::default(), None).await;

    let builder = RequestBuilder::new(&grid)
        .internal()
        .payload(serde_json::json!("internal-result"))
        .delay_ms(1);
    let job_id = builder.job_id();

    grid.submit(builder.build());

    assert_eventually(
        || async { grid.response_for(job_id).is_some() },
        Duration::from_secs(5),
        "internal job should reply",
    )
    .await;

    let response = grid.response_for(job_id).unwrap();
    assert_eq!(response.result, Some(serde_json::json!("internal-result")));

    // Internal jobs never enter the started/active accounting.
    assert_eq!(grid.worker().processor.metrics().started, 0);
}

/// Cancel-before-activate race: the cancel request is recorded before the
/// execute request arrives, so the collision pass must not activate the
/// job and it is rejected without running user code.
#[tokio::test]
async fn test_cancel_before_activation_rejects_without_running() {
    let policy = Arc::new(grid_lite::scheduler::FifoQueuePolicy::new(8));
    let grid = LocalGrid::start(1, GridConfig::default(), Some(policy)).await;

    let builder = RequestBuilder::new(&grid).mode("sleep").delay_ms(10);
    let session_id = builder.session_id();
    let job_id = builder.job_id();

    grid.cancel(Some(session_id), None, false);

    grid.submit(builder.build());

    assert_eventually(
        || async { grid.response_for(job_id).is_some() },
        Duration::from_secs(5),
        "rejection response should arrive",
    )
    .await;

    let response = grid.response_for(job_id).unwrap();
    assert_eq!(response.error.unwrap().kind, FailureKind::ExecutionRejected);
    assert!(grid.executed_jobs().is_empty(), "user code must not run");
    assert!(grid.worker().processor.active_job(job_id).is_none());
}

/// Master leaves mid-execution: the job moves to the cancelled bucket, its
/// worker is cancelled, and no response reaches the departed originator.
#[tokio::test]
async fn test_master_leave_cancels_without_response() {
    let grid = LocalGrid::start(1, GridConfig::default(), None).await;

    let builder = RequestBuilder::new(&grid).mode("block").timeout_ms(10_000);
    let job_id = builder.job_id();

    grid.submit(builder.build());

    assert_eventually(
        || async { grid.worker().processor.active_job(job_id).is_some() },
        Duration::from_secs(5),
        "job should be active",
    )
    .await;

    grid.client_leaves(false);

    assert_eventually(
        || async {
            let views = grid.worker().processor.jobs_view();
            views
                .iter()
                .any(|v| v.job_id == job_id && v.state == JobViewState::Cancelled)
                || grid.worker().processor.recently_finished(job_id)
        },
        Duration::from_secs(5),
        "job should move to the cancelled bucket",
    )
    .await;

    assert_eventually(
        || async { grid.worker().processor.recently_finished(job_id) },
        Duration::from_secs(5),
        "cancelled job should finish",
    )
    .await;

    assert!(
        grid.responses().is_empty(),
        "no response must be sent to a departed master"
    );
}

/// P1: a job id never appears in more than one scheduler bucket at a time.
#[tokio::test]
async fn test_job_appears_in_one_bucket() {
    let grid = LocalGrid::start(1, GridConfig::default(), None).await;

    let builder = RequestBuilder::new(&grid).mode("block").timeout_ms(10_000);
    let job_id = builder.job_id();
    let session_id = builder.session_id();

    grid.submit(builder.build());

    assert_eventually(
        || async { grid.worker().processor.active_job(job_id).is_some() },
        Duration::from_secs(5),
        "job should be active",
    )
    .await;

    grid.cancel(Some(session_id), Some(job_id), false);

    assert_eventually(
        || async { grid.response_for(job_id).is_some() },
        Duration::from_secs(5),
        "cancelled job should still reply",
    )
    .await;

    // At every observation point, the job occupied at most one bucket.
    let views = grid.worker().processor.jobs_view();
    let occurrences = views.iter().filter(|v| v.job_id == job_id).count();
    assert!(occurrences <= 1);
}

#[tokio::test]
async fn test_job_timeout_fires_cancellation() {
    let grid = LocalGrid::start(1, GridConfig::default(), None).await;

    let builder = RequestBuilder::new(&grid)
        .mode("sleep")
        .delay_ms(60_000)
        .timeout_ms(100);
    let job_id = builder.job_id();

    grid.submit(builder.build());

    assert_eventually(
        || async { grid.response_for(job_id).is_some() },
        Duration::from_secs(5),
        "timeout response should arrive",
    )
    .await;

    let response = grid.response_for(job_id).unwrap();
    assert_eq!(response.error.unwrap().kind, FailureKind::Timeout);
    assert!(response.cancelled);
}

#[tokio::test]
async fn test_stop_with_cancel_terminates_active_jobs() {
    let grid = LocalGrid::start(1, GridConfig::default(), None).await;

    let builder = RequestBuilder::new(&grid).mode("block").timeout_ms(60_000);
    let job_id = builder.job_id();

    grid.submit(builder.build());

    assert_eventually(
        || async { grid.worker().processor.active_job(job_id).is_some() },
        Duration::from_secs(5),
        "job should be active",
    )
    .await;

    grid.worker().processor.stop(true).await;

    let response = grid.response_for(job_id).expect("stop-cancel still replies");
    assert!(response.cancelled);

    // The gate is sealed: new requests are ignored.
    let late = RequestBuilder::new(&grid);
    let late_id = late.job_id();
    grid.submit(late.build());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(grid.response_for(late_id).is_none());
}

#[tokio::test]
async fn test_session_cancel_sweeps_all_jobs() {
    let grid = LocalGrid::start(1, small_pool_config(4), None).await;

    let session_id = Uuid::new_v4();
    let mut job_ids = Vec::new();

    for _ in 0..3 {
        let builder = RequestBuilder::new(&grid)
            .session(session_id)
            .mode("block")
            .timeout_ms(60_000);
        job_ids.push(builder.job_id());
        grid.submit(builder.build());
    }

    assert_eventually(
        || async {
            job_ids
                .iter()
                .all(|id| grid.worker().processor.active_job(*id).is_some())
        },
        Duration::from_secs(5),
        "all jobs should be active",
    )
    .await;

    grid.cancel(Some(session_id), None, false);

    assert_eventually(
        || async { grid.responses().len() == 3 },
        Duration::from_secs(5),
        "every job of the session should reply after cancel",
    )
    .await;

    assert!(grid.responses().iter().all(|r| r.cancelled));
    assert_eq!(grid.worker().processor.cancel_request(&session_id), Some(false));
}

#[tokio::test]
async fn test_job_statuses_by_session() {
    let grid = LocalGrid::start(1, GridConfig::default(), None).await;

    let session_id = Uuid::new_v4();
    let builder = RequestBuilder::new(&grid)
        .session(session_id)
        .mode("block")
        .timeout_ms(60_000);
    let job_id = builder.job_id();

    grid.submit(builder.build());

    assert_eventually(
        || async { grid.worker().processor.active_job(job_id).is_some() },
        Duration::from_secs(5),
        "job should be active",
    )
    .await;

    let statuses = grid.worker().processor.job_statuses(session_id);
    assert_eq!(statuses.get(&WorkerStatus::Started), Some(&1));

    grid.cancel(None, Some(job_id), false);

    assert_eventually(
        || async { grid.response_for(job_id).is_some() },
        Duration::from_secs(5),
        "job should finish after cancel",
    )
    .await;
}

#[tokio::test]
async fn test_session_attributes_flow_both_ways() {
    let grid = LocalGrid::start(1, GridConfig::default(), None).await;

    let builder = RequestBuilder::new(&grid)
        .mode("block")
        .timeout_ms(60_000)
        .full_session_support();
    let job_id = builder.job_id();
    let session_id = builder.session_id();

    grid.listen_job_topic(job_id, grid.worker().node_id);
    grid.submit(builder.build());

    assert_eventually(
        || async { grid.worker().processor.active_job(job_id).is_some() },
        Duration::from_secs(5),
        "job should be active",
    )
    .await;

    // Task -> job: an attribute update lands in the shared session.
    let _ = grid.client.messenger.send_ordered(
        grid.worker().node_id,
        grid_lite::messenger::Topic::TaskResult {
            job_id,
            node: grid.worker().node_id,
        },
        grid_lite::messenger::Message::SessionAttrs(grid_lite::scheduler::job::SessionAttrRequest {
            session_id,
            job_id,
            attrs: grid_lite::scheduler::job::Payload::Inline(
                [("phase".to_string(), serde_json::json!("two"))].into(),
            ),
        }),
        1_000,
    );

    let worker = grid.worker().processor.active_job(job_id).unwrap();
    assert_eq!(
        worker.session().attribute("phase"),
        Some(serde_json::json!("two"))
    );

    // Job -> task: the scheduler fans an update back on the ordered path.
    grid.worker()
        .processor
        .set_session_attributes(
            worker.session(),
            [("progress".to_string(), serde_json::json!(50))].into(),
        )
        .unwrap();

    assert_eventually(
        || async { !grid.client.session_updates.lock().is_empty() },
        Duration::from_secs(5),
        "client should observe the attribute update",
    )
    .await;

    grid.cancel(None, Some(job_id), false);

    assert_eventually(
        || async { grid.response_for(job_id).is_some() },
        Duration::from_secs(5),
        "full-support response should arrive on the job topic",
    )
    .await;

    // The response carries the merged session attributes.
    let response = grid.response_for(job_id).unwrap();
    let attrs = response.attributes.unwrap();
    assert_eq!(attrs.get("phase"), Some(&serde_json::json!("two")));
    assert_eq!(attrs.get("progress"), Some(&serde_json::json!(50)));
}

#[tokio::test]
async fn test_master_leave_local_hook() {
    let grid = LocalGrid::start(1, GridConfig::default(), None).await;

    let builder = RequestBuilder::new(&grid).mode("block").timeout_ms(60_000);
    let job_id = builder.job_id();
    let session_id = builder.session_id();

    grid.submit(builder.build());

    assert_eventually(
        || async { grid.worker().processor.active_job(job_id).is_some() },
        Duration::from_secs(5),
        "job should be active",
    )
    .await;

    grid.worker().processor.master_leave_local(session_id);

    // The hook suppresses the response of jobs that finish afterwards.
    grid.cancel(None, Some(job_id), false);

    assert_eventually(
        || async { grid.worker().processor.recently_finished(job_id) },
        Duration::from_secs(5),
        "job should finish",
    )
    .await;

    assert!(grid.response_for(job_id).is_none());
}

#[tokio::test]
async fn test_siblings_round_trip() {
    let grid = LocalGrid::start(1, GridConfig::default(), None).await;

    let expected = vec![grid_lite::scheduler::job::JobSibling {
        job_id: Uuid::new_v4(),
        node: grid.client.node_id,
    }];
    *grid.client.siblings.lock() = expected.clone();

    let builder = RequestBuilder::new(&grid).mode("block").timeout_ms(60_000);
    let job_id = builder.job_id();
    grid.submit(builder.build());

    assert_eventually(
        || async { grid.worker().processor.active_job(job_id).is_some() },
        Duration::from_secs(5),
        "job should be active",
    )
    .await;

    let worker = grid.worker().processor.active_job(job_id).unwrap();
    let siblings = grid
        .worker()
        .processor
        .request_job_siblings(worker.session())
        .await
        .unwrap();

    assert_eq!(siblings, expected);

    grid.cancel(None, Some(job_id), true);
}
