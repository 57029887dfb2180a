//! Collision policy tests: admission views, activate/cancel contexts, the
//! recursion guard and the external re-pass trigger.

mod test_harness;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use test_harness::{assert_eventually, LocalGrid, RequestBuilder};
use uuid::Uuid;

use grid_lite::config::GridConfig;
use grid_lite::scheduler::collision::CollisionExternalListener;
use grid_lite::scheduler::job::FailureKind;
use grid_lite::scheduler::{CollisionJobContext, CollisionPolicy, JobViewState};

fn pool_config(pool_size: usize) -> GridConfig {
    GridConfig {
        default_pool_size: pool_size,
        ..GridConfig::default()
    }
}

/// Activates up to `limit` concurrent jobs and cancels everything beyond.
struct CancelBeyondLimit {
    limit: usize,
}

impl CollisionPolicy for CancelBeyondLimit {
    fn on_collision(
        &self,
        passive: &[CollisionJobContext],
        active: &[CollisionJobContext],
        _held: &[CollisionJobContext],
    ) {
        let mut running = active.len();

        for ctx in passive {
            if running < self.limit {
                if ctx.activate() {
                    running += 1;
                }
            } else {
                ctx.cancel();
            }
        }
    }
}

/// Policy that activates everything only once armed, and remembers the
/// sizes of the views it was offered.
#[derive(Default)]
struct ArmedPolicy {
    armed: AtomicBool,
    passes: AtomicUsize,
    view_sizes: Mutex<Vec<(usize, usize, usize)>>,
    external: Mutex<Option<Arc<dyn CollisionExternalListener>>>,
}

impl CollisionPolicy for ArmedPolicy {
    fn on_collision(
        &self,
        passive: &[CollisionJobContext],
        active: &[CollisionJobContext],
        held: &[CollisionJobContext],
    ) {
        self.passes.fetch_add(1, Ordering::SeqCst);
        self.view_sizes
            .lock()
            .push((passive.len(), active.len(), held.len()));

        if self.armed.load(Ordering::SeqCst) {
            for ctx in passive {
                ctx.activate();
            }
        }
    }

    fn set_external_listener(&self, listener: Arc<dyn CollisionExternalListener>) {
        *self.external.lock() = Some(listener);
    }

    fn unset_external_listener(&self) {
        *self.external.lock() = None;
    }
}

/// Admission under collision: with a limit of two, the first two jobs stay
/// active and the rest are rejected.
#[tokio::test]
async fn test_admission_cancel_beyond_limit() {
    let policy = Arc::new(CancelBeyondLimit { limit: 2 });
    let grid = LocalGrid::start(1, pool_config(1), Some(policy)).await;

    let session_id = Uuid::new_v4();
    let mut job_ids = Vec::new();

    for _ in 0..4 {
        let builder = RequestBuilder::new(&grid)
            .session(session_id)
            .mode("block")
            .timeout_ms(60_000);
        job_ids.push(builder.job_id());
        grid.submit(builder.build());
    }

    assert_eventually(
        || async { grid.responses().len() == 2 },
        Duration::from_secs(5),
        "two jobs should be rejected",
    )
    .await;

    let processor = &grid.worker().processor;

    // First two admitted and active, last two rejected.
    assert!(processor.active_job(job_ids[0]).is_some());
    assert!(processor.active_job(job_ids[1]).is_some());

    for &rejected in &job_ids[2..] {
        let response = grid.response_for(rejected).expect("rejection reply");
        assert_eq!(response.error.unwrap().kind, FailureKind::ExecutionRejected);

        assert!(processor.recently_finished(rejected));
        assert_eq!(processor.cancel_request(&rejected), Some(false));
    }

    assert_eq!(processor.metrics().rejected, 2);

    // Rejected jobs never reached a pool.
    assert!(grid.executed_jobs().len() <= 2);

    grid.cancel(Some(session_id), None, true);
}

/// A held worker stays in the active map but moves to the held view.
#[tokio::test]
async fn test_held_worker_leaves_active_view() {
    let policy = Arc::new(CancelBeyondLimit { limit: 8 });
    let grid = LocalGrid::start(1, pool_config(4), Some(policy)).await;

    let builder = RequestBuilder::new(&grid)
        .mode("hold")
        .payload(serde_json::json!("held-done"))
        .timeout_ms(60_000);
    let job_id = builder.job_id();

    grid.submit(builder.build());

    assert_eventually(
        || async {
            grid.worker()
                .processor
                .jobs_view()
                .iter()
                .any(|v| v.job_id == job_id && v.held)
        },
        Duration::from_secs(5),
        "job should be held",
    )
    .await;

    // Held jobs remain active (invariant: held is a subset of active).
    let view = grid
        .worker()
        .processor
        .jobs_view()
        .into_iter()
        .find(|v| v.job_id == job_id)
        .unwrap();
    assert_eq!(view.state, JobViewState::Active);

    grid.control.proceed.notify_waiters();

    assert_eventually(
        || async { grid.response_for(job_id).is_some() },
        Duration::from_secs(5),
        "held job should finish after release",
    )
    .await;

    assert_eq!(
        grid.response_for(job_id).unwrap().result,
        Some(serde_json::json!("held-done"))
    );
}

/// Held workers appear in the held view of later collision passes, not in
/// the active view.
#[tokio::test]
async fn test_collision_views_separate_held() {
    let policy = Arc::new(ArmedPolicy::default());
    policy.armed.store(true, Ordering::SeqCst);

    let grid = LocalGrid::start(1, pool_config(4), Some(policy.clone())).await;

    let builder = RequestBuilder::new(&grid).mode("hold").timeout_ms(60_000);
    let job_id = builder.job_id();
    grid.submit(builder.build());

    assert_eventually(
        || async {
            grid.worker()
                .processor
                .jobs_view()
                .iter()
                .any(|v| v.job_id == job_id && v.held)
        },
        Duration::from_secs(5),
        "job should be held",
    )
    .await;

    // Trigger another pass and inspect the views it saw.
    let trigger = policy.external.lock().clone().unwrap();
    trigger.on_external_collision();

    let sizes = policy.view_sizes.lock().clone();
    let last = *sizes.last().unwrap();
    assert_eq!(last, (0, 0, 1), "held job must only appear in the held view");

    grid.control.proceed.notify_waiters();

    assert_eventually(
        || async { grid.response_for(job_id).is_some() },
        Duration::from_secs(5),
        "held job should finish",
    )
    .await;
}

/// The external listener installed on the policy re-runs the pass.
#[tokio::test]
async fn test_external_trigger_reruns_pass() {
    let policy = Arc::new(ArmedPolicy::default());
    let grid = LocalGrid::start(1, pool_config(4), Some(policy.clone())).await;

    let builder = RequestBuilder::new(&grid)
        .mode("sleep")
        .delay_ms(5)
        .payload(serde_json::json!("late"));
    let job_id = builder.job_id();
    grid.submit(builder.build());

    // The admission pass ran but activated nothing.
    assert_eventually(
        || async { policy.passes.load(Ordering::SeqCst) >= 1 },
        Duration::from_secs(5),
        "admission pass should run",
    )
    .await;
    assert!(grid.response_for(job_id).is_none());

    policy.armed.store(true, Ordering::SeqCst);
    policy.external.lock().clone().unwrap().on_external_collision();

    assert_eventually(
        || async { grid.response_for(job_id).is_some() },
        Duration::from_secs(5),
        "job should run after the external trigger",
    )
    .await;
}

/// Recursive collision passes on the same thread are suppressed.
#[tokio::test]
async fn test_recursive_pass_is_suppressed() {
    #[derive(Default)]
    struct RecursivePolicy {
        processor: Mutex<Option<Arc<grid_lite::scheduler::JobProcessor>>>,
        passes: AtomicUsize,
    }

    impl CollisionPolicy for RecursivePolicy {
        fn on_collision(
            &self,
            passive: &[CollisionJobContext],
            _active: &[CollisionJobContext],
            _held: &[CollisionJobContext],
        ) {
            self.passes.fetch_add(1, Ordering::SeqCst);

            // Attempt to re-enter; the guard must make this a no-op.
            if let Some(processor) = self.processor.lock().clone() {
                processor.handle_collisions();
            }

            for ctx in passive {
                ctx.activate();
            }
        }
    }

    let policy = Arc::new(RecursivePolicy::default());
    let grid = LocalGrid::start(1, pool_config(4), Some(policy.clone())).await;

    *policy.processor.lock() = Some(grid.worker().processor.clone());

    let builder = RequestBuilder::new(&grid).mode("sleep").delay_ms(5);
    let job_id = builder.job_id();
    grid.submit(builder.build());

    assert_eventually(
        || async { grid.response_for(job_id).is_some() },
        Duration::from_secs(5),
        "job should complete despite the recursive policy",
    )
    .await;

    // One pass per trigger point, no runaway recursion.
    assert!(policy.passes.load(Ordering::SeqCst) <= 4);
}

/// A duplicate execute request for the same job id is dropped.
#[tokio::test]
async fn test_duplicate_job_id_is_dropped() {
    let policy = Arc::new(ArmedPolicy::default());
    let grid = LocalGrid::start(1, pool_config(4), Some(policy)).await;

    let request = RequestBuilder::new(&grid).mode("sleep").build();
    let job_id = request.job_id;

    grid.submit(request.clone());
    grid.submit(request);

    assert_eventually(
        || async {
            grid.worker()
                .processor
                .jobs_view()
                .iter()
                .filter(|v| v.job_id == job_id)
                .count()
                == 1
        },
        Duration::from_secs(5),
        "only one passive entry should remain",
    )
    .await;

    let views = grid.worker().processor.jobs_view();
    assert_eq!(
        views
            .iter()
            .filter(|v| v.job_id == job_id && v.state == JobViewState::Passive)
            .count(),
        1
    );
}
