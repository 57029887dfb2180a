//! Checkpoint progress tracking for the page-oriented persistence engine.
//!
//! A [`CheckpointProgress`] is the monotone life story of one checkpoint
//! round: writer threads advance it through [`CheckpointState`]s, any
//! thread can await a state through its completion future, and page
//! counters describe the write-out while it runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::error::{GridError, Result};

/// Checkpoint lifecycle states, totally ordered. Transitions only move
/// forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CheckpointState {
    Scheduled = 0,
    LockTaken = 1,
    PagesSnapshotted = 2,
    LockReleased = 3,
    PagesWritten = 4,
    Finished = 5,
}

impl CheckpointState {
    pub const ALL: [CheckpointState; 6] = [
        CheckpointState::Scheduled,
        CheckpointState::LockTaken,
        CheckpointState::PagesSnapshotted,
        CheckpointState::LockReleased,
        CheckpointState::PagesWritten,
        CheckpointState::Finished,
    ];

    fn ordinal(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Scheduled => "scheduled",
            Self::LockTaken => "lock-taken",
            Self::PagesSnapshotted => "pages-snapshotted",
            Self::LockReleased => "lock-released",
            Self::PagesWritten => "pages-written",
            Self::Finished => "finished",
        };

        write!(f, "{name}")
    }
}

/// Completion handle for one checkpoint state. Resolves once the progress
/// reaches the state, carrying the recorded failure cause if the
/// checkpoint failed first.
#[derive(Clone)]
pub struct CheckpointFuture {
    shared: Arc<FutureShared>,
}

struct FutureShared {
    // None = pending, Some(None) = success, Some(Some(e)) = failed.
    outcome: Mutex<Option<Option<GridError>>>,
    done_tx: watch::Sender<bool>,
    callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl CheckpointFuture {
    fn new() -> Self {
        let (done_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(FutureShared {
                outcome: Mutex::new(None),
                done_tx,
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_done(&self) -> bool {
        self.shared.outcome.lock().is_some()
    }

    /// The failure cause, if the future completed with one.
    pub fn error(&self) -> Option<GridError> {
        self.shared.outcome.lock().as_ref().and_then(|o| o.clone())
    }

    /// Wait for completion. Resolves immediately if already done.
    pub async fn wait(&self) -> Result<()> {
        let mut done_rx = self.shared.done_tx.subscribe();

        loop {
            if let Some(outcome) = self.shared.outcome.lock().as_ref() {
                return match outcome {
                    None => Ok(()),
                    Some(e) => Err(e.clone()),
                };
            }

            if done_rx.changed().await.is_err() {
                return Err(GridError::CheckpointFailed(
                    "checkpoint progress was dropped".to_string(),
                ));
            }
        }
    }

    /// Run `callback` once the future completes successfully. Failed
    /// completion discards the callback.
    pub fn on_done<F: FnOnce() + Send + 'static>(&self, callback: F) {
        let run_now = {
            let outcome = self.shared.outcome.lock();

            match outcome.as_ref() {
                None => {
                    drop(outcome);
                    self.shared.callbacks.lock().push(Box::new(callback));
                    return;
                }
                Some(None) => true,
                Some(Some(_)) => false,
            }
        };

        if run_now {
            callback();
        }
    }

    fn complete(&self, error: Option<GridError>) {
        let callbacks = {
            let mut outcome = self.shared.outcome.lock();

            if outcome.is_some() {
                return;
            }

            *outcome = Some(error.clone());

            if error.is_none() {
                std::mem::take(&mut *self.shared.callbacks.lock())
            } else {
                self.shared.callbacks.lock().clear();
                Vec::new()
            }
        };

        let _ = self.shared.done_tx.send(true);

        for callback in callbacks {
            callback();
        }
    }
}

/// Pending partition destroy request carried by a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDestroyRequest {
    pub cache_id: i32,
    pub partition: u32,
}

/// FIFO of partitions to destroy once the checkpoint round allows it.
#[derive(Default)]
pub struct PartitionDestroyQueue {
    queue: Mutex<VecDeque<PartitionDestroyRequest>>,
}

impl PartitionDestroyQueue {
    pub fn add(&self, req: PartitionDestroyRequest) {
        self.queue.lock().push_back(req);
    }

    pub fn drain(&self) -> Vec<PartitionDestroyRequest> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// Page write-out counters, installed while the checkpoint is running.
struct PageCounters {
    written: AtomicU64,
    synced: AtomicU64,
    evicted: AtomicU64,
    recovery: AtomicU64,
}

impl PageCounters {
    fn new() -> Self {
        Self {
            written: AtomicU64::new(0),
            synced: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            recovery: AtomicU64::new(0),
        }
    }
}

/// Limit scheduling deadlines so the nanosecond arithmetic cannot overflow.
const MAX_WAKEUP_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// State of one scheduled or running checkpoint.
///
/// Any thread may observe the state; the checkpointer advances it. State
/// transitions are strictly monotone: an attempted transition to a lower
/// state is a no-op.
pub struct CheckpointProgress {
    state: std::sync::atomic::AtomicU8,
    fail_cause: Mutex<Option<GridError>>,
    futures: [OnceLock<CheckpointFuture>; 6],
    counters: RwLock<Option<Arc<PageCounters>>>,
    current_pages: AtomicUsize,
    destroy_queue: PartitionDestroyQueue,
    wakeup_deadline: Mutex<Instant>,
    reason: Mutex<Option<String>>,
}

impl CheckpointProgress {
    /// `frequency` is the delay until this checkpoint should wake up.
    pub fn new(frequency: Duration) -> Self {
        const PENDING: OnceLock<CheckpointFuture> = OnceLock::new();

        Self {
            state: std::sync::atomic::AtomicU8::new(CheckpointState::Scheduled as u8),
            fail_cause: Mutex::new(None),
            futures: [PENDING; 6],
            counters: RwLock::new(None),
            current_pages: AtomicUsize::new(0),
            destroy_queue: PartitionDestroyQueue::default(),
            wakeup_deadline: Mutex::new(Instant::now() + frequency.min(MAX_WAKEUP_DELAY)),
            reason: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CheckpointState {
        let raw = self.state.load(Ordering::SeqCst);
        CheckpointState::ALL[raw as usize]
    }

    pub fn greater_or_equal_to(&self, expected: CheckpointState) -> bool {
        self.state.load(Ordering::SeqCst) >= expected as u8
    }

    /// Started but not finished: the checkpoint write lock has been
    /// released and pages are being written out.
    pub fn in_progress(&self) -> bool {
        self.greater_or_equal_to(CheckpointState::LockReleased)
            && !self.greater_or_equal_to(CheckpointState::Finished)
    }

    /// Advance to `new_state` if it is ahead of the current one, completing
    /// the futures of every state passed on the way.
    pub fn transit_to(&self, new_state: CheckpointState) {
        loop {
            let current = self.state.load(Ordering::SeqCst);

            if current >= new_state as u8 {
                return;
            }

            if self
                .state
                .compare_exchange(current, new_state as u8, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.finish_futures_up_to(new_state);
                return;
            }
        }
    }

    /// Mark the checkpoint as failed: records the cause and transits to
    /// [`CheckpointState::Finished`], failing every pending state future.
    pub fn fail(&self, cause: GridError) {
        *self.fail_cause.lock() = Some(cause);
        self.transit_to(CheckpointState::Finished);
    }

    pub fn fail_cause(&self) -> Option<GridError> {
        self.fail_cause.lock().clone()
    }

    /// Completion handle for `state`, created lazily. Already-reached
    /// states resolve synchronously.
    pub fn future_for(&self, state: CheckpointState) -> CheckpointFuture {
        let future = self.futures[state.ordinal()]
            .get_or_init(CheckpointFuture::new)
            .clone();

        if self.greater_or_equal_to(state) && !future.is_done() {
            future.complete(self.fail_cause.lock().clone());
        }

        future
    }

    /// Run `callback` when the progress reaches `state` without error.
    pub fn on_state_changed<F: FnOnce() + Send + 'static>(
        &self,
        state: CheckpointState,
        callback: F,
    ) {
        self.future_for(state).on_done(callback);
    }

    fn finish_futures_up_to(&self, last: CheckpointState) {
        let cause = self.fail_cause.lock().clone();

        for state in CheckpointState::ALL {
            if let Some(future) = self.futures[state.ordinal()].get() {
                if !future.is_done() {
                    future.complete(cause.clone());
                }
            }

            if state == last {
                return;
            }
        }
    }

    /// Install fresh page counters for a run over `pages` pages.
    pub fn init_counters(&self, pages: usize) {
        self.current_pages.store(pages, Ordering::SeqCst);
        *self.counters.write() = Some(Arc::new(PageCounters::new()));
    }

    /// Release the counters after the checkpoint finished.
    pub fn clear_counters(&self) {
        self.current_pages.store(0, Ordering::SeqCst);
        *self.counters.write() = None;
    }

    pub fn current_checkpoint_pages(&self) -> usize {
        self.current_pages.load(Ordering::SeqCst)
    }

    pub fn written_pages(&self) -> Option<u64> {
        self.counters
            .read()
            .as_ref()
            .map(|c| c.written.load(Ordering::SeqCst))
    }

    pub fn synced_pages(&self) -> Option<u64> {
        self.counters
            .read()
            .as_ref()
            .map(|c| c.synced.load(Ordering::SeqCst))
    }

    pub fn evicted_pages(&self) -> Option<u64> {
        self.counters
            .read()
            .as_ref()
            .map(|c| c.evicted.load(Ordering::SeqCst))
    }

    pub fn recovery_pages(&self) -> Option<u64> {
        self.counters
            .read()
            .as_ref()
            .map(|c| c.recovery.load(Ordering::SeqCst))
    }

    /// Counters must be installed while pages are written.
    pub fn update_written_pages(&self, delta: u64) {
        assert!(delta > 0, "delta must be positive");

        let counters = self.counters.read();
        counters
            .as_ref()
            .expect("page counters are not initialized")
            .written
            .fetch_add(delta, Ordering::SeqCst);
    }

    pub fn update_synced_pages(&self, delta: u64) {
        assert!(delta > 0, "delta must be positive");

        let counters = self.counters.read();
        counters
            .as_ref()
            .expect("page counters are not initialized")
            .synced
            .fetch_add(delta, Ordering::SeqCst);
    }

    /// No-op once the counters are cleared: evictions can race the end of
    /// the checkpoint.
    pub fn update_evicted_pages(&self, delta: u64) {
        assert!(delta > 0, "delta must be positive");

        if let Some(counters) = self.counters.read().as_ref() {
            counters.evicted.fetch_add(delta, Ordering::SeqCst);
        }
    }

    /// No-op once the counters are cleared, like eviction updates.
    pub fn update_recovery_pages(&self, delta: u64) {
        assert!(delta > 0, "delta must be positive");

        if let Some(counters) = self.counters.read().as_ref() {
            counters.recovery.fetch_add(delta, Ordering::SeqCst);
        }
    }

    pub fn destroy_queue(&self) -> &PartitionDestroyQueue {
        &self.destroy_queue
    }

    pub fn next_wakeup(&self) -> Instant {
        *self.wakeup_deadline.lock()
    }

    pub fn schedule_wakeup(&self, delay: Duration) {
        *self.wakeup_deadline.lock() = Instant::now() + delay.min(MAX_WAKEUP_DELAY);
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    pub fn set_reason(&self, reason: impl Into<String>) {
        *self.reason.lock() = Some(reason.into());
    }
}

impl std::fmt::Debug for CheckpointProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointProgress")
            .field("state", &self.state())
            .field("pages", &self.current_checkpoint_pages())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_monotone() {
        let progress = CheckpointProgress::new(Duration::from_secs(1));

        progress.transit_to(CheckpointState::LockReleased);
        assert_eq!(progress.state(), CheckpointState::LockReleased);

        // Backward transition is a no-op.
        progress.transit_to(CheckpointState::LockTaken);
        assert_eq!(progress.state(), CheckpointState::LockReleased);
    }

    #[test]
    fn test_future_resolves_synchronously_when_reached() {
        let progress = CheckpointProgress::new(Duration::from_secs(1));
        progress.transit_to(CheckpointState::PagesSnapshotted);

        let future = progress.future_for(CheckpointState::LockTaken);
        assert!(future.is_done());
        assert!(future.error().is_none());
    }

    #[test]
    fn test_counters_lifecycle() {
        let progress = CheckpointProgress::new(Duration::from_secs(1));

        assert!(progress.written_pages().is_none());

        progress.init_counters(100);
        progress.update_written_pages(3);
        progress.update_evicted_pages(1);
        assert_eq!(progress.written_pages(), Some(3));
        assert_eq!(progress.evicted_pages(), Some(1));
        assert_eq!(progress.current_checkpoint_pages(), 100);

        progress.clear_counters();
        assert!(progress.written_pages().is_none());
        assert_eq!(progress.current_checkpoint_pages(), 0);

        // Cleared counters ignore eviction updates.
        progress.update_evicted_pages(1);
    }

    #[test]
    #[should_panic(expected = "page counters are not initialized")]
    fn test_written_update_requires_counters() {
        let progress = CheckpointProgress::new(Duration::from_secs(1));
        progress.update_written_pages(1);
    }

    #[test]
    fn test_on_state_changed_skipped_on_failure() {
        let progress = CheckpointProgress::new(Duration::from_secs(1));
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let fired_clone = fired.clone();
        progress.on_state_changed(CheckpointState::Finished, move || {
            fired_clone.store(true, Ordering::SeqCst);
        });

        progress.fail(GridError::CheckpointFailed("disk full".to_string()));
        assert!(!fired.load(Ordering::SeqCst));
        assert!(progress
            .future_for(CheckpointState::Finished)
            .error()
            .is_some());
    }
}
