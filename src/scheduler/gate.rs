use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Writer-preferring stop gate guarding every public scheduler entry point.
///
/// Readers take the fast path: `try_enter` is two atomic operations and
/// never blocks. Sealing is one-way and happens once, at shutdown; after
/// `seal` every `try_enter` fails, which entry points interpret as "we are
/// stopping".
pub struct StopGate {
    sealed: AtomicBool,
    readers: AtomicUsize,
}

impl StopGate {
    pub fn new() -> Self {
        Self {
            sealed: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
        }
    }

    /// Enter as a reader. Fails once the gate has been sealed.
    pub fn try_enter(&self) -> Option<GateGuard<'_>> {
        if self.sealed.load(Ordering::SeqCst) {
            return None;
        }

        self.readers.fetch_add(1, Ordering::SeqCst);

        // The seal may have won the race; back out if so.
        if self.sealed.load(Ordering::SeqCst) {
            self.readers.fetch_sub(1, Ordering::SeqCst);
            return None;
        }

        Some(GateGuard { gate: self })
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Seal the gate and wait for in-flight readers to drain.
    pub async fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);

        while self.readers.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

impl Default for StopGate {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GateGuard<'a> {
    gate: &'a StopGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.readers.fetch_sub(1, Ordering::SeqCst);
    }
}
