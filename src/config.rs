use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default bound for the finished-jobs history and the cancel-request map.
pub const DEFAULT_JOBS_HISTORY_SIZE: usize = 10_240;

/// Default failure detection timeout, also the default worker interrupt timeout.
pub const DEFAULT_FAILURE_DETECTION_TIMEOUT_MS: u64 = 10_000;

/// Default in-memory limit before a LOB buffer spills to a temporary file.
pub const DEFAULT_MAX_MEMORY_BUFFER_BYTES: u64 = 512 * 1024;

#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Bound for the finished-jobs set and the cancel-request map.
    pub jobs_history_size: usize,
    /// Network timeout for request/reply exchanges such as sibling requests.
    pub network_timeout_ms: u64,
    /// Failure detection timeout, used as the interrupt-timeout fallback.
    pub failure_detection_timeout_ms: u64,
    /// Concurrency limit of the default job execution pool.
    pub default_pool_size: usize,
    /// Named executor pools with their concurrency limits.
    pub custom_pools: HashMap<String, usize>,
    /// In-memory size limit of LOB buffers before they spill to disk.
    pub max_memory_buffer_bytes: u64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            jobs_history_size: DEFAULT_JOBS_HISTORY_SIZE,
            network_timeout_ms: 5_000,
            failure_detection_timeout_ms: DEFAULT_FAILURE_DETECTION_TIMEOUT_MS,
            default_pool_size: 64,
            custom_pools: HashMap::new(),
            max_memory_buffer_bytes: DEFAULT_MAX_MEMORY_BUFFER_BYTES,
        }
    }
}

impl GridConfig {
    pub fn with_pool(mut self, name: impl Into<String>, size: usize) -> Self {
        self.custom_pools.insert(name.into(), size);
        self
    }
}

/// A long-valued property that can be updated at runtime through the
/// distributed configuration channel. Readers see updates immediately.
///
/// A value of zero means "unset"; readers fall back to the supplied default.
#[derive(Debug, Clone)]
pub struct DistributedLongProperty {
    name: &'static str,
    value: Arc<AtomicU64>,
}

impl DistributedLongProperty {
    pub fn detached(name: &'static str) -> Self {
        Self {
            name,
            value: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn update(&self, new_value: u64) {
        let old = self.value.swap(new_value, Ordering::SeqCst);
        tracing::info!(
            property = self.name,
            old,
            new = new_value,
            "Distributed property was changed"
        );
    }

    pub fn get_or_default(&self, default: u64) -> u64 {
        match self.value.load(Ordering::SeqCst) {
            0 => default,
            v => v,
        }
    }
}
