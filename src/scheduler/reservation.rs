use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{GridError, Result};
use crate::scheduler::job::PartitionSpec;

/// Local partition lifecycle states as the cache topology reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Owning,
    Moving,
    Renting,
    Evicted,
}

/// Cache partition topology, supplied by the host's cache layer.
pub trait CacheTopology: Send + Sync {
    /// Whether the cache exists and has finished starting.
    fn cache_started(&self, cache_id: i32) -> bool;

    fn rebalance_enabled(&self, cache_id: i32) -> bool;

    fn replicated(&self, cache_id: i32) -> bool;

    fn partition_state(
        &self,
        cache_id: i32,
        partition: u32,
        topology_version: u64,
    ) -> Option<PartitionState>;

    /// Pin the partition against eviction. `false` when the partition is
    /// missing or already moving away.
    fn reserve_partition(&self, cache_id: i32, partition: u32, topology_version: u64) -> bool;

    fn release_partition(&self, cache_id: i32, partition: u32);

    /// Whether the local node is primary for the partition.
    fn is_primary(&self, cache_id: i32, partition: u32, topology_version: u64) -> bool;
}

/// Topology for nodes without a cache layer: every cache is started and
/// every partition is locally owned.
pub struct AllOwningTopology;

impl CacheTopology for AllOwningTopology {
    fn cache_started(&self, _cache_id: i32) -> bool {
        true
    }

    fn rebalance_enabled(&self, _cache_id: i32) -> bool {
        true
    }

    fn replicated(&self, _cache_id: i32) -> bool {
        false
    }

    fn partition_state(&self, _c: i32, _p: u32, _v: u64) -> Option<PartitionState> {
        Some(PartitionState::Owning)
    }

    fn reserve_partition(&self, _c: i32, _p: u32, _v: u64) -> bool {
        true
    }

    fn release_partition(&self, _c: i32, _p: u32) {}

    fn is_primary(&self, _c: i32, _p: u32, _v: u64) -> bool {
        true
    }
}

/// Pre-flight guard keeping the partitions a job touches locally owned for
/// the job's duration.
///
/// `reserve` walks the cache ids in order and releases everything it took
/// on any failure. A failure on a partition this node is no longer primary
/// for surfaces as [`GridError::PartitionsLost`]; any other failure is a
/// plain `false` and the job is expected to fail over.
pub struct PartitionReservation {
    topology: Arc<dyn CacheTopology>,
    spec: PartitionSpec,
    reserved: Mutex<Vec<i32>>,
}

impl PartitionReservation {
    pub fn new(topology: Arc<dyn CacheTopology>, spec: PartitionSpec) -> Self {
        Self {
            topology,
            spec,
            reserved: Mutex::new(Vec::new()),
        }
    }

    pub fn cache_ids(&self) -> &[i32] {
        &self.spec.cache_ids
    }

    pub fn partition(&self) -> u32 {
        self.spec.partition
    }

    pub fn reserve(&self) -> Result<bool> {
        let partition = self.spec.partition;
        let top_ver = self.spec.topology_version;

        for &cache_id in &self.spec.cache_ids {
            if !self.topology.cache_started(cache_id) {
                // Cache is gone or not deployed yet; the job fails over.
                self.release();
                return Ok(false);
            }

            if !self.topology.rebalance_enabled(cache_id) {
                continue;
            }

            if self.topology.replicated(cache_id) {
                // Replicated partitions are never evicted; owning state is
                // all that needs checking.
                let state = self.topology.partition_state(cache_id, partition, top_ver);

                if state != Some(PartitionState::Owning) {
                    return self.fail_reserve(cache_id);
                }

                continue;
            }

            let state = self.topology.partition_state(cache_id, partition, top_ver);

            if state != Some(PartitionState::Owning)
                || !self.topology.reserve_partition(cache_id, partition, top_ver)
            {
                return self.fail_reserve(cache_id);
            }

            self.reserved.lock().push(cache_id);

            // The partition may have started moving between the state check
            // and the reservation; re-read to close the window.
            if self.topology.partition_state(cache_id, partition, top_ver)
                != Some(PartitionState::Owning)
            {
                return self.fail_reserve(cache_id);
            }
        }

        Ok(true)
    }

    pub fn release(&self) {
        let partition = self.spec.partition;

        for cache_id in self.reserved.lock().drain(..) {
            self.topology.release_partition(cache_id, partition);
        }
    }

    fn fail_reserve(&self, cache_id: i32) -> Result<bool> {
        self.release();

        // Losing primary ownership means the topology moved under the job;
        // no failover target can satisfy the original mapping.
        if !self
            .topology
            .is_primary(cache_id, self.spec.partition, self.spec.topology_version)
        {
            return Err(GridError::PartitionsLost(format!(
                "partition={}, cache_id={cache_id}, topology_version={}",
                self.spec.partition, self.spec.topology_version
            )));
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTopology {
        started: HashSet<i32>,
        owning: HashSet<i32>,
        primary: HashSet<i32>,
        releases: AtomicUsize,
    }

    impl FakeTopology {
        fn new(started: &[i32], owning: &[i32], primary: &[i32]) -> Arc<Self> {
            Arc::new(Self {
                started: started.iter().copied().collect(),
                owning: owning.iter().copied().collect(),
                primary: primary.iter().copied().collect(),
                releases: AtomicUsize::new(0),
            })
        }
    }

    impl CacheTopology for FakeTopology {
        fn cache_started(&self, cache_id: i32) -> bool {
            self.started.contains(&cache_id)
        }

        fn rebalance_enabled(&self, _cache_id: i32) -> bool {
            true
        }

        fn replicated(&self, _cache_id: i32) -> bool {
            false
        }

        fn partition_state(&self, cache_id: i32, _p: u32, _v: u64) -> Option<PartitionState> {
            if self.owning.contains(&cache_id) {
                Some(PartitionState::Owning)
            } else {
                Some(PartitionState::Moving)
            }
        }

        fn reserve_partition(&self, cache_id: i32, _p: u32, _v: u64) -> bool {
            self.owning.contains(&cache_id)
        }

        fn release_partition(&self, _cache_id: i32, _p: u32) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }

        fn is_primary(&self, cache_id: i32, _p: u32, _v: u64) -> bool {
            self.primary.contains(&cache_id)
        }
    }

    fn spec(cache_ids: &[i32]) -> PartitionSpec {
        PartitionSpec {
            cache_ids: cache_ids.to_vec(),
            partition: 3,
            topology_version: 7,
        }
    }

    #[test]
    fn test_reserve_all_owning() {
        let topology = FakeTopology::new(&[1, 2], &[1, 2], &[1, 2]);
        let reservation = PartitionReservation::new(topology.clone(), spec(&[1, 2]));

        assert!(reservation.reserve().unwrap());

        reservation.release();
        assert_eq!(topology.releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_cache_returns_false() {
        let topology = FakeTopology::new(&[1], &[1], &[1, 2]);
        let reservation = PartitionReservation::new(topology, spec(&[1, 2]));

        assert!(!reservation.reserve().unwrap());
    }

    #[test]
    fn test_lost_primary_is_an_error() {
        // Cache 2 is not owning and this node is not primary for it.
        let topology = FakeTopology::new(&[1, 2], &[1], &[1]);
        let reservation = PartitionReservation::new(topology.clone(), spec(&[1, 2]));

        assert!(matches!(
            reservation.reserve(),
            Err(GridError::PartitionsLost(_))
        ));

        // The reservation taken on cache 1 was rolled back.
        assert_eq!(topology.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_not_owning_but_still_primary_fails_soft() {
        let topology = FakeTopology::new(&[1], &[], &[1]);
        let reservation = PartitionReservation::new(topology, spec(&[1]));

        assert!(!reservation.reserve().unwrap());
    }
}
