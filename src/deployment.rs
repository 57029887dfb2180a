use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cluster::NodeId;
use crate::error::{GridError, Result};
use crate::scheduler::job::{ComputeJob, JobArgs};

/// How the originating node expects the executable artifact to be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentMode {
    Private,
    Isolated,
    Shared,
    Continuous,
}

/// Identity of a deployed artifact as carried in execute requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentMeta {
    pub mode: DeploymentMode,
    pub task_name: String,
    pub task_class: String,
    pub user_version: String,
    pub class_loader_id: Uuid,
    pub participants: Vec<NodeId>,
    /// Resolve against the local registry only.
    pub force_local: bool,
}

/// Creates job instances for the classes an artifact provides.
pub trait JobFactory: Send + Sync {
    fn create(&self, task_class: &str, args: &JobArgs) -> Result<Arc<dyn ComputeJob>>;
}

/// A resolved executable artifact with reference counting. `acquire` fails
/// once the artifact has been undeployed; the last `release` after
/// undeployment lets the registry reclaim it.
pub struct Deployment {
    class_loader_id: Uuid,
    user_version: String,
    local: bool,
    factory: Arc<dyn JobFactory>,
    refs: AtomicUsize,
    undeployed: AtomicBool,
}

impl Deployment {
    pub fn new(
        class_loader_id: Uuid,
        user_version: impl Into<String>,
        local: bool,
        factory: Arc<dyn JobFactory>,
    ) -> Self {
        Self {
            class_loader_id,
            user_version: user_version.into(),
            local,
            factory,
            refs: AtomicUsize::new(0),
            undeployed: AtomicBool::new(false),
        }
    }

    pub fn class_loader_id(&self) -> Uuid {
        self.class_loader_id
    }

    pub fn user_version(&self) -> &str {
        &self.user_version
    }

    pub fn local(&self) -> bool {
        self.local
    }

    pub fn acquire(&self) -> bool {
        if self.undeployed.load(Ordering::SeqCst) {
            return false;
        }

        self.refs.fetch_add(1, Ordering::SeqCst);

        // Undeploy may have won the race; back out if so.
        if self.undeployed.load(Ordering::SeqCst) {
            self.refs.fetch_sub(1, Ordering::SeqCst);
            return false;
        }

        true
    }

    pub fn release(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "deployment released more times than acquired");
    }

    pub fn undeploy(&self) {
        self.undeployed.store(true, Ordering::SeqCst);
    }

    /// Undeployed and no live references.
    pub fn obsolete(&self) -> bool {
        self.undeployed.load(Ordering::SeqCst) && self.refs.load(Ordering::SeqCst) == 0
    }

    /// Instantiate the job class this artifact provides.
    pub fn create_job(&self, task_class: &str, args: &JobArgs) -> Result<Arc<dyn ComputeJob>> {
        self.factory.create(task_class, args)
    }

    /// Decode bytes with this artifact's codec. Used for attributes,
    /// siblings and topology predicates shipped in serialized form.
    pub fn decode<T: serde::de::DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| GridError::DeserializationFailed(e.to_string()))
    }

    /// Decode attribute bytes with this artifact's codec.
    pub fn decode_attributes(&self, bytes: &[u8]) -> Result<HashMap<String, Value>> {
        self.decode(bytes)
    }
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("class_loader_id", &self.class_loader_id)
            .field("user_version", &self.user_version)
            .field("local", &self.local)
            .field("refs", &self.refs.load(Ordering::SeqCst))
            .finish()
    }
}

/// Artifact resolution, supplied by the host's code deployment layer.
pub trait DeploymentRegistry: Send + Sync {
    /// Resolve against locally registered artifacts only.
    fn local_deployment(&self, task_class: &str) -> Option<Arc<Deployment>>;

    /// Resolve by full deployment identity, possibly fetching from peers.
    fn global_deployment(&self, meta: &DeploymentMeta, origin: NodeId) -> Option<Arc<Deployment>>;

    /// Artifacts currently referenced by running tasks, scanned as a
    /// fallback when identity resolution fails.
    fn task_deployments(&self) -> Vec<Arc<Deployment>>;
}

/// Registry holding explicitly registered artifacts, keyed by task class.
#[derive(Default)]
pub struct InMemoryDeploymentRegistry {
    by_class: RwLock<HashMap<String, Arc<Deployment>>>,
}

impl InMemoryDeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_class: impl Into<String>, deployment: Arc<Deployment>) {
        self.by_class.write().insert(task_class.into(), deployment);
    }

    pub fn unregister(&self, task_class: &str) {
        if let Some(dep) = self.by_class.write().remove(task_class) {
            dep.undeploy();
        }
    }
}

impl DeploymentRegistry for InMemoryDeploymentRegistry {
    fn local_deployment(&self, task_class: &str) -> Option<Arc<Deployment>> {
        self.by_class.read().get(task_class).cloned()
    }

    fn global_deployment(&self, meta: &DeploymentMeta, _origin: NodeId) -> Option<Arc<Deployment>> {
        let by_class = self.by_class.read();

        if let Some(dep) = by_class.get(&meta.task_class) {
            if dep.user_version() == meta.user_version {
                return Some(dep.clone());
            }
        }

        None
    }

    fn task_deployments(&self) -> Vec<Arc<Deployment>> {
        self.by_class.read().values().cloned().collect()
    }
}
