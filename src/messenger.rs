use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::NodeId;
use crate::error::{GridError, Result};
use crate::scheduler::job::{
    CancelRequest, ExecuteRequest, ExecuteResponse, SessionAttrRequest, SiblingsRequest,
    SiblingsResponse,
};

/// Message topics. The first four are well known; the rest are derived
/// per job or per request/reply exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Job execution requests.
    Job,
    /// Job cancellation requests.
    JobCancel,
    /// Sibling list requests.
    JobSiblings,
    /// Task-side traffic: results and session attribute updates.
    Task,
    /// Per-job reply topic, derived from the job id and the responding node.
    TaskResult { job_id: Uuid, node: NodeId },
    /// Per-exchange sibling reply topic, derived from the session id and a
    /// monotone local counter.
    SiblingsReply { session_id: Uuid, seq: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Execute(ExecuteRequest),
    Cancel(CancelRequest),
    SessionAttrs(SessionAttrRequest),
    ExecuteResult(ExecuteResponse),
    Siblings(SiblingsRequest),
    SiblingsReply(SiblingsResponse),
}

pub trait MessageListener: Send + Sync {
    fn on_message(&self, from: NodeId, msg: Message);
}

/// Ordered point-to-point messaging, supplied by the host's communication
/// layer. Implementations deliver each message to the listener registered
/// for `(destination, topic)`; `send_ordered` additionally preserves
/// per-(source, destination, topic) ordering.
pub trait Messenger: Send + Sync {
    fn add_listener(&self, topic: Topic, listener: Arc<dyn MessageListener>);

    fn remove_listener(&self, topic: &Topic);

    fn send_unordered(&self, to: NodeId, topic: Topic, msg: Message) -> Result<()>;

    /// `timeout_ms` bounds how long the message may wait for the ordered
    /// channel before being dropped.
    fn send_ordered(&self, to: NodeId, topic: Topic, msg: Message, timeout_ms: u64) -> Result<()>;
}

/// Shared listener registry for a set of in-process nodes.
#[derive(Default)]
pub struct LocalExchange {
    listeners: Mutex<HashMap<(NodeId, Topic), Arc<dyn MessageListener>>>,
}

impl LocalExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// In-process messenger. Delivery happens inline on the sender's task,
/// which trivially preserves the ordered-channel guarantee as long as a
/// sender issues its sends sequentially.
pub struct LocalMessenger {
    node: NodeId,
    exchange: Arc<LocalExchange>,
}

impl LocalMessenger {
    pub fn new(node: NodeId, exchange: Arc<LocalExchange>) -> Self {
        Self { node, exchange }
    }

    fn deliver(&self, to: NodeId, topic: Topic, msg: Message) -> Result<()> {
        let listener = self
            .exchange
            .listeners
            .lock()
            .get(&(to, topic.clone()))
            .cloned();

        match listener {
            Some(listener) => {
                listener.on_message(self.node, msg);
                Ok(())
            }
            None => Err(GridError::Internal(format!(
                "No listener registered [node={to}, topic={topic:?}]"
            ))),
        }
    }
}

impl Messenger for LocalMessenger {
    fn add_listener(&self, topic: Topic, listener: Arc<dyn MessageListener>) {
        self.exchange
            .listeners
            .lock()
            .insert((self.node, topic), listener);
    }

    fn remove_listener(&self, topic: &Topic) {
        self.exchange
            .listeners
            .lock()
            .remove(&(self.node, topic.clone()));
    }

    fn send_unordered(&self, to: NodeId, topic: Topic, msg: Message) -> Result<()> {
        self.deliver(to, topic, msg)
    }

    fn send_ordered(&self, to: NodeId, topic: Topic, msg: Message, _timeout_ms: u64) -> Result<()> {
        self.deliver(to, topic, msg)
    }
}
