use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Task is not deployed or was redeployed since task execution: {0}")]
    DeploymentMissing(String),

    #[error("Failed to deserialize task attributes: {0}")]
    DeserializationFailed(String),

    #[error("Job was rejected before execution: {0}")]
    ExecutionRejected(String),

    #[error("Failed partition reservation, partition is not primary on this node: {0}")]
    PartitionsLost(String),

    #[error("Node that originated task execution has left grid: {0}")]
    MasterNodeLeft(Uuid),

    #[error("Job timed out: {0}")]
    Timeout(Uuid),

    #[error("Buffer can't be used after close")]
    Closed,

    #[error("Position is out of range: {0}")]
    OutOfRange(String),

    #[error("I/O error: {0}")]
    IoFailed(#[from] std::io::Error),

    #[error("Checkpoint failed: {0}")]
    CheckpointFailed(String),

    #[error("Node has left grid: {0}")]
    NodeLeft(Uuid),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Clone for GridError {
    fn clone(&self) -> Self {
        match self {
            Self::DeploymentMissing(s) => Self::DeploymentMissing(s.clone()),
            Self::DeserializationFailed(s) => Self::DeserializationFailed(s.clone()),
            Self::ExecutionRejected(s) => Self::ExecutionRejected(s.clone()),
            Self::PartitionsLost(s) => Self::PartitionsLost(s.clone()),
            Self::MasterNodeLeft(id) => Self::MasterNodeLeft(*id),
            Self::Timeout(id) => Self::Timeout(*id),
            Self::Closed => Self::Closed,
            Self::OutOfRange(s) => Self::OutOfRange(s.clone()),
            // std::io::Error is not Clone; carry the description forward.
            Self::IoFailed(e) => Self::Internal(format!("I/O error: {e}")),
            Self::CheckpointFailed(s) => Self::CheckpointFailed(s.clone()),
            Self::NodeLeft(id) => Self::NodeLeft(*id),
            Self::Internal(s) => Self::Internal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, GridError>;
