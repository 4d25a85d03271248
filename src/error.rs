use thiserror::Error;

use crate::plan::ExecutionId;

pub type Result<T> = std::result::Result<T, MotionError>;

/// Errors surfaced by the motion execution state APIs.
#[derive(Debug, Error)]
pub enum MotionError {
    /// The component has never had an execution.
    #[error("unknown resource")]
    UnknownResource,

    /// The component or execution exists but the requested entity does not.
    #[error("not found")]
    NotFound,

    /// The cancellation cause recorded when an execution is stopped.
    #[error("execution stopped")]
    ExecutionStopped,

    /// The component already has an execution whose newest plan is in progress.
    #[error("there is already an active execution {0}")]
    AlreadyActive(ExecutionId),

    #[error("invalid motion configuration: {0}")]
    InvalidConfig(String),

    /// A planner/executor factory or its `plan` call failed. The underlying
    /// error is surfaced unchanged.
    #[error(transparent)]
    Planning(#[from] anyhow::Error),
}
