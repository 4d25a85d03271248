//! Plans, plan statuses and the request records of the observational APIs.

use std::collections::HashMap;
use std::fmt;

use anyhow::ensure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resource::ComponentName;
use crate::spatial::Pose;

/// Identifies one caller-initiated motion request across all of its plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies a single planner output within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a plan. Stopped, Succeeded and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanState {
    Unspecified,
    InProgress,
    Stopped,
    Succeeded,
    Failed,
}

impl PlanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Succeeded | Self::Failed)
    }
}

/// One entry in a plan's status timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStatus {
    pub state: PlanState,
    /// Present for failures: an execution error, a planning error, or the
    /// reason a replan retired the plan.
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl PlanStatus {
    pub(crate) fn in_progress(timestamp: DateTime<Utc>) -> Self {
        Self {
            state: PlanState::InProgress,
            reason: None,
            timestamp,
        }
    }

    pub(crate) fn stopped(timestamp: DateTime<Utc>) -> Self {
        Self {
            state: PlanState::Stopped,
            reason: None,
            timestamp,
        }
    }

    pub(crate) fn succeeded(timestamp: DateTime<Utc>) -> Self {
        Self {
            state: PlanState::Succeeded,
            reason: None,
            timestamp,
        }
    }

    pub(crate) fn failed(timestamp: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            state: PlanState::Failed,
            reason: Some(reason.into()),
            timestamp,
        }
    }
}

/// One step of a plan: the pose a single component should reach.
///
/// A step drives at most one component; the cardinality is enforced here so
/// downstream consumers never have to handle multi-component steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStep(HashMap<ComponentName, Pose>);

impl PlanStep {
    pub fn new(poses: HashMap<ComponentName, Pose>) -> anyhow::Result<Self> {
        ensure!(
            poses.len() <= 1,
            "plan step may reference at most one component, got {}",
            poses.len()
        );
        Ok(Self(poses))
    }

    pub fn single(component: ComponentName, pose: Pose) -> Self {
        Self(HashMap::from([(component, pose)]))
    }

    pub fn poses(&self) -> &HashMap<ComponentName, Pose> {
        &self.0
    }

    /// The step's component and pose, if the step is non-empty.
    pub fn target(&self) -> Option<(&ComponentName, &Pose)> {
        self.0.iter().next()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single planner output. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub execution_id: ExecutionId,
    pub component_name: ComponentName,
    pub steps: Vec<PlanStep>,
}

/// A plan together with its status timeline, newest status first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanWithStatus {
    pub plan: Plan,
    /// Newest first; timestamps strictly decrease from index 0.
    pub status_history: Vec<PlanStatus>,
}

/// A plan's newest status qualified with its owning execution and component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStatusWithId {
    pub execution_id: ExecutionId,
    pub component_name: ComponentName,
    pub plan_id: PlanId,
    pub status: PlanStatus,
}

/// Request record for [`crate::state::ExecutionState::plan_history`].
#[derive(Debug, Clone, Default)]
pub struct PlanHistoryReq {
    pub component_name: ComponentName,
    /// When set, return the history of this execution instead of the newest.
    pub execution_id: Option<ExecutionId>,
    /// When set, return only the newest plan.
    pub last_plan_only: bool,
}

/// Request record for [`crate::state::ExecutionState::list_plan_statuses`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ListPlanStatusesReq {
    /// When set, emit only plans whose newest status is in progress.
    pub only_active_plans: bool,
}
