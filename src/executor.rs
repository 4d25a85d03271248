//! Contracts between the execution runner and the motion planner/executor.
//!
//! The planner and the kinematic driver are external; the runner only sees
//! the two traits below. A factory builds a fresh [`PlannerExecutor`] per
//! plan attempt; the product plans once and executes once, and optionally
//! exposes the replan probes driven by the polling watchers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::PollingConfig;
use crate::plan::PlanStep;
use crate::spatial::GeoPose;

/// Joint-space configuration of one component at one point in a trajectory.
pub type JointPositions = Vec<f64>;

/// The inputs an executor consumes, ordered start to goal.
pub type Waypoints = Vec<JointPositions>;

/// Planner-native trajectory, handed back as the seed when replanning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory(pub Vec<JointPositions>);

/// Successful response from [`PlannerExecutor::plan`].
#[derive(Debug, Clone, Default)]
pub struct PlanResponse {
    pub waypoints: Waypoints,
    pub trajectory: Trajectory,
    /// Geo poses per step, present for globe-referenced plans. When
    /// non-empty, must be parallel to `poses_by_component`.
    pub geo_poses: Vec<GeoPose>,
    pub poses_by_component: Vec<PlanStep>,
}

/// Successful response from [`PlannerExecutor::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteResponse {
    /// True when the executor stopped short of the goal and the runner
    /// should replan. False with no error means the request succeeded.
    pub replan: bool,
    /// Why replanning was requested, when the executor knows.
    pub replan_reason: Option<String>,
}

/// A single plan attempt's planner and executor.
///
/// All methods must return promptly once the cancellation token passed to
/// the factory fires.
#[async_trait]
pub trait PlannerExecutor: Send + Sync {
    /// Produce waypoints for the request this object was built for.
    async fn plan(&self) -> anyhow::Result<PlanResponse>;

    /// Drive the component through `waypoints`.
    async fn execute(&self, waypoints: Waypoints) -> anyhow::Result<ExecuteResponse>;

    /// Cadence for the replan watchers. Zero disables a watcher; the
    /// default disables both.
    fn polling(&self) -> PollingConfig {
        PollingConfig::disabled()
    }

    /// Whether the component has drifted off the active plan far enough to
    /// require replanning.
    async fn position_needs_replan(&self) -> anyhow::Result<bool> {
        Ok(false)
    }

    /// Whether newly observed obstacles intersect the active plan.
    async fn obstacles_need_replan(&self) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Builds a fresh planner/executor per plan attempt.
///
/// `cancel` is the executor-scope token for the attempt: once it fires, the
/// product's in-flight calls must terminate. `seed` is the previous
/// trajectory when replanning; `replan_count` is zero on the first attempt.
/// The request type `R` is opaque to the runner.
#[async_trait]
pub trait PlanExecutorFactory<R>: Send + Sync {
    async fn build(
        &self,
        cancel: CancellationToken,
        req: &R,
        seed: Option<Trajectory>,
        replan_count: u32,
    ) -> anyhow::Result<Arc<dyn PlannerExecutor>>;
}
