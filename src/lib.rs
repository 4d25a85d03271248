//! # Caravel motion execution state
//!
//! This crate is the motion service's execution subsystem: it accepts
//! long-running move requests for a component, drives each one through a
//! plan/execute/replan loop, and keeps a queryable history of every plan and
//! status transition.
//!
//! ## Architecture
//!
//! ```text
//!  start_execution ──► ExecutionState ◄── plan_history / list_plan_statuses
//!                          │   ▲
//!                  spawns  │   │ notifications
//!                          ▼   │
//!                     ExecutionRunner ──► PlannerExecutor (plan / execute)
//!                          │                    ▲
//!                          └── watchers ────────┘  (replan probes)
//! ```
//!
//! The [`state::ExecutionState`] store owns all history and enforces the
//! invariants: at most one active execution per component, immutable plans,
//! sticky terminal statuses, and TTL eviction of long-terminal executions.
//! Each execution gets a runner worker that builds planner/executors through
//! the caller's [`executor::PlanExecutorFactory`], dispatches the execute
//! call, and polls the drift and obstacle probes, replanning under the same
//! execution when a probe or the executor asks for it.
//!
//! Cancellation forms a tree of scopes: the store's root scope covers every
//! execution scope ([`state::ExecutionState::stop_all`]), each execution
//! scope covers one runner
//! ([`state::ExecutionState::stop_execution_by_resource`]), and every plan
//! attempt gets an independent executor scope so an interrupted execute call
//! never disturbs the bookkeeping that follows.
//!
//! Planning algorithms, kinematics and transports live elsewhere; this crate
//! only sees them through the factory contract.

pub mod config;
pub mod error;
pub mod executor;
pub mod plan;
pub mod resource;
pub mod spatial;
pub mod state;

mod execution;
mod watcher;


pub use config::{MotionConfig, PollingConfig, StateConfig};
pub use error::{MotionError, Result};
pub use executor::{
    ExecuteResponse, JointPositions, PlanExecutorFactory, PlanResponse, PlannerExecutor,
    Trajectory, Waypoints,
};
pub use plan::{
    ExecutionId, ListPlanStatusesReq, Plan, PlanHistoryReq, PlanId, PlanState, PlanStatus,
    PlanStatusWithId, PlanStep, PlanWithStatus,
};
pub use resource::ComponentName;
pub use spatial::{GeoPoint, GeoPose, OrientationVector, Pose, Vector3};
pub use state::ExecutionState;
