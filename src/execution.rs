//! The per-execution runner.
//!
//! One runner worker drives an execution from its first plan to a terminal
//! state. Each iteration dispatches the executor in a detached task and
//! waits on three stimuli at once: execution-scope cancellation (external
//! stop), the execute result, and the replan watchers. Every outcome is
//! translated into a store notification; runner workers never propagate
//! errors up a call stack.
//!
//! Two cancellation scopes are in play. The execution scope is a child of
//! the store's root scope and only fires on external stop. Each plan attempt
//! additionally gets an independent executor scope, handed to the factory,
//! so that interrupting the in-flight execute call (on replan or teardown)
//! never disturbs the store notifications that follow.

use std::sync::Arc;

use anyhow::ensure;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::executor::{
    ExecuteResponse, PlanExecutorFactory, PlanResponse, PlannerExecutor, Trajectory, Waypoints,
};
use crate::plan::{ExecutionId, Plan, PlanId, PlanStatus, PlanStep};
use crate::resource::ComponentName;
use crate::state::ExecutionState;
use crate::watcher::{spawn_replan_watcher, WatcherKind, WatcherVerdict};

/// Reason recorded when an executor requests a replan without providing one.
const DEFAULT_REPLAN_REASON: &str = "replan triggered";

pub(crate) struct ExecutionRunner<R, F> {
    id: ExecutionId,
    component_name: ComponentName,
    state: Arc<ExecutionState>,
    /// Execution scope; fires on stop_execution_by_resource or stop_all.
    cancel: CancellationToken,
    req: R,
    factory: F,
}

/// One plan attempt: the recorded plan plus the executor that will run it.
pub(crate) struct PlanAttempt {
    pub(crate) plan: Plan,
    executor: Arc<dyn PlannerExecutor>,
    waypoints: Waypoints,
    trajectory: Trajectory,
    /// Executor scope; cancelled on replan decisions and attempt teardown.
    cancel: CancellationToken,
}

enum AttemptOutcome {
    Stopped,
    Succeeded,
    Failed(String),
    Replan(String),
}

impl<R, F> ExecutionRunner<R, F>
where
    R: Send + Sync + 'static,
    F: PlanExecutorFactory<R> + 'static,
{
    pub(crate) fn new(
        id: ExecutionId,
        component_name: ComponentName,
        state: Arc<ExecutionState>,
        cancel: CancellationToken,
        req: R,
        factory: F,
    ) -> Self {
        Self {
            id,
            component_name,
            state,
            cancel,
            req,
            factory,
        }
    }

    /// Builds the next planner/executor and produces its plan. `seed` is the
    /// previous trajectory when replanning.
    pub(crate) async fn plan_attempt(
        &self,
        seed: Option<Trajectory>,
        replan_count: u32,
    ) -> anyhow::Result<PlanAttempt> {
        let cancel = CancellationToken::new();
        let executor = self
            .factory
            .build(cancel.clone(), &self.req, seed, replan_count)
            .await?;
        let response = executor.plan().await?;
        let steps = steps_from_response(&response)?;
        let plan = Plan {
            id: PlanId::new(),
            execution_id: self.id,
            component_name: self.component_name.clone(),
            steps,
        };
        Ok(PlanAttempt {
            plan,
            executor,
            waypoints: response.waypoints,
            trajectory: response.trajectory,
            cancel,
        })
    }

    /// Drives the execution to a terminal state. Exit conditions: external
    /// stop, execution success, execution failure, or a failed replan.
    pub(crate) async fn run(self, first: PlanAttempt) {
        let mut attempt = first;
        let mut replan_count: u32 = 0;
        loop {
            match self.run_attempt(&attempt).await {
                AttemptOutcome::Stopped => {
                    self.notify_plan_stopped(&attempt.plan).await;
                    attempt.cancel.cancel();
                    return;
                }
                AttemptOutcome::Succeeded => {
                    self.notify_plan_succeeded(&attempt.plan).await;
                    return;
                }
                AttemptOutcome::Failed(reason) => {
                    self.notify_plan_failed(&attempt.plan, reason).await;
                    return;
                }
                AttemptOutcome::Replan(reason) => {
                    replan_count += 1;
                    match self
                        .plan_attempt(Some(attempt.trajectory.clone()), replan_count)
                        .await
                    {
                        Ok(next) => {
                            debug!(
                                execution_id = %self.id,
                                retired_plan = %attempt.plan.id,
                                new_plan = %next.plan.id,
                                reason = %reason,
                                replan_count,
                                "replanning"
                            );
                            self.notify_plan_failed(&attempt.plan, reason).await;
                            self.notify_new_plan(&next.plan).await;
                            attempt = next;
                        }
                        Err(err) => {
                            warn!(
                                execution_id = %self.id,
                                component = %self.component_name,
                                plan_id = %attempt.plan.id,
                                replan_reason = %reason,
                                error = %err,
                                "replanning failed, marking previous plan failed"
                            );
                            self.notify_plan_failed(&attempt.plan, err.to_string()).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Runs one attempt's execute call alongside its watchers and waits for
    /// whichever stimulus resolves first.
    async fn run_attempt(&self, attempt: &PlanAttempt) -> AttemptOutcome {
        let (verdict_tx, mut verdict_rx) = mpsc::channel::<WatcherVerdict>(2);
        let mut watchers = JoinSet::new();
        let polling = attempt.executor.polling();
        if let Some(period) = polling.position_period() {
            spawn_replan_watcher(
                &mut watchers,
                WatcherKind::Position,
                period,
                Arc::clone(&attempt.executor),
                attempt.cancel.clone(),
                verdict_tx.clone(),
            );
        }
        if let Some(period) = polling.obstacle_period() {
            spawn_replan_watcher(
                &mut watchers,
                WatcherKind::Obstacle,
                period,
                Arc::clone(&attempt.executor),
                attempt.cancel.clone(),
                verdict_tx.clone(),
            );
        }
        // With no watchers the channel closes here and its select branch
        // disables itself.
        drop(verdict_tx);

        let executor = Arc::clone(&attempt.executor);
        let waypoints = attempt.waypoints.clone();
        let mut execute = tokio::spawn(async move { executor.execute(waypoints).await });
        let mut execute_done = false;

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => AttemptOutcome::Stopped,
            result = &mut execute => {
                execute_done = true;
                if attempt.cancel.is_cancelled() {
                    // A watcher interrupted this attempt; its verdict, not
                    // the interrupted execute result, decides the outcome.
                    match verdict_rx.recv().await {
                        Some(verdict) => outcome_from_verdict(verdict),
                        None => outcome_from_execute(result),
                    }
                } else {
                    outcome_from_execute(result)
                }
            }
            Some(verdict) = verdict_rx.recv() => outcome_from_verdict(verdict),
        };

        if matches!(outcome, AttemptOutcome::Stopped) {
            // External stop: the caller notifies the store before cancelling
            // the executor scope, and the detached execute task unwinds
            // under that cancellation on its own. The watchers cannot wait
            // for the scope, so they are aborted and drained here.
            watchers.abort_all();
            while watchers.join_next().await.is_some() {}
            return outcome;
        }

        attempt.cancel.cancel();
        if !execute_done {
            let _ = execute.await;
        }
        while watchers.join_next().await.is_some() {}
        outcome
    }

    async fn notify_plan_stopped(&self, plan: &Plan) {
        self.state
            .update_plan_status(
                &self.component_name,
                self.id,
                plan.id,
                PlanStatus::stopped(Utc::now()),
            )
            .await;
    }

    async fn notify_plan_succeeded(&self, plan: &Plan) {
        self.state
            .update_plan_status(
                &self.component_name,
                self.id,
                plan.id,
                PlanStatus::succeeded(Utc::now()),
            )
            .await;
    }

    async fn notify_plan_failed(&self, plan: &Plan, reason: String) {
        self.state
            .update_plan_status(
                &self.component_name,
                self.id,
                plan.id,
                PlanStatus::failed(Utc::now(), reason),
            )
            .await;
    }

    async fn notify_new_plan(&self, plan: &Plan) {
        self.state.push_new_plan(plan.clone(), Utc::now()).await;
    }
}

fn outcome_from_execute(
    result: Result<anyhow::Result<ExecuteResponse>, JoinError>,
) -> AttemptOutcome {
    match result {
        Ok(Ok(response)) if response.replan => {
            let reason = response
                .replan_reason
                .filter(|reason| !reason.is_empty())
                .unwrap_or_else(|| DEFAULT_REPLAN_REASON.to_string());
            AttemptOutcome::Replan(reason)
        }
        Ok(Ok(_)) => AttemptOutcome::Succeeded,
        Ok(Err(err)) => AttemptOutcome::Failed(err.to_string()),
        Err(err) => AttemptOutcome::Failed(format!("execute task failed: {err}")),
    }
}

fn outcome_from_verdict(verdict: WatcherVerdict) -> AttemptOutcome {
    match verdict {
        WatcherVerdict::Replan(kind) => AttemptOutcome::Replan(kind.replan_reason().to_string()),
        WatcherVerdict::Failed(reason) => AttemptOutcome::Failed(reason),
    }
}

/// Assembles the recorded plan steps from a planner response. Geo poses,
/// when present, must be parallel to the component poses and are embedded
/// into the step poses; empty steps are skipped.
pub(crate) fn steps_from_response(response: &PlanResponse) -> anyhow::Result<Vec<PlanStep>> {
    if response.geo_poses.is_empty() {
        return Ok(response.poses_by_component.clone());
    }
    ensure!(
        response.geo_poses.len() == response.poses_by_component.len(),
        "geo poses (len: {}) and poses by component (len: {}) must have the same length",
        response.geo_poses.len(),
        response.poses_by_component.len()
    );
    let mut steps = Vec::with_capacity(response.poses_by_component.len());
    for (geo_pose, step) in response.geo_poses.iter().zip(&response.poses_by_component) {
        let Some((component, _)) = step.target() else {
            continue;
        };
        steps.push(PlanStep::single(component.clone(), geo_pose.to_pose()));
    }
    Ok(steps)
}
