//! End-to-end tests for the execution state store and runner.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use caravel_motion::{
    ComponentName, ExecuteResponse, ExecutionState, ListPlanStatusesReq, MotionError,
    PlanExecutorFactory, PlanHistoryReq, PlanResponse, PlanState, PlanStatusWithId, PlanStep,
    PlanWithStatus, PlannerExecutor, Pose, StateConfig, Trajectory, Waypoints,
};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Opaque move request as the platform would pass it through.
#[derive(Clone)]
struct MoveRequest {
    component_name: ComponentName,
}

fn request(name: &str) -> MoveRequest {
    MoveRequest {
        component_name: ComponentName::base(name),
    }
}

#[derive(Clone, Copy)]
enum ExecResult {
    Succeed,
    Replan(&'static str),
}

/// Scripted planner/executor: plans `steps` steps, then either responds
/// immediately, waits for a gate, or blocks until its scope is cancelled.
struct ScriptedExecutor {
    cancel: CancellationToken,
    component_name: ComponentName,
    steps: usize,
    plan_error: Option<&'static str>,
    gate: Option<Arc<Notify>>,
    block_until_cancel: bool,
    result: ExecResult,
}

impl ScriptedExecutor {
    fn new(cancel: CancellationToken, component_name: ComponentName) -> Self {
        Self {
            cancel,
            component_name,
            steps: 1,
            plan_error: None,
            gate: None,
            block_until_cancel: false,
            result: ExecResult::Succeed,
        }
    }
}

#[async_trait]
impl PlannerExecutor for ScriptedExecutor {
    async fn plan(&self) -> anyhow::Result<PlanResponse> {
        if let Some(reason) = self.plan_error {
            return Err(anyhow!(reason));
        }
        Ok(PlanResponse {
            waypoints: vec![vec![0.0, 0.0]; self.steps],
            trajectory: Trajectory(vec![vec![0.0, 0.0]; self.steps]),
            geo_poses: Vec::new(),
            poses_by_component: (0..self.steps)
                .map(|_| PlanStep::single(self.component_name.clone(), Pose::default()))
                .collect(),
        })
    }

    async fn execute(&self, _waypoints: Waypoints) -> anyhow::Result<ExecuteResponse> {
        if self.block_until_cancel {
            self.cancel.cancelled().await;
            return Err(anyhow!("execute interrupted"));
        }
        if let Some(gate) = &self.gate {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(anyhow!("execute interrupted")),
                _ = gate.notified() => {}
            }
        }
        match self.result {
            ExecResult::Succeed => Ok(ExecuteResponse::default()),
            ExecResult::Replan(reason) => Ok(ExecuteResponse {
                replan: true,
                replan_reason: Some(reason.to_string()),
            }),
        }
    }
}

/// Factory scripted on the replan count.
struct ScriptedFactory<F>(F);

#[async_trait]
impl<F> PlanExecutorFactory<MoveRequest> for ScriptedFactory<F>
where
    F: Fn(CancellationToken, &MoveRequest, u32) -> ScriptedExecutor + Send + Sync,
{
    async fn build(
        &self,
        cancel: CancellationToken,
        req: &MoveRequest,
        _seed: Option<Trajectory>,
        replan_count: u32,
    ) -> anyhow::Result<Arc<dyn PlannerExecutor>> {
        Ok(Arc::new((self.0)(cancel, req, replan_count)))
    }
}

/// An executor that blocks until its scope is cancelled.
fn blocking_factory() -> ScriptedFactory<
    impl Fn(CancellationToken, &MoveRequest, u32) -> ScriptedExecutor + Send + Sync,
> {
    ScriptedFactory(|cancel, req: &MoveRequest, _count| {
        let mut executor = ScriptedExecutor::new(cancel, req.component_name.clone());
        executor.block_until_cancel = true;
        executor
    })
}

async fn wait_for_history<F>(
    state: &Arc<ExecutionState>,
    component: &ComponentName,
    predicate: F,
) -> Vec<PlanWithStatus>
where
    F: Fn(&[PlanWithStatus]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(history) = state
            .plan_history(PlanHistoryReq {
                component_name: component.clone(),
                ..Default::default()
            })
            .await
        {
            if predicate(&history) {
                return history;
            }
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for plan history condition"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_statuses<F>(state: &Arc<ExecutionState>, predicate: F) -> Vec<PlanStatusWithId>
where
    F: Fn(&[PlanStatusWithId]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let statuses = state
            .list_plan_statuses(ListPlanStatusesReq::default())
            .await;
        if predicate(&statuses) {
            return statuses;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for plan status condition"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn assert_timestamps_strictly_decrease(history: &[PlanWithStatus]) {
    for pws in history {
        for pair in pws.status_history.windows(2) {
            assert!(
                pair[0].timestamp > pair[1].timestamp,
                "status timestamps must strictly decrease from index 0"
            );
        }
    }
}

#[tokio::test]
async fn creating_and_stopping_a_state_with_no_executions() {
    init_tracing();
    let state = ExecutionState::new(StateConfig::default()).unwrap();
    assert!(state
        .list_plan_statuses(ListPlanStatusesReq::default())
        .await
        .is_empty());
    state.stop_all().await;
}

#[tokio::test]
async fn happy_path() {
    init_tracing();
    let state = ExecutionState::new(StateConfig::default()).unwrap();
    let req = request("mybase");
    let component = req.component_name.clone();
    let release = Arc::new(Notify::new());

    let gate = Arc::clone(&release);
    state
        .start_execution(
            component.clone(),
            req,
            ScriptedFactory(move |cancel, req: &MoveRequest, _count| {
                let mut executor = ScriptedExecutor::new(cancel, req.component_name.clone());
                executor.gate = Some(Arc::clone(&gate));
                executor
            }),
        )
        .await
        .unwrap();

    // While the executor is in flight there is one in-progress plan.
    let statuses = wait_for_statuses(&state, |statuses| statuses.len() == 1).await;
    assert_eq!(statuses[0].status.state, PlanState::InProgress);

    release.notify_one();
    let history = wait_for_history(&state, &component, |history| {
        history[0].status_history[0].state.is_terminal()
    })
    .await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status_history.len(), 2);
    assert_eq!(history[0].status_history[0].state, PlanState::Succeeded);
    assert_eq!(history[0].status_history[1].state, PlanState::InProgress);
    assert_timestamps_strictly_decrease(&history);

    state.stop_all().await;
}

#[tokio::test]
async fn stop_mid_flight_is_recorded_and_idempotent() {
    init_tracing();
    let state = ExecutionState::new(StateConfig::default()).unwrap();
    let req = request("mybase");
    let component = req.component_name.clone();

    state
        .start_execution(component.clone(), req, blocking_factory())
        .await
        .unwrap();

    state.stop_execution_by_resource(&component).await.unwrap();

    let history = state
        .plan_history(PlanHistoryReq {
            component_name: component.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status_history.len(), 2);
    assert_eq!(history[0].status_history[0].state, PlanState::Stopped);
    assert_eq!(history[0].status_history[0].reason, None);
    assert_eq!(history[0].status_history[1].state, PlanState::InProgress);
    assert_timestamps_strictly_decrease(&history);

    // Stopping an already-terminal execution still succeeds and changes
    // nothing.
    state.stop_execution_by_resource(&component).await.unwrap();
    let unchanged = state
        .plan_history(PlanHistoryReq {
            component_name: component.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(unchanged, history);

    state.stop_all().await;
}

#[tokio::test]
async fn replan_then_success() {
    init_tracing();
    let state = ExecutionState::new(StateConfig::default()).unwrap();
    let req = request("mybase");
    let component = req.component_name.clone();
    let first_release = Arc::new(Notify::new());
    let second_release = Arc::new(Notify::new());

    let gate0 = Arc::clone(&first_release);
    let gate1 = Arc::clone(&second_release);
    let execution_id = state
        .start_execution(
            component.clone(),
            req,
            ScriptedFactory(move |cancel, req: &MoveRequest, count| {
                let mut executor = ScriptedExecutor::new(cancel, req.component_name.clone());
                if count == 0 {
                    executor.gate = Some(Arc::clone(&gate0));
                    executor.result = ExecResult::Replan("drift");
                } else {
                    executor.gate = Some(Arc::clone(&gate1));
                }
                executor
            }),
        )
        .await
        .unwrap();

    first_release.notify_one();
    second_release.notify_one();

    let history = wait_for_history(&state, &component, |history| {
        history.len() == 2 && history[0].status_history[0].state.is_terminal()
    })
    .await;

    assert_eq!(history[0].plan.execution_id, execution_id);
    assert_eq!(history[1].plan.execution_id, execution_id);
    assert_ne!(history[0].plan.id, history[1].plan.id);
    assert_eq!(history[0].status_history[0].state, PlanState::Succeeded);
    assert_eq!(history[1].status_history[0].state, PlanState::Failed);
    assert_eq!(history[1].status_history[0].reason.as_deref(), Some("drift"));
    // Both plans' histories begin with InProgress.
    assert_eq!(
        history[0].status_history.last().unwrap().state,
        PlanState::InProgress
    );
    assert_eq!(
        history[1].status_history.last().unwrap().state,
        PlanState::InProgress
    );
    assert_timestamps_strictly_decrease(&history);

    state.stop_all().await;
}

#[tokio::test]
async fn failed_replanning() {
    init_tracing();
    let state = ExecutionState::new(StateConfig::default()).unwrap();
    let req = request("mybase");
    let component = req.component_name.clone();

    state
        .start_execution(
            component.clone(),
            req,
            ScriptedFactory(|cancel, req: &MoveRequest, count| {
                let mut executor = ScriptedExecutor::new(cancel, req.component_name.clone());
                match count {
                    0 => {
                        executor.steps = 1;
                        executor.result = ExecResult::Replan("replan triggered");
                    }
                    1 => {
                        executor.steps = 2;
                        executor.result = ExecResult::Replan("replan triggered");
                    }
                    _ => executor.plan_error = Some("replanning failed"),
                }
                executor
            }),
        )
        .await
        .unwrap();

    let history = wait_for_history(&state, &component, |history| {
        history.len() == 2 && history[0].status_history[0].state.is_terminal()
    })
    .await;

    assert_eq!(history[0].plan.steps.len(), 2);
    assert_eq!(history[0].status_history[0].state, PlanState::Failed);
    assert_eq!(
        history[0].status_history[0].reason.as_deref(),
        Some("replanning failed")
    );
    assert_eq!(history[1].plan.steps.len(), 1);
    assert_eq!(history[1].status_history[0].state, PlanState::Failed);
    assert_eq!(
        history[1].status_history[0].reason.as_deref(),
        Some("replan triggered")
    );

    state.stop_all().await;
}

#[tokio::test]
async fn overlapping_starts_are_rejected() {
    init_tracing();
    let state = ExecutionState::new(StateConfig::default()).unwrap();
    let req = request("mybase");
    let component = req.component_name.clone();

    let first_id = state
        .start_execution(component.clone(), req.clone(), blocking_factory())
        .await
        .unwrap();

    let err = state
        .start_execution(component.clone(), req.clone(), blocking_factory())
        .await
        .unwrap_err();
    assert!(matches!(err, MotionError::AlreadyActive(id) if id == first_id));

    // No state change from the rejected start.
    let history = state
        .plan_history(PlanHistoryReq {
            component_name: component.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].plan.execution_id, first_id);

    state.stop_execution_by_resource(&component).await.unwrap();

    let second_id = state
        .start_execution(component.clone(), req, blocking_factory())
        .await
        .unwrap();
    assert_ne!(second_id, first_id);

    state.stop_all().await;
}

#[tokio::test]
async fn ttl_evicts_terminal_executions_and_keeps_active_ones() {
    init_tracing();
    let state = ExecutionState::new(StateConfig {
        ttl: Duration::from_millis(100),
        ttl_check_interval: Duration::from_millis(10),
    })
    .unwrap();
    let req = request("mybase");
    let component = req.component_name.clone();

    let stopped_id = state
        .start_execution(component.clone(), req.clone(), blocking_factory())
        .await
        .unwrap();
    state.stop_execution_by_resource(&component).await.unwrap();

    let running_id = state
        .start_execution(component.clone(), req, blocking_factory())
        .await
        .unwrap();

    // Both executions are visible inside the TTL.
    let statuses = wait_for_statuses(&state, |statuses| statuses.len() == 2).await;
    assert_eq!(statuses[0].execution_id, running_id);
    assert_eq!(statuses[0].status.state, PlanState::InProgress);
    assert_eq!(statuses[1].execution_id, stopped_id);
    assert_eq!(statuses[1].status.state, PlanState::Stopped);

    tokio::time::sleep(Duration::from_millis(300)).await;

    let statuses = wait_for_statuses(&state, |statuses| statuses.len() == 1).await;
    assert_eq!(statuses[0].execution_id, running_id);
    assert_eq!(statuses[0].status.state, PlanState::InProgress);

    state.stop_all().await;
}

#[tokio::test]
async fn ttl_interleaves_across_components() {
    init_tracing();
    let state = ExecutionState::new(StateConfig {
        ttl: Duration::from_millis(100),
        ttl_check_interval: Duration::from_millis(10),
    })
    .unwrap();

    let req1 = request("mybase");
    let req2 = request("mybase2");
    let req3 = request("mybase3");

    let running1 = state
        .start_execution(req1.component_name.clone(), req1.clone(), blocking_factory())
        .await
        .unwrap();
    let running2 = state
        .start_execution(req2.component_name.clone(), req2.clone(), blocking_factory())
        .await
        .unwrap();
    let stopped3 = state
        .start_execution(req3.component_name.clone(), req3.clone(), blocking_factory())
        .await
        .unwrap();
    state
        .stop_execution_by_resource(&req3.component_name)
        .await
        .unwrap();

    // All three are visible inside the TTL, newest component first.
    let statuses = wait_for_statuses(&state, |statuses| statuses.len() == 3).await;
    assert_eq!(statuses[0].execution_id, stopped3);
    assert_eq!(statuses[1].execution_id, running2);
    assert_eq!(statuses[2].execution_id, running1);

    tokio::time::sleep(Duration::from_millis(300)).await;

    // The stopped execution ages out; the in-progress ones survive.
    let statuses = wait_for_statuses(&state, |statuses| statuses.len() == 2).await;
    assert_eq!(statuses[0].execution_id, running2);
    assert_eq!(statuses[1].execution_id, running1);
    assert!(statuses
        .iter()
        .all(|status| status.status.state == PlanState::InProgress));

    state.stop_all().await;
}

#[tokio::test]
async fn unknown_resource_errors() {
    init_tracing();
    let state = ExecutionState::new(StateConfig::default()).unwrap();
    let component = ComponentName::base("ghost");

    assert!(matches!(
        state.stop_execution_by_resource(&component).await,
        Err(MotionError::UnknownResource)
    ));
    assert!(matches!(
        state
            .plan_history(PlanHistoryReq {
                component_name: component,
                ..Default::default()
            })
            .await,
        Err(MotionError::UnknownResource)
    ));

    state.stop_all().await;
}

#[tokio::test]
async fn stop_all_is_idempotent_and_stops_running_executions() {
    init_tracing();
    let state = ExecutionState::new(StateConfig::default()).unwrap();
    let req = request("mybase");
    let component = req.component_name.clone();

    state
        .start_execution(component.clone(), req, blocking_factory())
        .await
        .unwrap();

    state.stop_all().await;
    state.stop_all().await;

    let history = state
        .plan_history(PlanHistoryReq {
            component_name: component.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(history[0].status_history[0].state, PlanState::Stopped);

    // Stopping a single execution after the state was stopped still
    // succeeds.
    state.stop_execution_by_resource(&component).await.unwrap();
}

#[tokio::test]
async fn start_after_stop_all_terminates_immediately() {
    init_tracing();
    let state = ExecutionState::new(StateConfig::default()).unwrap();
    let req = request("mybase");
    let component = req.component_name.clone();

    state.stop_all().await;

    // The execution scope is born cancelled, so the runner records Stopped
    // before the executor can finish.
    state
        .start_execution(component.clone(), req, blocking_factory())
        .await
        .unwrap();

    let history = wait_for_history(&state, &component, |history| {
        history[0].status_history[0].state.is_terminal()
    })
    .await;
    assert_eq!(history[0].status_history[0].state, PlanState::Stopped);
}

#[tokio::test]
async fn only_active_plans_lists_in_progress_executions_only() {
    init_tracing();
    let state = ExecutionState::new(StateConfig::default()).unwrap();
    let running = request("running");
    let finished = request("finished");

    let running_id = state
        .start_execution(
            running.component_name.clone(),
            running.clone(),
            blocking_factory(),
        )
        .await
        .unwrap();
    state
        .start_execution(
            finished.component_name.clone(),
            finished.clone(),
            blocking_factory(),
        )
        .await
        .unwrap();
    state
        .stop_execution_by_resource(&finished.component_name)
        .await
        .unwrap();

    let statuses = state
        .list_plan_statuses(ListPlanStatusesReq {
            only_active_plans: true,
        })
        .await;
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].execution_id, running_id);
    assert_eq!(statuses[0].component_name, running.component_name);
    assert_eq!(statuses[0].status.state, PlanState::InProgress);

    state.stop_all().await;
}
