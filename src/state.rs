//! The execution state store.
//!
//! [`ExecutionState`] is the process-wide registry of motion executions. It
//! tracks, per component, the execution history and each execution's
//! plan-status timeline, enforces the single-active-execution invariant,
//! evicts long-terminal executions on a TTL, and answers the observational
//! queries ([`plan_history`](ExecutionState::plan_history),
//! [`list_plan_statuses`](ExecutionState::list_plan_statuses)).
//!
//! All state lives behind one reader-writer lock. Runner notifications take
//! the write lock; queries take the read lock and return deep copies. An
//! execution and its initial in-progress plan are registered under a single
//! write acquisition so no reader can observe a plan-less execution.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::StateConfig;
use crate::error::{MotionError, Result};
use crate::execution::ExecutionRunner;
use crate::executor::PlanExecutorFactory;
use crate::plan::{
    ExecutionId, ListPlanStatusesReq, Plan, PlanHistoryReq, PlanId, PlanStatus, PlanStatusWithId,
    PlanWithStatus,
};
use crate::resource::ComponentName;

/// Per-component execution bookkeeping.
#[derive(Default)]
struct ComponentState {
    /// Newest first.
    execution_ids: Vec<ExecutionId>,
    executions: HashMap<ExecutionId, ExecutionRecord>,
}

impl ComponentState {
    fn last_execution(&self) -> Option<&ExecutionRecord> {
        self.execution_ids
            .first()
            .and_then(|id| self.executions.get(id))
    }

    /// The newest execution, when its newest plan is still in a non-terminal
    /// state.
    fn active_execution(&self) -> Option<&ExecutionRecord> {
        let last = self.last_execution()?;
        let newest = last.history.first()?.status_history.first()?;
        (!newest.state.is_terminal()).then_some(last)
    }
}

/// Everything the store holds for one execution: identity, the handles
/// needed to stop it, and its plan history.
pub(crate) struct ExecutionRecord {
    pub(crate) id: ExecutionId,
    pub(crate) component_name: ComponentName,
    pub(crate) created_at: DateTime<Utc>,
    /// Execution scope; a child of the store's root scope.
    pub(crate) cancel: CancellationToken,
    /// Tracks the execution's runner worker.
    pub(crate) workers: TaskTracker,
    /// Newest plan first.
    pub(crate) history: Vec<PlanWithStatus>,
}

/// The motion service's execution state store.
pub struct ExecutionState {
    components: RwLock<HashMap<ComponentName, ComponentState>>,
    /// Root cancellation scope; every execution scope derives from it.
    cancel: CancellationToken,
    /// Tracks every runner worker plus the TTL sweeper.
    workers: TaskTracker,
    ttl: chrono::Duration,
}

impl ExecutionState {
    /// Creates a store and spawns its TTL sweeper. Must be called from
    /// within a Tokio runtime.
    pub fn new(config: StateConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let ttl = chrono::Duration::from_std(config.ttl)
            .map_err(|_| MotionError::InvalidConfig("ttl out of range".into()))?;

        let state = Arc::new(Self {
            components: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            workers: TaskTracker::new(),
            ttl,
        });
        state.workers.spawn(sweep_loop(
            Arc::downgrade(&state),
            state.cancel.clone(),
            config.ttl_check_interval,
        ));
        Ok(state)
    }

    /// Starts a new execution for `component_name`.
    ///
    /// Fails with [`MotionError::AlreadyActive`] if the component's newest
    /// execution still has an in-progress plan. The first plan is produced
    /// synchronously; if the factory or its `plan` call fails, the store is
    /// untouched and the error is surfaced unchanged. On success the
    /// execution and its initial in-progress plan are recorded and the
    /// runner worker takes over asynchronously.
    pub async fn start_execution<R, F>(
        self: &Arc<Self>,
        component_name: ComponentName,
        req: R,
        factory: F,
    ) -> Result<ExecutionId>
    where
        R: Send + Sync + 'static,
        F: PlanExecutorFactory<R> + 'static,
    {
        self.validate_no_active_execution(&component_name).await?;

        let id = ExecutionId::new();
        let exec_cancel = self.cancel.child_token();
        let exec_workers = TaskTracker::new();

        let runner = ExecutionRunner::new(
            id,
            component_name.clone(),
            Arc::clone(self),
            exec_cancel.clone(),
            req,
            factory,
        );

        let first = runner
            .plan_attempt(None, 0)
            .await
            .map_err(MotionError::Planning)?;

        let record = ExecutionRecord {
            id,
            component_name: component_name.clone(),
            created_at: Utc::now(),
            cancel: exec_cancel,
            workers: exec_workers.clone(),
            history: Vec::new(),
        };
        self.register_execution(record, first.plan.clone(), Utc::now())
            .await?;

        info!(execution_id = %id, component = %component_name, "started motion execution");

        self.workers
            .spawn(exec_workers.track_future(runner.run(first)));
        exec_workers.close();

        Ok(id)
    }

    /// Stops the newest execution of `component_name` and waits for its
    /// worker to drain. Idempotent: stopping an already-terminal execution
    /// succeeds without side effects.
    pub async fn stop_execution_by_resource(&self, component_name: &ComponentName) -> Result<()> {
        let (cancel, workers) = {
            let components = self.components.read().await;
            let cs = components
                .get(component_name)
                .ok_or(MotionError::UnknownResource)?;
            let last = cs.last_execution().ok_or(MotionError::NotFound)?;
            (last.cancel.clone(), last.workers.clone())
        };

        // Lock released while waiting: the runner's terminal notification
        // needs the write lock to land before its worker finishes.
        cancel.cancel();
        workers.wait().await;
        Ok(())
    }

    /// Cancels every execution and waits for all workers, the TTL sweeper
    /// included. Idempotent; after return no runner activity occurs.
    pub async fn stop_all(&self) {
        self.cancel.cancel();
        self.workers.close();
        self.workers.wait().await;
    }

    /// Returns the plans with statuses for a component.
    ///
    /// By default this is the full history of the newest execution. With
    /// `execution_id` set, the history of that execution instead. With
    /// `last_plan_only`, only the newest plan. Results are deep copies.
    pub async fn plan_history(&self, req: PlanHistoryReq) -> Result<Vec<PlanWithStatus>> {
        let components = self.components.read().await;
        let cs = components
            .get(&req.component_name)
            .ok_or(MotionError::UnknownResource)?;

        if req.last_plan_only {
            if let Some(last) = cs.last_execution() {
                if req.execution_id.is_none() || req.execution_id == Some(last.id) {
                    return Ok(last.history.first().cloned().into_iter().collect());
                }
            }
            // An execution id that is not the newest still resolves when known.
            if let Some(id) = req.execution_id {
                if let Some(execution) = cs.executions.get(&id) {
                    return Ok(execution.history.first().cloned().into_iter().collect());
                }
            }
            return Err(MotionError::NotFound);
        }

        if let Some(id) = req.execution_id {
            let execution = cs.executions.get(&id).ok_or(MotionError::NotFound)?;
            return Ok(execution.history.clone());
        }

        let last = cs.last_execution().ok_or(MotionError::NotFound)?;
        Ok(last.history.clone())
    }

    /// Lists the newest status of every plan still in history: newest
    /// component first (keyed by its newest execution's creation time), then
    /// executions newest first, then plans newest first. With
    /// `only_active_plans`, only each component's newest execution's newest
    /// plan when it is still in progress.
    pub async fn list_plan_statuses(&self, req: ListPlanStatusesReq) -> Vec<PlanStatusWithId> {
        let components = self.components.read().await;

        let mut ordered: Vec<&ComponentState> = components
            .values()
            .filter(|cs| cs.last_execution().is_some())
            .collect();
        ordered.sort_by_key(|cs| {
            std::cmp::Reverse(cs.last_execution().map(|execution| execution.created_at))
        });

        let mut statuses = Vec::new();
        for cs in ordered {
            if req.only_active_plans {
                if let Some(active) = cs.active_execution() {
                    if let Some((pws, status)) = active
                        .history
                        .first()
                        .and_then(|pws| Some((pws, pws.status_history.first()?)))
                    {
                        statuses.push(PlanStatusWithId {
                            execution_id: active.id,
                            component_name: active.component_name.clone(),
                            plan_id: pws.plan.id,
                            status: status.clone(),
                        });
                    }
                }
                continue;
            }

            for id in &cs.execution_ids {
                let Some(execution) = cs.executions.get(id) else {
                    error!(execution_id = %id, "execution id history references a missing execution, skipping");
                    continue;
                };
                for pws in &execution.history {
                    let Some(status) = pws.status_history.first() else {
                        continue;
                    };
                    statuses.push(PlanStatusWithId {
                        execution_id: execution.id,
                        component_name: execution.component_name.clone(),
                        plan_id: pws.plan.id,
                        status: status.clone(),
                    });
                }
            }
        }
        statuses
    }

    /// Fails with [`MotionError::AlreadyActive`] when the component's newest
    /// execution has a non-terminal newest plan.
    pub(crate) async fn validate_no_active_execution(&self, name: &ComponentName) -> Result<()> {
        let components = self.components.read().await;
        match components.get(name).and_then(|cs| cs.active_execution()) {
            Some(active) => Err(MotionError::AlreadyActive(active.id)),
            None => Ok(()),
        }
    }

    /// Registers a new execution together with its initial in-progress plan
    /// under one write acquisition.
    pub(crate) async fn register_execution(
        &self,
        mut record: ExecutionRecord,
        plan: Plan,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let mut components = self.components.write().await;
        let cs = components
            .entry(record.component_name.clone())
            .or_default();

        // Planning ran outside the lock; a racing start may have registered
        // in the meantime, so the single-active invariant is rechecked here.
        if let Some(active) = cs.active_execution() {
            return Err(MotionError::AlreadyActive(active.id));
        }

        record.history.insert(
            0,
            PlanWithStatus {
                plan,
                status_history: vec![PlanStatus::in_progress(timestamp)],
            },
        );
        let id = record.id;
        cs.execution_ids.insert(0, id);
        cs.executions.insert(id, record);
        Ok(())
    }

    /// Records a replan's new plan, initially in progress. The plan must
    /// belong to the component's newest execution; anything else is logged
    /// and dropped.
    pub(crate) async fn push_new_plan(&self, plan: Plan, timestamp: DateTime<Utc>) {
        let mut components = self.components.write().await;
        let Some(cs) = components.get_mut(&plan.component_name) else {
            error!(
                plan_id = %plan.id,
                component = %plan.component_name,
                "new plan for an unknown component, dropping"
            );
            return;
        };
        if cs.execution_ids.first() != Some(&plan.execution_id) {
            error!(
                plan_id = %plan.id,
                execution_id = %plan.execution_id,
                component = %plan.component_name,
                "new plan for an execution that is not the component's newest, dropping"
            );
            return;
        }
        let Some(execution) = cs.executions.get_mut(&plan.execution_id) else {
            error!(
                plan_id = %plan.id,
                execution_id = %plan.execution_id,
                "new plan for a missing execution, dropping"
            );
            return;
        };
        execution.history.insert(
            0,
            PlanWithStatus {
                plan,
                status_history: vec![PlanStatus::in_progress(timestamp)],
            },
        );
    }

    /// Appends a terminal status to an execution's newest plan. Non-terminal
    /// states, unknown targets, non-newest plans and plans that already
    /// reached a terminal state are logged and dropped; the store stays
    /// correct for everything else.
    pub(crate) async fn update_plan_status(
        &self,
        component_name: &ComponentName,
        execution_id: ExecutionId,
        plan_id: PlanId,
        status: PlanStatus,
    ) {
        if !status.state.is_terminal() {
            error!(
                %execution_id,
                %plan_id,
                state = ?status.state,
                "status update with a non-terminal state, dropping"
            );
            return;
        }
        let mut components = self.components.write().await;
        let Some(cs) = components.get_mut(component_name) else {
            error!(%execution_id, component = %component_name, "status update for an unknown component, dropping");
            return;
        };
        let Some(execution) = cs.executions.get_mut(&execution_id) else {
            error!(%execution_id, component = %component_name, "status update for an unknown execution, dropping");
            return;
        };
        let Some(newest) = execution.history.first_mut() else {
            error!(%execution_id, "status update for an execution with no plans, dropping");
            return;
        };
        if newest.plan.id != plan_id {
            error!(
                %plan_id,
                newest_plan_id = %newest.plan.id,
                "status update is not for the newest plan, dropping"
            );
            return;
        }
        if let Some(current) = newest.status_history.first() {
            // Terminal states are sticky.
            if current.state.is_terminal() {
                error!(
                    %plan_id,
                    current = ?current.state,
                    incoming = ?status.state,
                    "status update on a plan that already reached a terminal state, dropping"
                );
                return;
            }
        }
        newest.status_history.insert(0, status);
    }

    /// Removes every execution whose newest plan has been terminal for
    /// longer than the TTL. Active executions are never evicted.
    pub(crate) async fn sweep_expired(&self, now: DateTime<Utc>) {
        let mut components = self.components.write().await;
        for (name, cs) in components.iter_mut() {
            let expired: Vec<ExecutionId> = cs
                .executions
                .values()
                .filter(|execution| {
                    execution
                        .history
                        .first()
                        .and_then(|pws| pws.status_history.first())
                        .is_some_and(|status| {
                            status.state.is_terminal()
                                && now.signed_duration_since(status.timestamp) > self.ttl
                        })
                })
                .map(|execution| execution.id)
                .collect();
            if expired.is_empty() {
                continue;
            }
            for id in &expired {
                cs.executions.remove(id);
                debug!(execution_id = %id, component = %name, "evicted expired execution");
            }
            let ComponentState {
                execution_ids,
                executions,
            } = cs;
            execution_ids.retain(|id| executions.contains_key(id));
        }
    }
}

/// Background sweeper. Holds only a weak reference so dropping the store
/// tears it down even without a stop_all call.
async fn sweep_loop(state: Weak<ExecutionState>, cancel: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(state) = state.upgrade() else {
            return;
        };
        state.sweep_expired(Utc::now()).await;
    }
}
