//! Replan polling watchers.
//!
//! Each plan attempt may run up to two of these workers, one probing for
//! position drift and one for newly observed obstacles. A positive probe
//! interrupts the in-flight execute call by cancelling the executor scope,
//! then reports a replan verdict to the runner; a probe error becomes a
//! terminal failure verdict.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::executor::PlannerExecutor;

/// Which probe a watcher drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatcherKind {
    Position,
    Obstacle,
}

impl WatcherKind {
    pub(crate) fn replan_reason(&self) -> &'static str {
        match self {
            Self::Position => "position drift exceeded the plan deviation threshold",
            Self::Obstacle => "obstacles intersect the current plan",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Position => "position",
            Self::Obstacle => "obstacle",
        }
    }
}

pub(crate) enum WatcherVerdict {
    Replan(WatcherKind),
    Failed(String),
}

/// Spawns a watcher probing `executor` every `period` until the executor
/// scope is cancelled or a verdict is reached. The scope is cancelled
/// before a replan verdict is sent, so the interrupted execute call is
/// already terminating when the runner reads the verdict.
pub(crate) fn spawn_replan_watcher(
    watchers: &mut JoinSet<()>,
    kind: WatcherKind,
    period: Duration,
    executor: Arc<dyn PlannerExecutor>,
    cancel: CancellationToken,
    verdicts: mpsc::Sender<WatcherVerdict>,
) {
    watchers.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; consume it
        // so the first probe happens one full period in.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = probe(kind, executor.as_ref()) => result,
            };
            match result {
                Ok(false) => {}
                Ok(true) => {
                    debug!(watcher = kind.label(), "watcher triggered a replan");
                    cancel.cancel();
                    let _ = verdicts.send(WatcherVerdict::Replan(kind)).await;
                    return;
                }
                Err(err) => {
                    debug!(watcher = kind.label(), error = %err, "watcher probe failed");
                    let _ = verdicts.send(WatcherVerdict::Failed(err.to_string())).await;
                    return;
                }
            }
        }
    });
}

async fn probe(kind: WatcherKind, executor: &dyn PlannerExecutor) -> anyhow::Result<bool> {
    match kind {
        WatcherKind::Position => executor.position_needs_replan().await,
        WatcherKind::Obstacle => executor.obstacles_need_replan().await,
    }
}
