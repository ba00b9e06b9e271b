//! Scheduler - Führt einen Plan mit einem begrenzten Worker-Pool aus
//!
//! Eine Operation startet erst wenn alle Abhängigkeiten erfolgreich waren.
//! Schlägt eine Abhängigkeit fehl, werden alle davon abhängigen Operationen
//! übersprungen; unabhängige Operationen laufen weiter. Nach einem Abbruch
//! werden keine neuen Operationen mehr gestartet.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info};

use super::executor::{execute_operation, ExecContext};
use crate::reconcile::{Operation, OperationId, Plan};
use crate::report::{FailureCause, OperationResult};
use crate::ui::RunUI;

enum Readiness {
    Ready,
    Waiting,
    Blocked(OperationId),
}

fn readiness(op: &Operation, results: &BTreeMap<OperationId, OperationResult>) -> Readiness {
    let mut waiting = false;
    for dep in &op.depends_on {
        match results.get(dep) {
            Some(result) if !result.status.is_success() => return Readiness::Blocked(*dep),
            Some(_) => {}
            None => waiting = true,
        }
    }
    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

/// Führt alle Operationen von `plan` aus und liefert ein Ergebnis pro
/// Operation, in Planreihenfolge.
pub async fn execute_plan<U: RunUI + ?Sized>(
    plan: &Plan,
    ctx: Arc<ExecContext>,
    mut cancel: watch::Receiver<bool>,
    ui: &mut U,
) -> Vec<OperationResult> {
    let semaphore = Arc::new(Semaphore::new(ctx.executor.workers.max(1)));
    let mut results: BTreeMap<OperationId, OperationResult> = BTreeMap::new();
    let mut started: BTreeSet<OperationId> = BTreeSet::new();
    let mut running: JoinSet<OperationResult> = JoinSet::new();
    let mut cancelled = *cancel.borrow();
    let mut watching = true;

    loop {
        if !cancelled {
            // Bis zum Fixpunkt: Übersprungene können weitere Operationen blockieren
            let mut progressed = true;
            while progressed {
                progressed = false;
                for op in plan.operations() {
                    if started.contains(&op.id) {
                        continue;
                    }
                    match readiness(op, &results) {
                        Readiness::Waiting => {}
                        Readiness::Blocked(dep) => {
                            let result = OperationResult::skipped(op, dep);
                            ui.on_operation_finished(&plan.host, &result);
                            started.insert(op.id);
                            results.insert(op.id, result);
                            progressed = true;
                        }
                        Readiness::Ready => {
                            started.insert(op.id);
                            spawn_operation(
                                &mut running,
                                op.clone(),
                                ctx.clone(),
                                semaphore.clone(),
                                cancel.clone(),
                            );
                        }
                    }
                }
            }
        }

        if running.is_empty() {
            break;
        }

        tokio::select! {
            joined = running.join_next() => match joined {
                Some(Ok(result)) => {
                    ui.on_operation_finished(&plan.host, &result);
                    if let Some(id) = result.id {
                        results.insert(id, result);
                    }
                }
                Some(Err(e)) => error!(host = %plan.host, error = %e, "operation task aborted"),
                None => {}
            },
            changed = cancel.changed(), if watching && !cancelled => match changed {
                Ok(()) if *cancel.borrow() => {
                    info!(host = %plan.host, "cancellation requested, not starting new operations");
                    cancelled = true;
                }
                Ok(()) => {}
                Err(_) => watching = false,
            },
        }
    }

    for op in plan.operations() {
        if results.contains_key(&op.id) {
            continue;
        }
        let result = if started.contains(&op.id) {
            OperationResult::failed(op, FailureCause::Fatal, "operation task aborted", 0, Default::default())
        } else if cancelled {
            OperationResult::cancelled(op)
        } else {
            // Abhängigkeit ohne Ergebnis (abgebrochener Task)
            let dep = op
                .depends_on
                .iter()
                .copied()
                .find(|d| !results.get(d).is_some_and(|r| r.status.is_success()))
                .unwrap_or(op.id);
            OperationResult::skipped(op, dep)
        };
        ui.on_operation_finished(&plan.host, &result);
        results.insert(op.id, result);
    }

    results.into_values().collect()
}

fn spawn_operation(
    running: &mut JoinSet<OperationResult>,
    op: Operation,
    ctx: Arc<ExecContext>,
    semaphore: Arc<Semaphore>,
    cancel: watch::Receiver<bool>,
) {
    running.spawn(async move {
        let _permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return OperationResult::cancelled(&op),
        };
        if *cancel.borrow() {
            return OperationResult::cancelled(&op);
        }
        execute_operation(&op, &ctx).await
    });
}

/// Ergebnisse für einen Dry Run: jede Operation ist nur geplant.
pub fn plan_results(plan: &Plan) -> Vec<OperationResult> {
    plan.operations().iter().map(OperationResult::planned).collect()
}
