//! podfleet runner
//!
//! Bringt Container-Hosts in den deklarierten Zustand:
//! 1. Ist-Zustand lesen ([`inspect::inspect_host`])
//! 2. Plan berechnen ([`reconcile::reconcile`], pure function)
//! 3. Plan ausführen ([`controller::execute_plan`])
//! 4. Erneut lesen und prüfen, dass nichts mehr abweicht
//!
//! Ein zweiter Lauf ohne Änderungen an Deklaration oder Host erzeugt
//! einen leeren Plan.

pub mod controller;
pub mod fleet;
pub mod hostfs;
pub mod inspect;
pub mod reconcile;
pub mod report;
pub mod runtime;
pub mod state;
pub mod ui;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::sync::Arc;
use std::time::Instant;

use podfleet_config::{ExecutorConfig, FleetConfig, HealthConfig, HostProfile};
use tokio::sync::watch;
use tracing::{info, warn};

use controller::{execute_plan, plan_results, ExecContext};
use hostfs::HostFilesystem;
use inspect::inspect_host;
use reconcile::{reconcile, Phase, PhaseSet, ReconcileOptions};
use report::{HostInfo, HostReport, OperationResult};
use runtime::ContainerRuntime;
use ui::RunUI;

// Re-exports
pub use fleet::{run_fleet, HostConnector, PodmanConnector};
pub use report::{FleetReport, OperationStatus};
pub use ui::{HeadlessUI, QuietUI};

/// Einstellungen eines Laufs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Aktive Phasen, Default: alle
    pub phases: PhaseSet,
    /// Nur planen, nichts ändern
    pub dry_run: bool,
    pub executor: ExecutorConfig,
    pub health: HealthConfig,
}

impl RunOptions {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            phases: PhaseSet::all(),
            dry_run: false,
            executor: config.executor.clone(),
            health: config.health.clone(),
        }
    }
}

// ============================================================================
// Host Run
// ============================================================================

/// Führt einen kompletten Lauf für einen Host aus.
///
/// Fehler einzelner Operationen landen im Report; die Funktion selbst
/// schlägt nie fehl.
pub async fn run_host<U: RunUI + ?Sized>(
    profile: &HostProfile,
    runtime: Arc<dyn ContainerRuntime>,
    fs: Arc<dyn HostFilesystem>,
    options: &RunOptions,
    cancel: watch::Receiver<bool>,
    ui: &mut U,
) -> HostReport {
    let started = Instant::now();
    let mut report = HostReport::new(&profile.name, options.dry_run);

    for (container, source) in profile.uncovered_volume_sources() {
        report.warnings.push(format!(
            "container '{}' mounts {} which no declared directory covers",
            container,
            source.display()
        ));
    }

    let reconcile_options = ReconcileOptions {
        supports_update: runtime.supports_update(),
    };

    let actual = inspect_host(profile, runtime.as_ref(), fs.as_ref()).await;
    let plan = match reconcile(profile, &actual, &reconcile_options) {
        Ok(plan) => plan.only_phases(&options.phases),
        Err(e) => {
            warn!(host = %profile.name, error = %e, "declaration rejected");
            report.validation_error = Some(e.to_string());
            let report = report.finish(started.elapsed());
            ui.on_host_complete(&report);
            return report;
        }
    };

    report.warnings.extend(plan.warnings.iter().cloned());
    for warning in &report.warnings {
        ui.on_warning(&profile.name, warning);
    }
    report.in_sync = plan.in_sync.clone();
    ui.on_host_start(&profile.name, &plan);

    for error in &plan.query_errors {
        let result = OperationResult::inspection_failed(error);
        ui.on_operation_finished(&profile.name, &result);
        report.operations.push(result);
    }

    info!(host = %profile.name, operations = plan.len(), dry_run = options.dry_run, "plan ready");

    if options.dry_run {
        for result in plan_results(&plan) {
            ui.on_operation_finished(&profile.name, &result);
            report.operations.push(result);
        }
    } else if !plan.is_empty() {
        let ctx = Arc::new(ExecContext {
            profile: profile.name.clone(),
            runtime: runtime.clone(),
            fs: fs.clone(),
            executor: options.executor.clone(),
            health: options
                .phases
                .contains(Phase::HealthCheck)
                .then(|| options.health.clone()),
        });
        report
            .operations
            .extend(execute_plan(&plan, ctx, cancel.clone(), ui).await);
    }

    let cancelled = *cancel.borrow();
    let changed = !options.dry_run && !plan.is_empty();
    let verify = options.phases.contains(Phase::Verification) && changed && !cancelled;
    let describe = options.phases.contains(Phase::Info);

    let final_state = if changed && (verify || describe) {
        inspect_host(profile, runtime.as_ref(), fs.as_ref()).await
    } else {
        actual
    };

    if verify {
        if let Ok(remaining) = reconcile(profile, &final_state, &reconcile_options) {
            report.verification = remaining.only_phases(&options.phases).descriptions();
        }
    }
    if describe {
        report.info = Some(HostInfo::from_state(&final_state));
    }

    let report = report.finish(started.elapsed());
    info!(
        host = %profile.name,
        applied = report.summary.applied,
        failed = report.summary.failed,
        "host finished"
    );
    ui.on_host_complete(&report);
    report
}

// ============================================================================
// Unit Tests
// ============================================================================
