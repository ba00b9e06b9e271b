//! Operation Executor - Führt einzelne Operationen aus
//!
//! Jede Operation ist idempotent formuliert: existiert eine Ressource
//! bereits im gewünschten Zustand, endet sie als `Unchanged` statt als
//! Fehler. Vorübergehende Runtime-Fehler werden mit Backoff wiederholt.

use std::sync::Arc;
use std::time::Instant;

use podfleet_config::{Container, DesiredLifecycle, ExecutorConfig, HealthConfig};
use tracing::{debug, info, warn};

use super::health::wait_until_ready;
use crate::hostfs::HostFilesystem;
use crate::reconcile::{container_drift, Operation, OperationKind};
use crate::report::{FailureCause, OperationResult, OperationStatus};
use crate::runtime::{ContainerRuntime, RuntimeError, RuntimeErrorKind};

/// Alles was zur Ausführung der Operationen eines Hosts gebraucht wird.
pub struct ExecContext {
    pub profile: String,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub fs: Arc<dyn HostFilesystem>,
    pub executor: ExecutorConfig,
    /// `None` deaktiviert die Readiness-Prüfung
    pub health: Option<HealthConfig>,
}

/// Erfolgreicher Ausgang einer Operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Unchanged,
}

impl From<Outcome> for OperationStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Applied => OperationStatus::Applied,
            Outcome::Unchanged => OperationStatus::Unchanged,
        }
    }
}

/// Führt `op` aus, inklusive Wiederholungen und Readiness-Prüfung.
pub async fn execute_operation(op: &Operation, ctx: &ExecContext) -> OperationResult {
    let started = Instant::now();
    let mut attempts = 0;

    let outcome = loop {
        attempts += 1;
        match apply(&op.kind, ctx).await {
            Ok(outcome) => break outcome,
            Err(e) if e.is_transient() && attempts <= ctx.executor.max_retries => {
                let delay = ctx.executor.backoff(attempts);
                warn!(
                    host = %ctx.profile,
                    operation = %op,
                    attempt = attempts,
                    error = %e,
                    "transient failure, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!(host = %ctx.profile, operation = %op, error = %e, "operation failed");
                return OperationResult::runtime_failure(op, &e, attempts, started.elapsed());
            }
        }
    };

    if outcome == Outcome::Applied {
        if let (Some(check), Some(defaults)) = (&op.health_check, &ctx.health) {
            let name = container_name(&op.kind);
            if let Err(e) = wait_until_ready(ctx.runtime.as_ref(), name, check, defaults).await {
                // Container bleibt laufen, nur die Operation gilt als fehlgeschlagen
                warn!(host = %ctx.profile, container = name, error = %e, "health check failed");
                return OperationResult::failed(
                    op,
                    FailureCause::HealthCheckTimeout,
                    e.to_string(),
                    attempts,
                    started.elapsed(),
                );
            }
        }
    }

    info!(host = %ctx.profile, operation = %op, ?outcome, "operation finished");
    OperationResult::succeeded(op, outcome.into(), attempts, started.elapsed())
}

fn container_name(kind: &OperationKind) -> &str {
    match kind {
        OperationKind::CreateContainer { container }
        | OperationKind::RecreateContainer { container, .. } => &container.name,
        OperationKind::UpdateContainer { name, .. }
        | OperationKind::RemoveContainer { name, .. }
        | OperationKind::StartContainer { name }
        | OperationKind::StopContainer { name }
        | OperationKind::UnpauseContainer { name }
        | OperationKind::RestartContainer { name } => name,
        OperationKind::CreateNetwork { network } => &network.name,
        OperationKind::EnsureDirectory { .. } => "",
    }
}

// ============================================================================
// Operation Implementations
// ============================================================================

async fn apply(kind: &OperationKind, ctx: &ExecContext) -> Result<Outcome, RuntimeError> {
    let runtime = ctx.runtime.as_ref();

    match kind {
        OperationKind::CreateNetwork { network } => {
            match runtime.create_network(network).await {
                Ok(()) => Ok(Outcome::Applied),
                Err(e) if e.kind == RuntimeErrorKind::AlreadyExists => {
                    debug!(network = %network.name, "network already exists");
                    Ok(Outcome::Unchanged)
                }
                Err(e) => Err(e),
            }
        }

        OperationKind::EnsureDirectory { directory, .. } => {
            ctx.fs.ensure_directory(directory).await?;
            Ok(Outcome::Applied)
        }

        OperationKind::CreateContainer { container } => create_container(ctx, container).await,

        OperationKind::UpdateContainer { name, update } => {
            runtime.update_container(name, update).await?;
            Ok(Outcome::Applied)
        }

        OperationKind::RecreateContainer { container, .. } => {
            remove_if_present(runtime, &container.name).await?;
            create_and_start(ctx, container).await?;
            Ok(Outcome::Applied)
        }

        OperationKind::RemoveContainer { name, .. } => match runtime.remove_container(name).await {
            Ok(()) => Ok(Outcome::Applied),
            Err(e) if e.kind == RuntimeErrorKind::NotFound => Ok(Outcome::Unchanged),
            Err(e) => Err(e),
        },

        OperationKind::StartContainer { name } => {
            runtime.start_container(name).await?;
            Ok(Outcome::Applied)
        }

        OperationKind::StopContainer { name } => {
            runtime.stop_container(name).await?;
            Ok(Outcome::Applied)
        }

        OperationKind::UnpauseContainer { name } => {
            runtime.unpause_container(name).await?;
            Ok(Outcome::Applied)
        }

        OperationKind::RestartContainer { name } => {
            runtime.restart_container(name).await?;
            Ok(Outcome::Applied)
        }
    }
}

/// Erstellt einen Container. Existiert er inzwischen (z.B. nach einem
/// abgebrochenen Versuch), wird er übernommen wenn er passt und sonst
/// einmal neu erstellt.
async fn create_container(ctx: &ExecContext, container: &Container) -> Result<Outcome, RuntimeError> {
    let runtime = ctx.runtime.as_ref();

    match create_and_start(ctx, container).await {
        Ok(()) => return Ok(Outcome::Applied),
        Err(e) if e.kind == RuntimeErrorKind::AlreadyExists => {
            debug!(container = %container.name, "container appeared concurrently");
        }
        Err(e) => return Err(e),
    }

    match runtime.inspect_container(&container.name).await? {
        Some(live) if container_drift(container, &live).is_empty() => {
            let want_running = container.state == DesiredLifecycle::Running;
            if want_running && !live.is_running() {
                runtime.start_container(&container.name).await?;
                Ok(Outcome::Applied)
            } else if !want_running && live.is_running() {
                runtime.stop_container(&container.name).await?;
                Ok(Outcome::Applied)
            } else {
                Ok(Outcome::Unchanged)
            }
        }
        _ => {
            remove_if_present(runtime, &container.name).await?;
            create_and_start(ctx, container).await?;
            Ok(Outcome::Applied)
        }
    }
}

async fn create_and_start(ctx: &ExecContext, container: &Container) -> Result<(), RuntimeError> {
    let labels = container.managed_labels(&ctx.profile);
    ctx.runtime.create_container(container, &labels).await?;
    if container.state == DesiredLifecycle::Running {
        ctx.runtime.start_container(&container.name).await?;
    }
    Ok(())
}

async fn remove_if_present(runtime: &dyn ContainerRuntime, name: &str) -> Result<(), RuntimeError> {
    match runtime.remove_container(name).await {
        Err(e) if e.kind != RuntimeErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{Plan, RemoveReason};
    use crate::test_utils::*;
    use podfleet_config::HealthConfig;

    const PROFILE: &str = r#"
networks:
  - name: app-net
containers:
  - name: web
    image: nginx:latest
    networks: [app-net]
"#;

    fn context(runtime: Arc<MockRuntime>) -> ExecContext {
        ExecContext {
            profile: "web01".to_string(),
            runtime,
            fs: Arc::new(MockFilesystem::new()),
            executor: ExecutorConfig {
                workers: 2,
                max_retries: 2,
                retry_backoff_ms: 1,
            },
            health: Some(HealthConfig {
                timeout: 1,
                interval: 1,
            }),
        }
    }

    fn single(kind: OperationKind) -> Operation {
        let mut plan = Plan::new("web01");
        plan.push(kind, vec![]);
        plan.operations()[0].clone()
    }

    #[tokio::test]
    async fn test_existing_network_is_unchanged() {
        let profile = profile_from_yaml("web01", PROFILE);
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_network("app-net");
        let ctx = context(runtime.clone());

        let result = execute_operation(
            &single(OperationKind::CreateNetwork {
                network: profile.network("app-net").unwrap().clone(),
            }),
            &ctx,
        )
        .await;

        assert_eq!(result.status, OperationStatus::Unchanged);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let profile = profile_from_yaml("web01", PROFILE);
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_on("create-network:app-net", RuntimeErrorKind::Transient, 2);
        let ctx = context(runtime.clone());

        let result = execute_operation(
            &single(OperationKind::CreateNetwork {
                network: profile.network("app-net").unwrap().clone(),
            }),
            &ctx,
        )
        .await;

        assert_eq!(result.status, OperationStatus::Applied);
        assert_eq!(result.attempts, 3);
        assert!(runtime.has_network("app-net"));
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let profile = profile_from_yaml("web01", PROFILE);
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_on("create-network:app-net", RuntimeErrorKind::Transient, 10);
        let ctx = context(runtime.clone());

        let result = execute_operation(
            &single(OperationKind::CreateNetwork {
                network: profile.network("app-net").unwrap().clone(),
            }),
            &ctx,
        )
        .await;

        assert_eq!(result.status, OperationStatus::Failed);
        assert_eq!(result.cause, Some(FailureCause::Transient));
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_retried() {
        let profile = profile_from_yaml("web01", PROFILE);
        let runtime = Arc::new(MockRuntime::new());
        runtime.fail_on("create-container:web", RuntimeErrorKind::Fatal, 1);
        let ctx = context(runtime.clone());

        let result = execute_operation(
            &single(OperationKind::CreateContainer {
                container: profile.container("web").unwrap().clone(),
            }),
            &ctx,
        )
        .await;

        assert_eq!(result.status, OperationStatus::Failed);
        assert_eq!(result.cause, Some(FailureCause::Fatal));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_create_adopts_matching_container() {
        let profile = profile_from_yaml("web01", PROFILE);
        let web = profile.container("web").unwrap();
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_container(managed_container("web01", web, true));
        let ctx = context(runtime.clone());

        let result =
            execute_operation(&single(OperationKind::CreateContainer { container: web.clone() }), &ctx).await;

        assert_eq!(result.status, OperationStatus::Unchanged);
        assert_eq!(runtime.mutations(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_create_replaces_foreign_container() {
        let profile = profile_from_yaml("web01", PROFILE);
        let web = profile.container("web").unwrap();
        let runtime = Arc::new(MockRuntime::new());
        runtime.add_network("app-net");
        runtime.add_container(unmanaged_container("web"));
        let ctx = context(runtime.clone());

        let result =
            execute_operation(&single(OperationKind::CreateContainer { container: web.clone() }), &ctx).await;

        assert_eq!(result.status, OperationStatus::Applied);
        assert_eq!(
            runtime.mutations(),
            vec!["remove-container:web", "create-container:web", "start-container:web"]
        );
        assert!(runtime.container("web").unwrap().is_managed_by("web01"));
    }

    #[tokio::test]
    async fn test_remove_missing_container_is_unchanged() {
        let runtime = Arc::new(MockRuntime::new());
        let ctx = context(runtime);

        let result = execute_operation(
            &single(OperationKind::RemoveContainer {
                name: "old".to_string(),
                reason: RemoveReason::Pruned,
            }),
            &ctx,
        )
        .await;

        assert_eq!(result.status, OperationStatus::Unchanged);
    }

    #[tokio::test]
    async fn test_health_timeout_fails_operation_but_keeps_container() {
        let profile = profile_from_yaml(
            "web01",
            r#"
containers:
  - name: web
    image: nginx:latest
    healthcheck:
      port: 8080
      timeout: 1
      interval: 1
"#,
        );
        let web = profile.container("web").unwrap();
        let runtime = Arc::new(MockRuntime::new());
        runtime.never_healthy("web");
        let ctx = context(runtime.clone());

        let mut plan = Plan::new("web01");
        plan.push_checked(
            OperationKind::CreateContainer { container: web.clone() },
            vec![],
            web.healthcheck.clone(),
        );

        let result = execute_operation(&plan.operations()[0], &ctx).await;

        assert_eq!(result.status, OperationStatus::Failed);
        assert_eq!(result.cause, Some(FailureCause::HealthCheckTimeout));
        assert!(runtime.container("web").unwrap().is_running());
    }
}
