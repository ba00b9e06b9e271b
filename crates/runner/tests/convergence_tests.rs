//! End-to-end convergence tests against the in-memory runtime.
//!
//! Each test runs the full inspect → reconcile → execute → verify loop
//! through `run_host` and checks the resulting host state.

use std::sync::Arc;

use podfleet_config::{ExecutorConfig, HealthConfig, HostDeclaration, HostProfile, ValidationError};
use podfleet_runner::inspect::inspect_host;
use podfleet_runner::reconcile::{reconcile, OperationKind, ReconcileOptions};
use podfleet_runner::report::{FailureCause, HostReport, OperationStatus};
use podfleet_runner::runtime::RuntimeErrorKind;
use podfleet_runner::state::ContainerStatus;
use podfleet_runner::test_utils::*;
use podfleet_runner::{run_host, RunOptions};
use tokio::sync::watch;

const APP: &str = r#"
networks:
  - name: app-net
containers:
  - name: web
    image: nginx:latest
    ports: ["8080:80"]
    networks: [app-net]
"#;

fn options() -> RunOptions {
    RunOptions {
        executor: ExecutorConfig {
            workers: 4,
            max_retries: 3,
            retry_backoff_ms: 1,
        },
        health: HealthConfig {
            timeout: 1,
            interval: 1,
        },
        ..RunOptions::default()
    }
}

async fn apply(
    profile: &HostProfile,
    runtime: &Arc<MockRuntime>,
    fs: &Arc<MockFilesystem>,
) -> HostReport {
    let (_tx, rx) = watch::channel(false);
    run_host(profile, runtime.clone(), fs.clone(), &options(), rx, &mut MockUI::new()).await
}

async fn plan_for(profile: &HostProfile, runtime: &MockRuntime) -> Vec<String> {
    let actual = inspect_host(profile, runtime, &MockFilesystem::new()).await;
    reconcile(profile, &actual, &ReconcileOptions::default())
        .unwrap()
        .descriptions()
}

#[tokio::test]
async fn empty_host_gets_network_then_container() {
    let profile = profile_from_yaml("web01", APP);
    let runtime = Arc::new(MockRuntime::new());
    let fs = Arc::new(MockFilesystem::new());

    assert_eq!(
        plan_for(&profile, &runtime).await,
        vec![
            "create-network network/app-net",
            "create-container container/web (nginx:latest)",
        ]
    );

    let report = apply(&profile, &runtime, &fs).await;
    assert!(!report.has_failures(), "{:#?}", report);

    let state = inspect_host(&profile, runtime.as_ref(), fs.as_ref()).await;
    assert_eq!(state.containers.len(), 1);
    let web = state.container("web").unwrap();
    assert!(web.is_running());
    assert_eq!(web.networks.iter().collect::<Vec<_>>(), vec!["app-net"]);
}

#[tokio::test]
async fn second_run_is_a_no_op() {
    let profile = profile_from_yaml(
        "web01",
        r#"
prune: true
directories:
  - path: /srv/app
    mode: "0750"
    owner: app
networks:
  - name: app-net
  - name: backend
    internal: true
containers:
  - name: db
    image: postgres:16
    networks: [backend]
    environment:
      POSTGRES_PASSWORD: secret
  - name: app
    image: ghcr.io/example/app:2.1
    networks: [app-net, backend]
    volumes: ["/srv/app/data:/data"]
    depends_on: [db]
    restart_policy: on-failure
  - name: worker
    image: ghcr.io/example/app:2.1
    state: stopped
"#,
    );
    let runtime = Arc::new(MockRuntime::new());
    let fs = Arc::new(MockFilesystem::new());

    let first = apply(&profile, &runtime, &fs).await;
    assert!(!first.has_failures(), "{:#?}", first);
    let mutations = runtime.mutations();

    let second = apply(&profile, &runtime, &fs).await;
    assert!(second.operations.is_empty(), "{:#?}", second.operations);
    assert_eq!(runtime.mutations(), mutations);
    assert!(!runtime.container("worker").unwrap().is_running());
}

#[tokio::test]
async fn networks_are_created_before_their_containers() {
    let profile = profile_from_yaml(
        "web01",
        r#"
networks:
  - name: front
  - name: back
containers:
  - name: proxy
    image: traefik:v3
    networks: [front]
  - name: api
    image: example/api
    networks: [front, back]
  - name: cache
    image: redis:7
    networks: [back]
"#,
    );
    let actual = inspect_host(&profile, &MockRuntime::new(), &MockFilesystem::new()).await;
    let plan = reconcile(&profile, &actual, &ReconcileOptions::default()).unwrap();

    for op in plan.operations() {
        let container = match &op.kind {
            OperationKind::CreateContainer { container } => container,
            _ => continue,
        };
        for network in container.network_names() {
            let network_op = plan
                .operations()
                .iter()
                .find(|o| o.kind.resource() == format!("network/{}", network))
                .unwrap();
            assert!(network_op.id < op.id);
            assert!(op.depends_on.contains(&network_op.id), "{} must wait for {}", op, network);
        }
    }

    // Auch bei paralleler Ausführung landet jeder Container im Netzwerk
    let runtime = Arc::new(MockRuntime::new());
    let report = apply(&profile, &runtime, &Arc::new(MockFilesystem::new())).await;
    assert!(!report.has_failures(), "{:#?}", report);
}

#[tokio::test]
async fn image_change_recreates_container_once() {
    let profile = profile_from_yaml("web01", APP);
    let web = profile.container("web").unwrap();
    let mut old = web.clone();
    old.image = "nginx:1.24".to_string();

    let runtime = Arc::new(MockRuntime::new());
    runtime.add_network("app-net");
    runtime.add_container(managed_container("web01", &old, true));
    let fs = Arc::new(MockFilesystem::new());

    let plan = plan_for(&profile, &runtime).await;
    assert_eq!(plan.len(), 1);
    assert!(plan[0].starts_with("recreate-container container/web (image nginx:1.24 -> nginx:latest"));

    let report = apply(&profile, &runtime, &fs).await;
    assert!(!report.has_failures(), "{:#?}", report);
    assert_eq!(runtime.container("web").unwrap().image, "nginx:latest");

    assert!(plan_for(&profile, &runtime).await.is_empty());
}

#[tokio::test]
async fn pruning_removes_exactly_the_dropped_container() {
    let before = profile_from_yaml(
        "web01",
        r#"
prune: true
containers:
  - name: web
    image: nginx:latest
  - name: old
    image: alpine:latest
"#,
    );
    let runtime = Arc::new(MockRuntime::new());
    runtime.add_container(unmanaged_container("infra"));
    runtime.add_container(labelled_container("theirs", "web02"));
    let fs = Arc::new(MockFilesystem::new());
    apply(&before, &runtime, &fs).await;

    let after = profile_from_yaml(
        "web01",
        r#"
prune: true
containers:
  - name: web
    image: nginx:latest
"#,
    );
    let applied = runtime.mutations().len();
    let report = apply(&after, &runtime, &fs).await;

    assert!(!report.has_failures(), "{:#?}", report);
    assert_eq!(&runtime.mutations()[applied..], ["remove-container:old"]);
    assert_eq!(runtime.container_names(), vec!["infra", "theirs", "web"]);
}

#[tokio::test]
async fn absent_container_is_removed() {
    let runtime = Arc::new(MockRuntime::new());
    let fs = Arc::new(MockFilesystem::new());
    apply(&profile_from_yaml("web01", APP), &runtime, &fs).await;

    let absent = profile_from_yaml(
        "web01",
        r#"
networks:
  - name: app-net
containers:
  - name: web
    image: nginx:latest
    state: absent
"#,
    );
    let applied = runtime.mutations().len();
    let report = apply(&absent, &runtime, &fs).await;

    assert_eq!(report.summary.applied, 1);
    assert_eq!(&runtime.mutations()[applied..], ["remove-container:web"]);
    assert!(runtime.has_network("app-net"));
}

#[test]
fn duplicate_container_name_is_rejected() {
    let decl = HostDeclaration::from_yaml(
        r#"
containers:
  - name: web
    image: nginx:latest
  - name: web
    image: nginx:1.24
"#,
    )
    .unwrap();

    let err = HostProfile::from_declaration("web01", decl).unwrap_err();
    assert!(
        matches!(err, ValidationError::Duplicate { kind: "container", ref name } if name == "web"),
        "{:?}",
        err
    );
}

#[tokio::test]
async fn health_check_timeout_is_isolated() {
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
  - name: db
    image: postgres:16
    healthcheck:
      command: [pg_isready]
"#,
    );
    let runtime = Arc::new(MockRuntime::new());
    runtime.never_healthy("web");
    let fs = Arc::new(MockFilesystem::new());

    let report = apply(&profile, &runtime, &fs).await;

    let web = report.result_for("container/web").unwrap();
    assert_eq!(web.status, OperationStatus::Failed);
    assert_eq!(web.cause, Some(FailureCause::HealthCheckTimeout));
    assert!(runtime.container("web").unwrap().is_running());

    let db = report.result_for("container/db").unwrap();
    assert_eq!(db.status, OperationStatus::Applied);
}

#[tokio::test]
async fn transient_errors_are_retried_until_success() {
    let profile = profile_from_yaml("web01", APP);
    let runtime = Arc::new(MockRuntime::new());
    runtime.fail_on("start-container:web", RuntimeErrorKind::Transient, 2);
    let fs = Arc::new(MockFilesystem::new());

    let report = apply(&profile, &runtime, &fs).await;

    assert!(!report.has_failures(), "{:#?}", report);
    let web = report.result_for("container/web").unwrap();
    assert_eq!(web.attempts, 3);
    assert!(runtime.container("web").unwrap().is_running());
}

#[tokio::test]
async fn fatal_error_skips_dependents_only() {
    let profile = profile_from_yaml(
        "web01",
        r#"
containers:
  - name: db
    image: postgres:16
  - name: app
    image: example/app
    depends_on: [db]
  - name: metrics
    image: prom/node-exporter
"#,
    );
    let runtime = Arc::new(MockRuntime::new());
    runtime.fail_on("create-container:db", RuntimeErrorKind::Fatal, 1);
    let fs = Arc::new(MockFilesystem::new());

    let report = apply(&profile, &runtime, &fs).await;

    assert_eq!(report.result_for("container/db").unwrap().status, OperationStatus::Failed);
    assert_eq!(
        report.result_for("container/app").unwrap().status,
        OperationStatus::SkippedDependencyFailed
    );
    assert_eq!(report.result_for("container/metrics").unwrap().status, OperationStatus::Applied);
    assert!(runtime.container("app").is_none());
}

#[tokio::test]
async fn cancelled_run_starts_nothing() {
    let profile = profile_from_yaml("web01", APP);
    let runtime = Arc::new(MockRuntime::new());
    let fs = Arc::new(MockFilesystem::new());
    let (_tx, rx) = watch::channel(true);

    let report = run_host(&profile, runtime.clone(), fs.clone(), &options(), rx, &mut MockUI::new()).await;

    assert_eq!(report.summary.cancelled, 2);
    assert!(runtime.mutations().is_empty());
    assert!(report.verification.is_empty());
}

#[tokio::test]
async fn network_drift_is_updated_in_place() {
    let profile = profile_from_yaml(
        "web01",
        r#"
networks:
  - name: app-net
  - name: backend
containers:
  - name: web
    image: nginx:latest
    networks: [app-net, backend]
"#,
    );
    let web = profile.container("web").unwrap();
    let runtime = Arc::new(MockRuntime::new().with_update_support());
    runtime.add_network("app-net");
    runtime.add_network("backend");
    let mut live = managed_container("web01", web, true);
    live.networks.remove("backend");
    runtime.add_container(live);
    let fs = Arc::new(MockFilesystem::new());

    let report = apply(&profile, &runtime, &fs).await;

    assert!(!report.has_failures(), "{:#?}", report);
    assert_eq!(runtime.mutations(), vec!["update-container:web"]);
    assert!(runtime.container("web").unwrap().networks.contains("backend"));
}

#[tokio::test]
async fn paused_container_is_resumed() {
    let profile = profile_from_yaml("web01", APP);
    let runtime = Arc::new(MockRuntime::new());
    runtime.add_network("app-net");
    let mut live = managed_container("web01", profile.container("web").unwrap(), true);
    live.status = ContainerStatus::Paused;
    runtime.add_container(live);
    let fs = Arc::new(MockFilesystem::new());

    let report = apply(&profile, &runtime, &fs).await;

    assert!(!report.has_failures(), "{:#?}", report);
    assert_eq!(runtime.mutations(), vec!["unpause-container:web"]);
    assert!(runtime.container("web").unwrap().is_running());
    assert!(plan_for(&profile, &runtime).await.is_empty());
}
