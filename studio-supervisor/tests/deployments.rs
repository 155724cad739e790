//! Supervisor against a live CCS over HTTP, backed by the in-memory runtime.

use pretty_assertions::assert_eq;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use studio_ccs::{ContainerService, InMemoryRuntime, router};
use studio_core::auth::ServiceAuth;
use studio_core::config::CcsConfig;
use studio_core::error::ErrorKind;
use studio_core::types::ContainerStatus;
use studio_supervisor::{
    CcsClient, ContainerControl, DeployRequest, DeploySettings, DeploymentStatus,
    DeploymentStore, ModelCatalog, PortAllocator, Reconciler, Supervisor,
};
use tokio_util::sync::CancellationToken;

const SECRET: &str = "shared-ccs-secret";

struct Stack {
    addr: SocketAddr,
    runtime: InMemoryRuntime,
    supervisor: Arc<Supervisor>,
    client: CcsClient,
    shutdown: CancellationToken,
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn stack() -> Stack {
    let runtime = InMemoryRuntime::new().with_network("tt_studio_network");
    let config = CcsConfig::default();
    let service = ContainerService::new(Arc::new(runtime.clone()), &config);
    let app = router(service, Arc::new(ServiceAuth::new(SECRET)), &config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
            .unwrap();
    });

    let client = CcsClient::new(
        &format!("http://{addr}"),
        SECRET,
        Duration::from_secs(5),
        Duration::from_secs(10),
    )
    .unwrap();
    let settings = DeploySettings {
        network: "tt_studio_network".to_string(),
        cache_root: "/var/lib/tt-studio/cache".into(),
        weights_root: "/var/lib/tt-studio/weights".into(),
        backend_jwt_secret: "backend".to_string(),
        stop_grace: Duration::from_secs(1),
        starting_grace: Duration::from_secs(1800),
    };
    let supervisor = Arc::new(Supervisor::new(
        DeploymentStore::open_in_memory().unwrap(),
        Arc::new(client.clone()),
        Arc::new(PortAllocator::new(7001..=7100, false)),
        ModelCatalog::default(),
        settings,
    ));
    Stack {
        addr,
        runtime,
        supervisor,
        client,
        shutdown,
    }
}

fn echo() -> DeployRequest {
    DeployRequest {
        model_id: "echo".to_string(),
        ..Default::default()
    }
}

fn reconciler(sup: &Arc<Supervisor>, interval: Duration) -> Reconciler {
    Reconciler::new(
        Arc::clone(sup),
        interval,
        Duration::from_secs(2),
        Duration::from_secs(30),
    )
}

/// Every `running` record's port is reserved to that record.
async fn assert_ports_consistent(sup: &Supervisor) {
    for record in sup.list(Some(DeploymentStatus::Running)).await.unwrap() {
        if let Some(port) = record.port {
            assert_eq!(
                sup.ports().owner(port).as_deref(),
                Some(record.deploy_id.as_str()),
                "port {port} of {} is not reserved",
                record.deploy_id
            );
        }
    }
}

#[tokio::test]
async fn test_happy_deploy_runs_on_first_port() {
    let s = stack().await;
    let record = s.supervisor.deploy(echo()).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Running);
    assert_eq!(record.port, Some(7001));

    let cid = record.container_id.clone().unwrap();
    let detail = s.client.get_container(&cid).await.unwrap();
    assert_eq!(detail.summary.status, ContainerStatus::Running);
    assert_eq!(detail.summary.host_port(), Some(7001));
    assert_ports_consistent(&s.supervisor).await;
}

#[tokio::test]
async fn test_unexpected_death_is_reconciled_within_two_cycles() {
    let s = stack().await;
    let record = s.supervisor.deploy(echo()).await.unwrap();
    s.runtime.kill(record.container_id.as_deref().unwrap());

    let cancel = CancellationToken::new();
    let interval = Duration::from_millis(100);
    let task = tokio::spawn(reconciler(&s.supervisor, interval).run(cancel.clone()));
    tokio::time::sleep(interval * 2 + Duration::from_millis(150)).await;
    cancel.cancel();
    task.await.unwrap();

    let after = s.supervisor.get(&record.deploy_id).await.unwrap();
    assert!(
        matches!(after.status, DeploymentStatus::Exited | DeploymentStatus::Dead),
        "status is {}",
        after.status
    );
    assert!(after.stopped_at.is_some());
    assert!(!after.stopped_by_user);
    assert!(!s.supervisor.ports().is_reserved(7001));
}

#[tokio::test]
async fn test_every_live_container_has_a_record() {
    let s = stack().await;
    for _ in 0..3 {
        s.supervisor.deploy(echo()).await.unwrap();
    }
    reconciler(&s.supervisor, Duration::from_secs(60))
        .sweep()
        .await
        .unwrap();

    for container in s.client.list_containers(false).await.unwrap() {
        let record = s.supervisor.get(&container.id).await.unwrap();
        assert_eq!(record.container_id.as_deref(), Some(container.id.as_str()));
        assert_eq!(record.status, DeploymentStatus::Running);
    }
    assert_ports_consistent(&s.supervisor).await;
}

#[tokio::test]
async fn test_user_stop_is_not_overridden_by_reconciler() {
    let s = stack().await;
    let record = s.supervisor.deploy(echo()).await.unwrap();
    let stopped = s.supervisor.stop(&record.deploy_id).await.unwrap();
    assert_eq!(stopped.status, DeploymentStatus::Stopped);

    reconciler(&s.supervisor, Duration::from_secs(60))
        .sweep()
        .await
        .unwrap();
    let after = s.supervisor.get(&record.deploy_id).await.unwrap();
    assert_eq!(after.status, DeploymentStatus::Stopped);
    assert!(after.stopped_by_user);
}

#[tokio::test]
async fn test_redeploy_after_stop_gets_new_identity() {
    let s = stack().await;
    let first = s.supervisor.deploy(echo()).await.unwrap();
    s.supervisor.stop(&first.deploy_id).await.unwrap();
    s.supervisor.stop(&first.deploy_id).await.unwrap();
    let second = s.supervisor.deploy(echo()).await.unwrap();

    assert_ne!(first.deploy_id, second.deploy_id);
    assert_ne!(first.container_id, second.container_id);
    assert_eq!(s.supervisor.list(None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_ccs_outage_leaves_records_untouched() {
    let s = stack().await;
    let record = s.supervisor.deploy(echo()).await.unwrap();
    s.runtime.set_available(false);

    let before = s.supervisor.list(None).await.unwrap();
    let err = reconciler(&s.supervisor, Duration::from_secs(60))
        .sweep()
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::RuntimeUnavailable);
    assert_eq!(s.supervisor.list(None).await.unwrap(), before);
    assert!(s.supervisor.ports().is_reserved(record.port.unwrap()));
}

#[tokio::test]
async fn test_ccs_error_kinds_survive_the_hop() {
    let s = stack().await;
    s.runtime.set_available(false);
    let err = s.supervisor.deploy(echo()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RuntimeUnavailable);

    s.runtime.set_available(true);
    let err = s.client.get_container("feedface0000").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn test_wrong_secret_is_unauthorized() {
    let s = stack().await;
    let rogue = CcsClient::new(
        &format!("http://{}", s.addr),
        "not-the-secret",
        Duration::from_secs(2),
        Duration::from_secs(2),
    )
    .unwrap();
    let err = rogue.list_containers(true).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unauthorized);
}
