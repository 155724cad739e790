//! Background health reconciler.
//!
//! Each sweep compares `running` records with what CCS reports, adopts
//! managed containers nobody tracks, and fails deployments stuck in
//! `starting`. If CCS cannot be reached the sweep changes nothing and the
//! next one is delayed with exponential backoff.

use crate::store::{DeploymentRecord, DeploymentStatus};
use crate::supervisor::Supervisor;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use studio_core::config::SupervisorConfig;
use studio_core::error::{ErrorKind, StudioError};
use studio_core::types::ContainerStatus;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub transitioned: usize,
    pub adopted: usize,
    pub expired: usize,
    pub errors: usize,
}

/// Status a `running` record should take given what the runtime says.
///
/// `None` means the container is still alive.
pub fn lost_status(status: ContainerStatus) -> Option<DeploymentStatus> {
    if status.is_alive() {
        None
    } else if status == ContainerStatus::Dead {
        Some(DeploymentStatus::Dead)
    } else {
        Some(DeploymentStatus::Exited)
    }
}

/// Periodic task keeping deployment records honest.
#[derive(Debug, Clone)]
pub struct Reconciler {
    supervisor: Arc<Supervisor>,
    interval: Duration,
    record_timeout: Duration,
    max_backoff: Duration,
}

impl Reconciler {
    pub fn new(
        supervisor: Arc<Supervisor>,
        interval: Duration,
        record_timeout: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            supervisor,
            interval,
            record_timeout,
            max_backoff: max_backoff.max(interval),
        }
    }

    pub fn from_config(supervisor: Arc<Supervisor>, config: &SupervisorConfig) -> Self {
        Self::new(
            supervisor,
            Duration::from_secs(config.reconcile_interval_secs.max(1)),
            Duration::from_secs(config.reconcile_record_timeout_secs.max(1)),
            Duration::from_secs(config.reconcile_max_backoff_secs),
        )
    }

    /// Delay after a sweep, given the previous delay and the outcome.
    pub fn next_delay(
        &self,
        previous: Duration,
        outcome: &Result<SweepReport, StudioError>,
    ) -> Duration {
        match outcome {
            Ok(_) => self.interval,
            Err(e) if e.kind.is_retryable() => {
                (previous * 2).clamp(self.interval, self.max_backoff)
            }
            Err(_) => self.interval,
        }
    }

    /// Sweep until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Reconciler started");
        let mut delay = self.interval;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.sweep() => outcome,
            };
            match &outcome {
                Ok(report) => debug!(?report, "Reconcile sweep finished"),
                Err(e) => warn!(kind = %e.kind, error = %e.message, "Reconcile sweep skipped"),
            }
            delay = self.next_delay(delay, &outcome);
        }
        info!("Reconciler stopped");
    }

    /// One pass over the deployment table.
    pub async fn sweep(&self) -> Result<SweepReport, StudioError> {
        // Nothing below runs unless CCS answers this listing.
        let live = tokio::time::timeout(
            self.record_timeout,
            self.supervisor.control().list_containers(false),
        )
        .await
        .map_err(|_| StudioError::timeout("listing containers", self.record_timeout))??;

        let mut report = SweepReport::default();
        let running = self
            .supervisor
            .store()
            .list(Some(DeploymentStatus::Running))
            .await?;

        for record in &running {
            report.checked += 1;
            match tokio::time::timeout(self.record_timeout, self.check(record)).await {
                Ok(Ok(true)) => report.transitioned += 1,
                Ok(Ok(false)) => {}
                Ok(Err(e)) => {
                    report.errors += 1;
                    warn!(
                        deploy_id = %record.deploy_id,
                        kind = %e.kind,
                        error = %e.message,
                        "Record check failed"
                    );
                }
                Err(_) => {
                    report.errors += 1;
                    warn!(deploy_id = %record.deploy_id, "Record check timed out");
                }
            }
        }

        let tracked: HashSet<&str> = running
            .iter()
            .filter_map(|r| r.container_id.as_deref())
            .collect();
        for container in live
            .iter()
            .filter(|c| c.is_managed() && c.status.is_alive())
            .filter(|c| !tracked.contains(c.id.as_str()))
        {
            match self.supervisor.adopt(container).await {
                Ok(Some(_)) => report.adopted += 1,
                Ok(None) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(container = %container.id, error = %e, "Adoption failed");
                }
            }
        }

        let grace = chrono::Duration::from_std(self.supervisor.settings().starting_grace)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - grace;
        for record in self.supervisor.store().stale_starting(cutoff).await? {
            match self.supervisor.expire_starting(&record).await {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    warn!(deploy_id = %record.deploy_id, error = %e, "Failed to expire record");
                }
            }
        }

        Ok(report)
    }

    async fn check(&self, record: &DeploymentRecord) -> Result<bool, StudioError> {
        if record.stopped_by_user {
            return Ok(false);
        }
        let Some(container) = record.container_id.as_deref() else {
            return Ok(false);
        };
        let target = match self.supervisor.control().get_container(container).await {
            Ok(detail) => match lost_status(detail.summary.status) {
                Some(status) => status,
                None => return Ok(false),
            },
            Err(e) if e.kind == ErrorKind::NotFound => DeploymentStatus::Dead,
            Err(e) => return Err(e),
        };
        self.supervisor.record_lost(record, target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::DeployRequest;
    use crate::testing::{LocalCcs, supervisor_with};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use studio_core::types::{LABEL_DEPLOY_ID, LABEL_MANAGED, LABEL_MODEL_ID, RunContainerSpec};

    fn reconciler(sup: &Arc<Supervisor>) -> Reconciler {
        Reconciler::new(
            Arc::clone(sup),
            Duration::from_secs(60),
            Duration::from_secs(5),
            Duration::from_secs(600),
        )
    }

    fn echo() -> DeployRequest {
        DeployRequest {
            model_id: "echo".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_lost_status_mapping() {
        assert_eq!(lost_status(ContainerStatus::Running), None);
        assert_eq!(lost_status(ContainerStatus::Restarting), None);
        assert_eq!(lost_status(ContainerStatus::Paused), None);
        assert_eq!(lost_status(ContainerStatus::Dead), Some(DeploymentStatus::Dead));
        assert_eq!(lost_status(ContainerStatus::Exited), Some(DeploymentStatus::Exited));
        assert_eq!(lost_status(ContainerStatus::Created), Some(DeploymentStatus::Exited));
        assert_eq!(lost_status(ContainerStatus::Unknown), Some(DeploymentStatus::Exited));
    }

    #[test]
    fn test_backoff_doubles_and_resets() {
        let ccs = LocalCcs::new();
        let r = reconciler(&supervisor_with(&ccs, 7001..=7002));
        let down = Err(StudioError::new(ErrorKind::RuntimeUnavailable, "down"));
        let mut delay = Duration::from_secs(60);
        delay = r.next_delay(delay, &down);
        assert_eq!(delay, Duration::from_secs(120));
        for _ in 0..10 {
            delay = r.next_delay(delay, &down);
        }
        assert_eq!(delay, Duration::from_secs(600));
        assert_eq!(
            r.next_delay(delay, &Ok(SweepReport::default())),
            Duration::from_secs(60)
        );
    }

    #[tokio::test]
    async fn test_killed_container_becomes_exited() {
        let ccs = LocalCcs::new();
        let sup = supervisor_with(&ccs, 7001..=7010);
        let record = sup.deploy(echo()).await.unwrap();
        ccs.runtime.kill(record.container_id.as_deref().unwrap());

        let report = reconciler(&sup).sweep().await.unwrap();
        assert_eq!(report.transitioned, 1);
        let after = sup.get(&record.deploy_id).await.unwrap();
        assert_eq!(after.status, DeploymentStatus::Exited);
        assert!(after.stopped_at.is_some());
        assert!(!sup.ports().is_reserved(7001));
    }

    #[tokio::test]
    async fn test_vanished_container_becomes_dead() {
        let ccs = LocalCcs::new();
        let sup = supervisor_with(&ccs, 7001..=7010);
        let record = sup.deploy(echo()).await.unwrap();
        ccs.runtime.vanish(record.container_id.as_deref().unwrap());

        reconciler(&sup).sweep().await.unwrap();
        let after = sup.get(&record.deploy_id).await.unwrap();
        assert_eq!(after.status, DeploymentStatus::Dead);
        assert!(!sup.ports().is_reserved(7001));
    }

    #[tokio::test]
    async fn test_user_stopped_record_is_never_marked_lost() {
        let ccs = LocalCcs::new();
        let sup = supervisor_with(&ccs, 7001..=7010);
        let record = sup.deploy(echo()).await.unwrap();
        // Flag set, stop not yet carried out.
        sup.store()
            .mark_stopped_by_user(&record.deploy_id)
            .await
            .unwrap();
        ccs.runtime.vanish(record.container_id.as_deref().unwrap());

        let report = reconciler(&sup).sweep().await.unwrap();
        assert_eq!(report.transitioned, 0);
        let after = sup.get(&record.deploy_id).await.unwrap();
        assert_eq!(after.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn test_outage_mutates_nothing() {
        let ccs = LocalCcs::new();
        let sup = supervisor_with(&ccs, 7001..=7010);
        let record = sup.deploy(echo()).await.unwrap();
        ccs.runtime.set_available(false);

        let before = sup.list(None).await.unwrap();
        let err = reconciler(&sup).sweep().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RuntimeUnavailable);
        assert_eq!(sup.list(None).await.unwrap(), before);
        assert_eq!(sup.ports().owner(7001), Some(record.deploy_id));
    }

    #[tokio::test]
    async fn test_orphan_is_adopted_with_its_port() {
        let ccs = LocalCcs::new();
        let sup = supervisor_with(&ccs, 7001..=7010);
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_DEPLOY_ID.to_string(), "orphan-1".to_string());
        labels.insert(LABEL_MODEL_ID.to_string(), "echo".to_string());
        let mut ports = BTreeMap::new();
        ports.insert("7000/tcp".to_string(), 7005);
        let started = ccs
            .service
            .run_container(
                RunContainerSpec {
                    image: "ghcr.io/tenstorrent/dummy_echo_model:v0.0.1".to_string(),
                    name: Some("echo_orphan".to_string()),
                    ports,
                    labels,
                    ..Default::default()
                },
                "test",
            )
            .await
            .unwrap();

        let report = reconciler(&sup).sweep().await.unwrap();
        assert_eq!(report.adopted, 1);
        let adopted = sup.get(&started.id).await.unwrap();
        assert_eq!(adopted.deploy_id, "orphan-1");
        assert_eq!(adopted.status, DeploymentStatus::Running);
        assert_eq!(adopted.device, "cpu");
        assert_eq!(sup.ports().owner(7005).as_deref(), Some("orphan-1"));

        // Second sweep sees it as tracked.
        let report = reconciler(&sup).sweep().await.unwrap();
        assert_eq!(report.adopted, 0);
    }

    #[tokio::test]
    async fn test_unmanaged_containers_are_ignored() {
        let ccs = LocalCcs::new();
        let sup = supervisor_with(&ccs, 7001..=7010);
        ccs.service
            .run_container(
                RunContainerSpec {
                    image: "ghcr.io/tenstorrent/tt-studio-backend:1".to_string(),
                    ..Default::default()
                },
                "test",
            )
            .await
            .unwrap();
        let report = reconciler(&sup).sweep().await.unwrap();
        assert_eq!(report.adopted, 0);
        assert!(sup.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_starting_becomes_error() {
        let ccs = LocalCcs::new();
        let sup = supervisor_with(&ccs, 7001..=7010);
        let mut stale = DeploymentRecord::starting("stuck", "echo_stuck", "echo", "cpu", 7003);
        stale.deployed_at = Utc::now() - chrono::Duration::hours(3);
        sup.store().insert(&stale).await.unwrap();
        sup.ports().reserve(7003, "stuck");

        let report = reconciler(&sup).sweep().await.unwrap();
        assert_eq!(report.expired, 1);
        let after = sup.get("stuck").await.unwrap();
        assert_eq!(after.status, DeploymentStatus::Error);
        assert!(!sup.ports().is_reserved(7003));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let ccs = LocalCcs::new();
        let sup = supervisor_with(&ccs, 7001..=7010);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(reconciler(&sup).run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(150)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
