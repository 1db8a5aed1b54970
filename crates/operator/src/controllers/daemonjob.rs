use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, PropagationPolicy},
    runtime::{
        controller::{self, Action, Controller},
        reflector::ObjectRef,
        watcher::Config,
    },
    Client, ResourceExt,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ControllerConfig,
    crd::DaemonJob,
    kubernetes::{build_job, converge_job, job_name, node_selector, set_controller_owner, PlatformClient},
    metrics, Error, Result,
};

/// Namespace and name of the DaemonJob a reconciliation pass works on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<&DaemonJob> for NamespacedName {
    fn from(daemon_job: &DaemonJob) -> Self {
        Self::new(daemon_job.namespace().unwrap_or_default(), daemon_job.name_any())
    }
}

/// Result of a pass that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Converged, or nothing to converge.
    Done,
    /// The managed Job was deleted to clear an invalid update; run again
    /// after the delay to recreate it.
    RetryAfter(Duration),
}

/// Maps any change to a Node onto every known DaemonJob, since a node
/// joining or leaving can change the eligible set of each of them.
pub fn daemon_job_keys<'a, I>(daemon_jobs: I) -> Vec<ObjectRef<DaemonJob>>
where
    I: IntoIterator<Item = &'a DaemonJob>,
{
    daemon_jobs.into_iter().map(ObjectRef::from_obj).collect()
}

pub struct DaemonJobController {
    client: Arc<dyn PlatformClient>,
    config: ControllerConfig,
}

impl DaemonJobController {
    pub fn new(client: Arc<dyn PlatformClient>, config: ControllerConfig) -> Self {
        Self { client, config }
    }

    /// Watches DaemonJobs and all Nodes, reconciling until the process
    /// receives a shutdown signal.
    ///
    /// Managed Jobs are not watched: a pass reads the Job live, and its
    /// status alone must not retrigger a spec overwrite.
    pub async fn run(self: Arc<Self>, client: Client) {
        info!("Starting DaemonJob controller");

        let daemon_jobs: Api<DaemonJob> = match &self.config.namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        let nodes: Api<Node> = Api::all(client);

        let controller = Controller::new(daemon_jobs, Config::default());
        let store = controller.store();

        controller
            .watches(nodes, Config::default(), move |_node| {
                daemon_job_keys(store.state().iter().map(|dj| dj.as_ref()))
            })
            .with_config(controller::Config::default().concurrency(self.config.concurrency))
            .shutdown_on_signal()
            .run(Self::reconcile_object, Self::error_policy, self)
            .for_each(|res| async move {
                match res {
                    Ok((_daemon_job, _action)) => {}
                    Err(e) => error!("Reconciliation error: {}", e),
                }
            })
            .await;

        info!("DaemonJob controller stopped");
    }

    async fn reconcile_object(daemon_job: Arc<DaemonJob>, ctx: Arc<Self>) -> Result<Action> {
        let key = NamespacedName::from(daemon_job.as_ref());
        match ctx.reconcile(&key).await? {
            Outcome::Done => Ok(Action::await_change()),
            Outcome::RetryAfter(delay) => Ok(Action::requeue(delay)),
        }
    }

    fn error_policy(daemon_job: Arc<DaemonJob>, err: &Error, ctx: Arc<Self>) -> Action {
        error!("Error reconciling DaemonJob {}: {}", daemon_job.name_any(), err);
        Action::requeue(ctx.config.error_requeue)
    }

    /// Runs one reconciliation pass for `key`. An `Err` is fatal for the
    /// pass and is left to the caller to retry.
    pub async fn reconcile(&self, key: &NamespacedName) -> Result<Outcome> {
        let result = self.reconcile_pass(key).await;
        metrics::record_outcome(match &result {
            Ok(Outcome::Done) => "done",
            Ok(Outcome::RetryAfter(_)) => "retry",
            Err(_) => "error",
        });
        result
    }

    async fn reconcile_pass(&self, key: &NamespacedName) -> Result<Outcome> {
        info!("Reconciling DaemonJob {}", key);

        let Some(mut daemon_job) = self.client.get_daemon_job(&key.namespace, &key.name).await? else {
            debug!("DaemonJob {} not found, nothing to do", key);
            forget_eligible_nodes(key);
            return Ok(Outcome::Done);
        };

        if daemon_job.metadata.deletion_timestamp.is_some() {
            debug!("DaemonJob {} is being deleted, leaving cleanup to garbage collection", key);
            forget_eligible_nodes(key);
            return Ok(Outcome::Done);
        }

        let selector = node_selector(&daemon_job);
        let nodes = match self.client.list_nodes(&selector).await {
            Ok(nodes) => nodes,
            Err(Error::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let replicas = i32::try_from(nodes.len()).unwrap_or(i32::MAX);
        metrics::ELIGIBLE_NODES
            .with_label_values(&[key.namespace.as_str(), key.name.as_str()])
            .set(i64::from(replicas));
        debug!(daemonjob = %key, replicas, "Computed eligible nodes");

        let mut desired = build_job(&daemon_job, replicas, &key.name, &self.config.kind_label);
        set_controller_owner(&daemon_job, &mut desired)?;

        let job = match self.apply_job(&daemon_job, desired).await {
            Ok(job) => job,
            Err(Error::Invalid(reason)) => {
                let name = job_name(&key.name);
                warn!(
                    "Job {}/{} rejected as invalid, deleting it for recreation: {}",
                    key.namespace, name, reason
                );
                if let Err(e) = self
                    .client
                    .delete_job(&key.namespace, &name, PropagationPolicy::Background)
                    .await
                {
                    warn!("Failed to delete Job {}/{}: {}", key.namespace, name, e);
                }
                metrics::JOB_REPLACEMENTS_TOTAL.inc();
                return Ok(Outcome::RetryAfter(self.config.conflict_requeue));
            }
            Err(e) => return Err(e),
        };

        daemon_job.status = Some(job.status.unwrap_or_default());
        self.client.update_daemon_job_status(&daemon_job).await?;

        info!("Reconciled DaemonJob {} with {} replica(s)", key, replicas);
        Ok(Outcome::Done)
    }

    /// Creates the Job if missing, otherwise overwrites its spec and
    /// annotations with `desired` and replaces it when anything changed.
    async fn apply_job(&self, daemon_job: &DaemonJob, desired: Job) -> Result<Job> {
        let namespace = desired.namespace().unwrap_or_default();
        let name = desired.name_any();

        let Some(current) = self.client.get_job(&namespace, &name).await? else {
            info!("Creating Job {}/{}", namespace, name);
            return self.client.create_job(&desired).await;
        };

        let mut updated = current.clone();
        converge_job(&desired, &mut updated);
        set_controller_owner(daemon_job, &mut updated)?;

        if updated == current {
            debug!("Job {}/{} is up to date", namespace, name);
            return Ok(current);
        }

        info!("Updating Job {}/{}", namespace, name);
        self.client.replace_job(&updated).await
    }
}

/// Drops the eligible-node series of a DaemonJob that is gone.
fn forget_eligible_nodes(key: &NamespacedName) {
    // Absent series is not an error.
    let _ = metrics::ELIGIBLE_NODES
        .remove_label_values(&[key.namespace.as_str(), key.name.as_str()]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DaemonJobSpec;
    use crate::kubernetes::client::MockPlatformClient;
    use k8s_openapi::api::batch::v1::{JobSpec, JobStatus};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::collections::BTreeMap;

    const NAMESPACE: &str = "default";
    const NAME: &str = "unit-daemonjob";

    fn key() -> NamespacedName {
        NamespacedName::new(NAMESPACE, NAME)
    }

    fn daemon_job() -> DaemonJob {
        let mut dj = DaemonJob::new(
            NAME,
            DaemonJobSpec {
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "test-container".to_string(),
                            image: Some("test-image".to_string()),
                            ..Default::default()
                        }],
                        restart_policy: Some("Always".to_string()),
                        ..Default::default()
                    }),
                },
                selector: None,
                manual_selector: None,
                ttl_seconds_after_finished: None,
                backoff_limit: None,
                active_deadline_seconds: None,
            },
        );
        dj.metadata.namespace = Some(NAMESPACE.to_string());
        dj.metadata.uid = Some("dj-uid".to_string());
        dj
    }

    fn nodes(count: usize) -> Vec<Node> {
        (0..count)
            .map(|i| Node {
                metadata: ObjectMeta {
                    name: Some(format!("node-{}", i)),
                    ..Default::default()
                },
                ..Default::default()
            })
            .collect()
    }

    fn controller(client: MockPlatformClient) -> DaemonJobController {
        DaemonJobController::new(Arc::new(client), ControllerConfig::default())
    }

    fn existing_job(completions: i32) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some(format!("{}-job", NAME)),
                namespace: Some(NAMESPACE.to_string()),
                resource_version: Some("7".to_string()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                completions: Some(completions),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_daemon_job_is_done_without_writes() {
        let mut client = MockPlatformClient::new();
        client.expect_get_daemon_job().times(1).returning(|_, _| Ok(None));

        let outcome = controller(client).reconcile(&key()).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
    }

    #[tokio::test]
    async fn missing_daemon_job_drops_its_node_gauge() {
        metrics::ELIGIBLE_NODES
            .with_label_values(&[NAMESPACE, "gone-daemonjob"])
            .set(4);
        assert!(metrics::gather_metrics().contains("name=\"gone-daemonjob\""));

        let mut client = MockPlatformClient::new();
        client.expect_get_daemon_job().times(1).returning(|_, _| Ok(None));

        let key = NamespacedName::new(NAMESPACE, "gone-daemonjob");
        assert_eq!(controller(client).reconcile(&key).await.unwrap(), Outcome::Done);
        assert!(!metrics::gather_metrics().contains("name=\"gone-daemonjob\""));
    }

    #[tokio::test]
    async fn deleting_daemon_job_drops_its_node_gauge() {
        let mut dj = daemon_job();
        dj.metadata.name = Some("draining-daemonjob".to_string());
        dj.metadata.deletion_timestamp = Some(Time(Default::default()));
        metrics::ELIGIBLE_NODES
            .with_label_values(&[NAMESPACE, "draining-daemonjob"])
            .set(2);

        let mut client = MockPlatformClient::new();
        client
            .expect_get_daemon_job()
            .returning(move |_, _| Ok(Some(dj.clone())));

        let key = NamespacedName::new(NAMESPACE, "draining-daemonjob");
        assert_eq!(controller(client).reconcile(&key).await.unwrap(), Outcome::Done);
        assert!(!metrics::gather_metrics().contains("name=\"draining-daemonjob\""));
    }

    #[tokio::test]
    async fn deleting_daemon_job_is_left_alone() {
        let mut dj = daemon_job();
        dj.metadata.deletion_timestamp = Some(Time(Default::default()));

        let mut client = MockPlatformClient::new();
        client
            .expect_get_daemon_job()
            .returning(move |_, _| Ok(Some(dj.clone())));

        let outcome = controller(client).reconcile(&key()).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
    }

    #[tokio::test]
    async fn get_failure_is_fatal() {
        let mut client = MockPlatformClient::new();
        client
            .expect_get_daemon_job()
            .returning(|_, _| Err(Error::Kubernetes("connection refused".to_string())));

        let err = controller(client).reconcile(&key()).await.unwrap_err();
        assert!(matches!(err, Error::Kubernetes(_)));
    }

    #[tokio::test]
    async fn node_list_not_found_means_zero_replicas() {
        let dj = daemon_job();
        let mut client = MockPlatformClient::new();
        client
            .expect_get_daemon_job()
            .returning(move |_, _| Ok(Some(dj.clone())));
        client
            .expect_list_nodes()
            .returning(|_| Err(Error::NotFound("nodes".to_string())));
        client.expect_get_job().returning(|_, _| Ok(None));
        client
            .expect_create_job()
            .withf(|job| {
                let spec = job.spec.as_ref().unwrap();
                spec.parallelism == Some(0) && spec.completions == Some(0)
            })
            .times(1)
            .returning(|job| Ok(job.clone()));
        client.expect_update_daemon_job_status().times(1).returning(|_| Ok(()));

        let outcome = controller(client).reconcile(&key()).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
    }

    #[tokio::test]
    async fn node_list_failure_is_fatal() {
        let dj = daemon_job();
        let mut client = MockPlatformClient::new();
        client
            .expect_get_daemon_job()
            .returning(move |_, _| Ok(Some(dj.clone())));
        client
            .expect_list_nodes()
            .returning(|_| Err(Error::Kubernetes("timeout".to_string())));

        assert!(controller(client).reconcile(&key()).await.is_err());
    }

    #[tokio::test]
    async fn selector_is_taken_from_pod_template() {
        let mut dj = daemon_job();
        dj.spec.template.spec.as_mut().unwrap().node_selector =
            Some(BTreeMap::from([("disk".to_string(), "ssd".to_string())]));

        let mut client = MockPlatformClient::new();
        client
            .expect_get_daemon_job()
            .returning(move |_, _| Ok(Some(dj.clone())));
        client
            .expect_list_nodes()
            .withf(|selector| selector.get("disk").map(String::as_str) == Some("ssd"))
            .returning(|_| Ok(nodes(2)));
        client.expect_get_job().returning(|_, _| Ok(None));
        client
            .expect_create_job()
            .withf(|job| job.spec.as_ref().unwrap().completions == Some(2))
            .returning(|job| Ok(job.clone()));
        client.expect_update_daemon_job_status().returning(|_| Ok(()));

        assert_eq!(controller(client).reconcile(&key()).await.unwrap(), Outcome::Done);
    }

    #[tokio::test]
    async fn invalid_update_deletes_job_and_retries() {
        let dj = daemon_job();
        let mut client = MockPlatformClient::new();
        client
            .expect_get_daemon_job()
            .returning(move |_, _| Ok(Some(dj.clone())));
        client.expect_list_nodes().returning(|_| Ok(nodes(0)));
        client.expect_get_job().returning(|_, _| Ok(Some(existing_job(6))));
        client
            .expect_replace_job()
            .times(1)
            .returning(|_| Err(Error::Invalid("spec.completions: field is immutable".to_string())));
        client
            .expect_delete_job()
            .withf(|ns, name, propagation| {
                ns.to_string() == NAMESPACE
                    && name.to_string() == "unit-daemonjob-job"
                    && matches!(propagation, PropagationPolicy::Background)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let outcome = controller(client).reconcile(&key()).await.unwrap();
        assert_eq!(outcome, Outcome::RetryAfter(ControllerConfig::default().conflict_requeue));
    }

    #[tokio::test]
    async fn failed_delete_after_invalid_update_still_retries() {
        let dj = daemon_job();
        let mut client = MockPlatformClient::new();
        client
            .expect_get_daemon_job()
            .returning(move |_, _| Ok(Some(dj.clone())));
        client.expect_list_nodes().returning(|_| Ok(nodes(1)));
        client.expect_get_job().returning(|_, _| Ok(Some(existing_job(6))));
        client
            .expect_replace_job()
            .returning(|_| Err(Error::Invalid("immutable".to_string())));
        client
            .expect_delete_job()
            .returning(|_, _, _| Err(Error::Kubernetes("forbidden".to_string())));

        let outcome = controller(client).reconcile(&key()).await.unwrap();
        assert!(matches!(outcome, Outcome::RetryAfter(_)));
    }

    #[tokio::test]
    async fn other_write_failures_are_fatal() {
        let dj = daemon_job();
        let mut client = MockPlatformClient::new();
        client
            .expect_get_daemon_job()
            .returning(move |_, _| Ok(Some(dj.clone())));
        client.expect_list_nodes().returning(|_| Ok(nodes(3)));
        client.expect_get_job().returning(|_, _| Ok(Some(existing_job(6))));
        client
            .expect_replace_job()
            .returning(|_| Err(Error::Kubernetes("the object has been modified".to_string())));
        client.expect_delete_job().never();

        let err = controller(client).reconcile(&key()).await.unwrap_err();
        assert!(matches!(err, Error::Kubernetes(_)));
    }

    #[tokio::test]
    async fn unchanged_job_is_not_rewritten() {
        let dj = daemon_job();
        let mut current = build_job(&dj, 2, NAME, "daemonjob");
        set_controller_owner(&dj, &mut current).unwrap();
        current.metadata.resource_version = Some("3".to_string());
        current.status = Some(JobStatus {
            active: Some(2),
            ready: Some(1),
            completed_indexes: Some("0".to_string()),
            ..Default::default()
        });
        let observed = current.status.clone();

        let mut client = MockPlatformClient::new();
        client
            .expect_get_daemon_job()
            .returning(move |_, _| Ok(Some(dj.clone())));
        client.expect_list_nodes().returning(|_| Ok(nodes(2)));
        client
            .expect_get_job()
            .returning(move |_, _| Ok(Some(current.clone())));
        client.expect_replace_job().never();
        client
            .expect_update_daemon_job_status()
            .withf(move |dj| dj.status == observed)
            .times(1)
            .returning(|_| Ok(()));

        assert_eq!(controller(client).reconcile(&key()).await.unwrap(), Outcome::Done);
    }

    #[tokio::test]
    async fn status_write_failure_is_fatal() {
        let dj = daemon_job();
        let mut client = MockPlatformClient::new();
        client
            .expect_get_daemon_job()
            .returning(move |_, _| Ok(Some(dj.clone())));
        client.expect_list_nodes().returning(|_| Ok(nodes(1)));
        client.expect_get_job().returning(|_, _| Ok(None));
        client.expect_create_job().returning(|job| Ok(job.clone()));
        client
            .expect_update_daemon_job_status()
            .returning(|_| Err(Error::Kubernetes("status unavailable".to_string())));

        assert!(controller(client).reconcile(&key()).await.is_err());
    }

    #[test]
    fn node_events_fan_out_to_every_daemon_job() {
        let mut other = daemon_job();
        other.metadata.name = Some("other".to_string());
        other.metadata.namespace = Some("batch".to_string());
        let daemon_jobs = [daemon_job(), other];

        let keys = daemon_job_keys(daemon_jobs.iter());
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].name, NAME);
        assert_eq!(keys[0].namespace.as_deref(), Some(NAMESPACE));
        assert_eq!(keys[1].name, "other");
        assert_eq!(keys[1].namespace.as_deref(), Some("batch"));
        assert!(daemon_job_keys(std::iter::empty()).is_empty());
    }

    #[test]
    fn key_display() {
        assert_eq!(key().to_string(), "default/unit-daemonjob");
    }
}
