use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy},
    Client, ResourceExt,
};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{crd::DaemonJob, Error, Result};

/// Operations the DaemonJob reconciler needs from the API server.
///
/// Reads return `Ok(None)` for missing objects. Writes surface
/// `Error::Invalid` when the server rejects the object as invalid and
/// `Error::NotFound` for missing targets.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn get_daemon_job(&self, namespace: &str, name: &str) -> Result<Option<DaemonJob>>;

    /// List nodes whose labels contain every pair in `selector`.
    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    async fn create_job(&self, job: &Job) -> Result<Job>;

    /// Replace an existing Job. `job` must carry the resource version it
    /// was read at.
    async fn replace_job(&self, job: &Job) -> Result<Job>;

    async fn delete_job(
        &self,
        namespace: &str,
        name: &str,
        propagation: PropagationPolicy,
    ) -> Result<()>;

    /// Persist `daemon_job.status` through the status subresource.
    async fn update_daemon_job_status(&self, daemon_job: &DaemonJob) -> Result<()>;
}

/// `PlatformClient` backed by a live cluster connection.
pub struct KubePlatformClient {
    client: Client,
}

impl KubePlatformClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn daemon_jobs(&self, namespace: &str) -> Api<DaemonJob> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Renders an equality label selector, e.g. `disk=ssd,zone=a`.
pub fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn namespace_of(job: &Job) -> Result<String> {
    job.namespace()
        .ok_or_else(|| Error::Validation(format!("Job {} has no namespace", job.name_any())))
}

#[async_trait]
impl PlatformClient for KubePlatformClient {
    async fn get_daemon_job(&self, namespace: &str, name: &str) -> Result<Option<DaemonJob>> {
        Ok(self.daemon_jobs(namespace).get_opt(name).await?)
    }

    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&label_selector(selector));
        }
        Ok(api.list(&params).await?.items)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.jobs(namespace).get_opt(name).await?)
    }

    async fn create_job(&self, job: &Job) -> Result<Job> {
        let namespace = namespace_of(job)?;
        Ok(self.jobs(&namespace).create(&PostParams::default(), job).await?)
    }

    async fn replace_job(&self, job: &Job) -> Result<Job> {
        let namespace = namespace_of(job)?;
        Ok(self
            .jobs(&namespace)
            .replace(&job.name_any(), &PostParams::default(), job)
            .await?)
    }

    async fn delete_job(
        &self,
        namespace: &str,
        name: &str,
        propagation: PropagationPolicy,
    ) -> Result<()> {
        let params = DeleteParams {
            propagation_policy: Some(propagation),
            ..Default::default()
        };
        match self.jobs(namespace).delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(job = %name, namespace = %namespace, "job already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_daemon_job_status(&self, daemon_job: &DaemonJob) -> Result<()> {
        let namespace = daemon_job.namespace().unwrap_or_default();
        self.daemon_jobs(&namespace)
            .replace_status(
                &daemon_job.name_any(),
                &PostParams::default(),
                status_body(daemon_job)?,
            )
            .await?;
        Ok(())
    }
}

/// Body for a status subresource PUT. The whole status is replaced, so
/// fields the Job no longer reports are cleared rather than merged.
fn status_body(daemon_job: &DaemonJob) -> Result<Vec<u8>> {
    let mut body = serde_json::to_value(daemon_job)?;
    if let Some(object) = body.as_object_mut() {
        object
            .entry("status")
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
    }
    Ok(serde_json::to_vec(&body)?)
}
