use k8s_openapi::api::batch::v1::JobStatus;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Runs `template` once on every node matching its node selector, as a
/// single run-to-completion Job.
#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[kube(
    group = "dj.dysproz.io",
    version = "v1",
    kind = "DaemonJob",
    namespaced,
    status = "DaemonJobStatus",
    shortname = "dj"
)]
pub struct DaemonJobSpec {
    /// Pod template for each per-node run. `spec.nodeSelector` picks the
    /// eligible nodes; affinity is filled in by the controller.
    pub template: PodTemplateSpec,

    /// Label query over pods, passed through to the Job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    #[serde(rename = "manualSelector", skip_serializing_if = "Option::is_none")]
    pub manual_selector: Option<bool>,

    #[serde(rename = "ttlSecondsAfterFinished", skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,

    #[serde(rename = "backoffLimit", skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,

    #[serde(rename = "activeDeadlineSeconds", skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
}

/// Status of a DaemonJob: the managed Job's last observed status, copied
/// as a whole.
pub type DaemonJobStatus = JobStatus;
